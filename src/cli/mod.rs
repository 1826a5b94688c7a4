//! SF-017: CLI subcommands: init, validate, plan, apply, destroy, drift,
//! status, output, unlock, completions.
//!
//! Cloud calls go to the simulated cloud persisted at
//! `<state-dir>/cloud.json`.

use crate::cloud::simulated::SimulatedCloud;
use crate::cloud::CloudRegistry;
use crate::core::error::{Error, Result};
use crate::core::executor::{self, ApplyConfig, ApplyReport};
use crate::core::parser::{self, LoadedConfig};
use crate::core::state::{self, FileStateStore, StateStore};
use crate::core::{planner, types};
use crate::tripwire::{drift, eventlog};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "siteform",
    version,
    about = "Dependency-ordered provisioning for static website stacks"
)]
pub struct Cli {
    /// More log output on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Where the state, lease, event log and simulated cloud live.
#[derive(Args, Debug, Clone)]
pub struct StateArgs {
    /// State directory
    #[arg(long, env = "SITEFORM_STATE_DIR", default_value = "state")]
    pub state_dir: PathBuf,
}

/// Overrides for the declaration's `policy` section.
#[derive(Args, Debug, Clone, Default)]
pub struct ExecArgs {
    /// Maximum operations in flight (overrides policy.parallelism)
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Per-operation timeout in seconds (overrides policy.operation_timeout_secs)
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new siteform project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate siteform.yaml without calling the cloud
    Validate {
        /// Path to siteform.yaml
        #[arg(short, long, default_value = "siteform.yaml")]
        file: PathBuf,
    },

    /// Show execution plan (diff declarations vs state)
    Plan {
        /// Path to siteform.yaml
        #[arg(short, long, default_value = "siteform.yaml")]
        file: PathBuf,

        #[command(flatten)]
        state: StateArgs,

        /// Read live resources first and plan repairs for drift
        #[arg(long)]
        refresh: bool,
    },

    /// Provision resources to match the declarations
    Apply {
        /// Path to siteform.yaml
        #[arg(short, long, default_value = "siteform.yaml")]
        file: PathBuf,

        #[command(flatten)]
        state: StateArgs,

        #[command(flatten)]
        exec: ExecArgs,

        /// Read live resources first and repair drift
        #[arg(long)]
        refresh: bool,
    },

    /// Delete every resource recorded in state
    Destroy {
        /// Path to siteform.yaml
        #[arg(short, long, default_value = "siteform.yaml")]
        file: PathBuf,

        #[command(flatten)]
        state: StateArgs,

        #[command(flatten)]
        exec: ExecArgs,

        /// Actually delete; without it only the plan is shown
        #[arg(long)]
        yes: bool,
    },

    /// Detect changes made outside siteform (tripwire)
    Drift {
        /// Path to siteform.yaml
        #[arg(short, long, default_value = "siteform.yaml")]
        file: PathBuf,

        #[command(flatten)]
        state: StateArgs,

        /// Exit non-zero on any drift (for CI/cron)
        #[arg(long)]
        tripwire: bool,
    },

    /// Show current state
    Status {
        #[command(flatten)]
        state: StateArgs,
    },

    /// Print outputs computed from state
    Output {
        /// Path to siteform.yaml
        #[arg(short, long, default_value = "siteform.yaml")]
        file: PathBuf,

        #[command(flatten)]
        state: StateArgs,

        /// Print only this output, unquoted
        name: Option<String>,

        /// Print all outputs as a JSON object
        #[arg(long)]
        json: bool,
    },

    /// Remove a lease left behind by a crashed run
    Unlock {
        #[command(flatten)]
        state: StateArgs,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Dispatch a CLI command.
pub async fn dispatch(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Plan {
            file,
            state,
            refresh,
        } => cmd_plan(&file, &state.state_dir, refresh).await,
        Commands::Apply {
            file,
            state,
            exec,
            refresh,
        } => cmd_apply(&file, &state.state_dir, &exec, refresh).await,
        Commands::Destroy {
            file,
            state,
            exec,
            yes,
        } => cmd_destroy(&file, &state.state_dir, &exec, yes).await,
        Commands::Drift {
            file,
            state,
            tripwire,
        } => cmd_drift(&file, &state.state_dir, tripwire).await,
        Commands::Status { state } => cmd_status(&state.state_dir),
        Commands::Output {
            file,
            state,
            name,
            json,
        } => cmd_output(&file, &state.state_dir, name.as_deref(), json),
        Commands::Unlock { state } => cmd_unlock(&state.state_dir),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "siteform", &mut std::io::stdout());
            Ok(())
        }
    }
}

const INIT_TEMPLATE: &str = r#"version: "1.0"
name: my-site
description: "Static website managed by siteform"

params:
  domain: example.com

providers:
  edge:
    region: us-east-1

resources:
  zone:
    type: dns_zone
    protected: true
    attributes:
      name: "{{params.domain}}"

  cert-validation:
    type: dns_record
    attributes:
      zone_id: "${zone.zone_id}"
      name: "_acme-challenge.{{params.domain}}"
      record_type: CNAME

  cert:
    type: tls_certificate
    provider: edge
    depends_on: [cert-validation]
    attributes:
      domain_name: "{{params.domain}}"
      subject_alternative_names: ["www.{{params.domain}}"]

  bucket:
    type: bucket
    attributes:
      bucket: "www.{{params.domain}}"

  cdn:
    type: cdn_distribution
    attributes:
      origin_domain_name: "${bucket.bucket_regional_domain_name}"
      certificate_arn: "${cert.arn}"
      aliases: ["www.{{params.domain}}"]
      default_root_object: index.html

  bucket-policy:
    type: access_policy
    attributes:
      bucket: "${bucket.id}"
      policy: "allow s3:GetObject from ${cdn.arn}"

  www:
    type: dns_record
    attributes:
      zone_id: "${zone.zone_id}"
      name: "www.{{params.domain}}"
      record_type: A
      alias_target: "${cdn.domain_name}"

outputs:
  site_url: "https://${www.fqdn}/"
  distribution_domain: "${cdn.domain_name}"

policy:
  parallelism: 4
  operation_timeout_secs: 1800
  tripwire: true
"#;

fn cmd_init(path: &Path) -> Result<()> {
    let config_path = path.join("siteform.yaml");
    if config_path.exists() {
        return Err(Error::Command(format!(
            "{} already exists",
            config_path.display()
        )));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).map_err(|e| Error::state(&state_dir, e))?;
    std::fs::write(&config_path, INIT_TEMPLATE).map_err(|e| Error::state(&config_path, e))?;

    println!("Initialized siteform project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<()> {
    let loaded = LoadedConfig::load_file(file)?;
    println!(
        "OK: {} ({} resources, {} outputs)",
        loaded.config.name,
        loaded.config.resources.len(),
        loaded.config.outputs.len()
    );
    Ok(())
}

/// Open the simulated cloud for a state directory and build its handles.
fn open_cloud(state_dir: &Path, config: &types::SiteConfig) -> Result<CloudRegistry> {
    let path = state_dir.join("cloud.json");
    let cloud = SimulatedCloud::open(&path).map_err(|e| Error::state(&path, e))?;
    Ok(cloud.registry(&config.providers))
}

fn apply_config(policy: &types::Policy, state_dir: &Path, exec: &ExecArgs) -> ApplyConfig {
    let mut cfg = ApplyConfig::from_policy(policy);
    if let Some(p) = exec.parallelism {
        cfg.parallelism = p.max(1);
    }
    if let Some(t) = exec.timeout {
        cfg.operation_timeout = Duration::from_secs(t.max(1));
    }
    if policy.tripwire {
        cfg.event_log = Some(eventlog::event_log_path(state_dir));
    }
    cfg
}

async fn cmd_plan(file: &Path, state_dir: &Path, refresh: bool) -> Result<()> {
    let loaded = LoadedConfig::load_file(file)?;
    let store = FileStateStore::new(state_dir);
    let current = store.load()?;
    let mut plan = planner::plan(&loaded.config, &loaded.order, &current)?;

    if refresh {
        let registry = open_cloud(state_dir, &loaded.config)?;
        let findings = drift::detect_drift(&registry, &current).await;
        drift::mark_for_refresh(&mut plan, &findings);
    }

    print_plan(&plan);
    Ok(())
}

/// Display a plan to stdout.
fn print_plan(plan: &types::ExecutionPlan) {
    println!("Planning: {} ({} resources)", plan.name, plan.changes.len());
    println!();

    for change in &plan.changes {
        println!("  {} {}", symbol(change.action), change.description);
    }

    println!();
    println!(
        "Plan: {} to add, {} to change, {} to destroy, {} unchanged.",
        plan.to_create, plan.to_update, plan.to_delete, plan.unchanged
    );
}

fn symbol(action: types::PlanAction) -> &'static str {
    match action {
        types::PlanAction::Create => "+",
        types::PlanAction::Update => "~",
        types::PlanAction::Delete => "-",
        types::PlanAction::NoOp => " ",
    }
}

fn print_report(report: &ApplyReport, verb: &str) {
    for op in &report.operations {
        println!(
            "  {} {} ({}, {:.1}s)",
            symbol(op.action),
            op.resource_id,
            op.action,
            op.duration_seconds
        );
    }
    println!();
    println!(
        "{} complete: {} created, {} updated, {} deleted, {} unchanged ({:.1}s).",
        verb,
        report.count(types::PlanAction::Create),
        report.count(types::PlanAction::Update),
        report.count(types::PlanAction::Delete),
        report.unchanged,
        report.total_seconds
    );
    print_outputs(&report.outputs);
}

fn print_outputs(outputs: &indexmap::IndexMap<String, serde_json::Value>) {
    if outputs.is_empty() {
        return;
    }
    println!();
    println!("Outputs:");
    for (name, value) in outputs {
        println!("  {} = {}", name, value);
    }
}

async fn cmd_apply(file: &Path, state_dir: &Path, exec: &ExecArgs, refresh: bool) -> Result<()> {
    let loaded = LoadedConfig::load_file(file)?;
    let registry = open_cloud(state_dir, &loaded.config)?;
    let store = FileStateStore::new(state_dir);
    let mut cfg = apply_config(&loaded.config.policy, state_dir, exec);
    cfg.refresh = refresh;

    let report = executor::apply(&loaded, &registry, &store, &cfg).await?;
    print_report(&report, "Apply");
    Ok(())
}

async fn cmd_destroy(file: &Path, state_dir: &Path, exec: &ExecArgs, yes: bool) -> Result<()> {
    let config = parser::parse_config_file(file)?;
    let store = FileStateStore::new(state_dir);

    if !yes {
        let plan = planner::plan_destroy(&config.name, &store.load()?)?;
        print_plan(&plan);
        println!();
        println!("Nothing deleted. Re-run with --yes to destroy.");
        return Ok(());
    }

    let registry = open_cloud(state_dir, &config)?;
    let cfg = apply_config(&config.policy, state_dir, exec);
    let report = executor::destroy(&config, &registry, &store, &cfg).await?;
    print_report(&report, "Destroy");
    Ok(())
}

async fn cmd_drift(file: &Path, state_dir: &Path, tripwire_mode: bool) -> Result<()> {
    let config = parser::parse_config_file(file)?;
    let current = FileStateStore::new(state_dir).load()?;
    let registry = open_cloud(state_dir, &config)?;

    println!("Checking {} ({} resources)...", config.name, current.resources.len());
    let findings = drift::detect_drift(&registry, &current).await;
    if config.policy.tripwire {
        drift::record_findings(Some(&eventlog::event_log_path(state_dir)), &findings);
    }

    if findings.is_empty() {
        println!("No drift detected.");
        return Ok(());
    }

    for f in &findings {
        println!("  DRIFTED: {} ({})", f.resource_id, f.detail);
        println!("    Expected: {}", f.expected_hash);
        println!("    Actual:   {}", f.actual_hash);
    }
    println!();
    println!("Drift detected: {} resource(s)", findings.len());
    if tripwire_mode {
        return Err(Error::Command(format!("{} drift finding(s)", findings.len())));
    }
    Ok(())
}

fn cmd_status(state_dir: &Path) -> Result<()> {
    let store = FileStateStore::new(state_dir);
    if !store.state_path().exists() {
        println!("No state found. Run `siteform apply` first.");
        return Ok(());
    }
    let current = store.load()?;

    println!("State: {}", store.location());
    println!("  Generated: {}", current.generated_at);
    println!("  Generator: {}", current.generator);
    if let Some(lease) = state::read_lease(state_dir)? {
        println!(
            "  Locked by: {} (pid {}, since {})",
            lease.holder, lease.pid, lease.acquired_at
        );
    }
    println!("  Resources: {}", current.resources.len());

    for (id, rs) in &current.resources {
        let duration = rs
            .duration_seconds
            .map(|d| format!(" ({:.2}s)", d))
            .unwrap_or_default();
        let protected = if rs.protected { " [protected]" } else { "" };
        let pending = if rs.spec_hash.is_empty() { " [not ready]" } else { "" };
        println!(
            "    {}: {} {}{}{}{}",
            id, rs.kind, rs.cloud_id, protected, pending, duration
        );
    }
    Ok(())
}

fn cmd_output(file: &Path, state_dir: &Path, name: Option<&str>, json: bool) -> Result<()> {
    let config = parser::parse_config_file(file)?;
    let current = FileStateStore::new(state_dir).load()?;
    let outputs = executor::compute_outputs(&config.outputs, &current);

    if let Some(name) = name {
        let value = outputs.get(name).ok_or_else(|| {
            Error::Command(format!("output '{}' is not available; apply first", name))
        })?;
        println!("{}", types::json_value_to_string(value));
        return Ok(());
    }

    if json {
        let text = serde_json::to_string_pretty(&outputs)
            .map_err(|e| Error::Command(format!("cannot encode outputs: {}", e)))?;
        println!("{}", text);
    } else if outputs.is_empty() {
        println!("No outputs available. Run `siteform apply` first.");
    } else {
        for (name, value) in &outputs {
            println!("{} = {}", name, value);
        }
    }
    Ok(())
}

fn cmd_unlock(state_dir: &Path) -> Result<()> {
    if state::force_unlock(state_dir)? {
        println!("Lease removed from {}", state_dir.display());
    } else {
        println!("No lease held in {}", state_dir.display());
    }
    Ok(())
}
