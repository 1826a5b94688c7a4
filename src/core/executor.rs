//! SF-012: Executor. Orchestration loop for apply and destroy.
//!
//! lease → load state → plan → for each ready operation: resolve → cloud
//! call → wait until ready → hash → save state → events.
//!
//! Operations whose dependencies have finished run concurrently on a
//! `JoinSet`, up to `parallelism` at a time. Workers only talk to the cloud;
//! the coordinating task owns the state and is the only writer.

use super::error::{Error, Result};
use super::parser::LoadedConfig;
use super::planner;
use super::resolver;
use super::state::{default_holder, StateStore};
use super::types::*;
use crate::cloud::{ApiError, CloudRegistry, LiveResource, ResourceApi};
use crate::tripwire::{drift, eventlog, hasher};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// Configuration for an apply run.
#[derive(Debug, Clone)]
pub struct ApplyConfig {
    /// Maximum operations in flight
    pub parallelism: usize,
    /// Budget per operation, including wait-until-ready
    pub operation_timeout: Duration,
    /// Provenance log, if enabled
    pub event_log: Option<PathBuf>,
    /// Name written to the lease
    pub holder: String,
    /// Check for drift first and repair drifted resources
    pub refresh: bool,
}

impl ApplyConfig {
    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            parallelism: policy.parallelism,
            operation_timeout: Duration::from_secs(policy.operation_timeout_secs),
            event_log: None,
            holder: default_holder(),
            refresh: false,
        }
    }
}

/// One completed cloud operation.
#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub resource_id: String,
    pub action: PlanAction,
    pub duration_seconds: f64,
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub run_id: String,
    /// Completed operations, in completion order
    pub operations: Vec<OperationRecord>,
    pub unchanged: u32,
    /// Outputs computed from final state
    pub outputs: IndexMap<String, Value>,
    pub total_seconds: f64,
}

impl ApplyReport {
    pub fn count(&self, action: PlanAction) -> usize {
        self.operations.iter().filter(|o| o.action == action).count()
    }
}

/// Diff declarations against state and execute the plan.
pub async fn apply(
    loaded: &LoadedConfig,
    registry: &CloudRegistry,
    store: &dyn StateStore,
    cfg: &ApplyConfig,
) -> Result<ApplyReport> {
    let _lease = store.acquire_lease(&cfg.holder)?;
    let mut state = store.load()?;
    let mut plan = planner::plan(&loaded.config, &loaded.order, &state)?;

    if cfg.refresh {
        let findings = drift::detect_drift(registry, &state).await;
        drift::record_findings(cfg.event_log.as_deref(), &findings);
        let marked = drift::mark_for_refresh(&mut plan, &findings);
        if marked > 0 {
            tracing::info!(resources = marked, "drifted resources scheduled for repair");
        }
    }

    let mut report = execute(&plan, &loaded.config.resources, registry, store, &mut state, cfg).await?;
    report.outputs = compute_outputs(&loaded.config.outputs, &state);
    Ok(report)
}

/// Delete everything recorded in state, dependents first.
///
/// `config` is consulted for `protected` flags only.
pub async fn destroy(
    config: &SiteConfig,
    registry: &CloudRegistry,
    store: &dyn StateStore,
    cfg: &ApplyConfig,
) -> Result<ApplyReport> {
    let _lease = store.acquire_lease(&cfg.holder)?;
    let mut state = store.load()?;
    let plan = planner::plan_destroy(&config.name, &state)?;
    execute(&plan, &config.resources, registry, store, &mut state, cfg).await
}

/// Evaluate output expressions against state. Outputs whose resources
/// are not in state are left out.
pub fn compute_outputs(outputs: &IndexMap<String, String>, state: &StateFile) -> IndexMap<String, Value> {
    let mut values = IndexMap::new();
    for (name, expr) in outputs {
        match resolver::resolve_expression(expr, &state.resources) {
            Ok(value) => {
                values.insert(name.clone(), value);
            }
            Err(reference) => {
                tracing::debug!(output = %name, %reference, "output not available");
            }
        }
    }
    values
}

/// Refuse the whole plan if it deletes anything protected.
fn check_protected(
    plan: &ExecutionPlan,
    specs: &IndexMap<String, ResourceSpec>,
    state: &StateFile,
) -> Result<()> {
    for change in plan.changes.iter().filter(|c| c.action == PlanAction::Delete) {
        let recorded = state
            .resources
            .get(&change.resource_id)
            .is_some_and(|r| r.protected);
        let declared = specs.get(&change.resource_id).is_some_and(|s| s.protected);
        if recorded || declared {
            tracing::error!(resource = %change.resource_id, "plan deletes a protected resource");
            return Err(Error::ProtectedResource {
                resource: change.resource_id.clone(),
            });
        }
    }
    Ok(())
}

/// Execute a plan against the cloud, saving state after every successful
/// operation. The first failure stops new launches; operations already in
/// flight finish and are recorded before the error is returned.
pub async fn execute(
    plan: &ExecutionPlan,
    specs: &IndexMap<String, ResourceSpec>,
    registry: &CloudRegistry,
    store: &dyn StateStore,
    state: &mut StateFile,
    cfg: &ApplyConfig,
) -> Result<ApplyReport> {
    check_protected(plan, specs, state)?;

    let start = Instant::now();
    let run_id = eventlog::generate_run_id();
    let log = cfg.event_log.as_deref();
    eventlog::record(
        log,
        ProvenanceEvent::ApplyStarted {
            stack: plan.name.clone(),
            run_id: run_id.clone(),
            siteform_version: env!("CARGO_PKG_VERSION").to_string(),
            operations: plan.to_create + plan.to_update + plan.to_delete,
        },
    );

    let in_plan: HashSet<&str> = plan.changes.iter().map(|c| c.resource_id.as_str()).collect();
    let mut pending: Vec<usize> = (0..plan.changes.len()).collect();
    let mut done: HashSet<String> = HashSet::new();
    let mut changed: HashSet<String> = HashSet::new();
    let mut tasks: JoinSet<Finished> = JoinSet::new();
    let mut failure: Option<Error> = None;
    let mut failed = 0u32;
    let parallelism = cfg.parallelism.max(1);

    let mut report = ApplyReport {
        run_id: run_id.clone(),
        operations: Vec::new(),
        unchanged: 0,
        outputs: IndexMap::new(),
        total_seconds: 0.0,
    };

    loop {
        if failure.is_none() {
            let mut i = 0;
            while i < pending.len() && tasks.len() < parallelism {
                let change = &plan.changes[pending[i]];
                let ready = change
                    .after
                    .iter()
                    .all(|d| done.contains(d) || !in_plan.contains(d.as_str()));
                if !ready {
                    i += 1;
                    continue;
                }
                pending.remove(i);

                match prepare(change, specs, registry, state, &changed, cfg) {
                    Ok(Step::Unchanged) => {
                        done.insert(change.resource_id.clone());
                        report.unchanged += 1;
                        // Finishing may have made earlier entries ready.
                        i = 0;
                    }
                    Ok(Step::Launch(op)) => {
                        tracing::info!(
                            resource = %op.resource_id,
                            action = %op.action,
                            kind = %op.api.kind(),
                            "operation started"
                        );
                        eventlog::record(
                            log,
                            ProvenanceEvent::ResourceStarted {
                                resource: op.resource_id.clone(),
                                action: op.action.to_string(),
                            },
                        );
                        tasks.spawn(op.run());
                    }
                    Err(e) => {
                        tracing::error!(resource = %change.resource_id, error = %e, "cannot start operation");
                        failed += 1;
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };

        let finished = match joined {
            Ok(finished) => finished,
            Err(e) => {
                failed += 1;
                keep_first(&mut failure, Error::Worker(e.to_string()));
                continue;
            }
        };

        let Finished {
            resource_id,
            action,
            record,
            accepted,
            result,
            duration,
        } = finished;

        match result {
            Ok(live) => {
                let hash = record.as_ref().map(|r| r.spec_hash.clone()).unwrap_or_default();
                match commit(state, store, &resource_id, action, record, live, duration) {
                    Ok(()) => {
                        tracing::info!(
                            resource = %resource_id,
                            action = %action,
                            seconds = duration.as_secs_f64(),
                            "operation finished"
                        );
                        eventlog::record(
                            log,
                            ProvenanceEvent::ResourceApplied {
                                resource: resource_id.clone(),
                                action: action.to_string(),
                                duration_seconds: duration.as_secs_f64(),
                                hash,
                            },
                        );
                        if action != PlanAction::Delete {
                            changed.insert(resource_id.clone());
                        }
                        done.insert(resource_id.clone());
                        report.operations.push(OperationRecord {
                            resource_id,
                            action,
                            duration_seconds: duration.as_secs_f64(),
                        });
                    }
                    Err(e) => {
                        tracing::error!(resource = %resource_id, error = %e, "cannot save state");
                        failed += 1;
                        keep_first(&mut failure, e);
                    }
                }
            }
            Err(e) => {
                tracing::error!(resource = %resource_id, action = %action, error = %e, "operation failed");
                eventlog::record(
                    log,
                    ProvenanceEvent::ResourceFailed {
                        resource: resource_id.clone(),
                        action: action.to_string(),
                        error: e.to_string(),
                    },
                );
                failed += 1;
                keep_first(&mut failure, e);

                if let (Some(record), Some(accepted)) = (record, accepted) {
                    tracing::warn!(
                        resource = %resource_id,
                        cloud_id = %accepted.cloud_id,
                        "recording resource that never became ready"
                    );
                    if let Err(e) = commit_pending(state, store, &resource_id, record, accepted) {
                        tracing::error!(resource = %resource_id, error = %e, "cannot save state");
                    }
                }
            }
        }
    }

    if failure.is_none() && !pending.is_empty() {
        let stuck: Vec<&str> = pending
            .iter()
            .map(|&i| plan.changes[i].resource_id.as_str())
            .collect();
        failure = Some(Error::Worker(format!(
            "operations never became ready: {}",
            stuck.join(", ")
        )));
    }

    report.total_seconds = start.elapsed().as_secs_f64();
    eventlog::record(
        log,
        ProvenanceEvent::ApplyCompleted {
            stack: plan.name.clone(),
            run_id,
            resources_applied: report.operations.len() as u32,
            resources_unchanged: report.unchanged,
            resources_failed: failed,
            total_seconds: report.total_seconds,
        },
    );

    match failure {
        Some(e) => Err(e),
        None => Ok(report),
    }
}

fn keep_first(failure: &mut Option<Error>, e: Error) {
    if failure.is_none() {
        *failure = Some(e);
    }
}

enum Step {
    Unchanged,
    Launch(Operation),
}

/// Resolve a ready plan entry against live state and decide what to run.
fn prepare(
    change: &PlannedChange,
    specs: &IndexMap<String, ResourceSpec>,
    registry: &CloudRegistry,
    state: &StateFile,
    changed: &HashSet<String>,
    cfg: &ApplyConfig,
) -> Result<Step> {
    let id = &change.resource_id;
    let prior = state.resources.get(id);

    if change.action == PlanAction::Delete {
        let Some(prior) = prior else {
            return Ok(Step::Unchanged);
        };
        let api = registry
            .handle(&prior.provider, prior.kind)
            .map_err(|source| Error::Provision {
                resource: id.clone(),
                action: PlanAction::Delete,
                source,
            })?;
        return Ok(Step::Launch(Operation {
            resource_id: id.clone(),
            action: PlanAction::Delete,
            api,
            cloud_id: Some(prior.cloud_id.clone()),
            attributes: Attributes::new(),
            record: None,
            accepted: OnceLock::new(),
            timeout: cfg.operation_timeout,
        }));
    }

    let spec = specs
        .get(id)
        .ok_or_else(|| Error::validation(id.clone(), "planned but not declared"))?;
    let resolved = resolver::resolve_attributes(&spec.attributes, &state.resources).map_err(|r| {
        Error::validation(
            id.clone(),
            format!("{} is unresolved after its dependencies were applied", r),
        )
    })?;
    let spec_hash = planner::hash_desired_state(spec.kind, &spec.provider, spec.protected, &resolved);

    let mut action = change.action;
    if action == PlanAction::NoOp {
        let upstream_changed = change.after.iter().any(|d| changed.contains(d));
        match prior {
            Some(p) if !upstream_changed || p.spec_hash == spec_hash => return Ok(Step::Unchanged),
            Some(_) => {
                tracing::info!(resource = %id, "dependency outputs changed, promoting to update");
                action = PlanAction::Update;
            }
            None => action = PlanAction::Create,
        }
    }
    if action == PlanAction::Update && prior.is_none() {
        action = PlanAction::Create;
    }

    let api = registry
        .handle(&spec.provider, spec.kind)
        .map_err(|source| Error::Provision {
            resource: id.clone(),
            action,
            source,
        })?;

    Ok(Step::Launch(Operation {
        resource_id: id.clone(),
        action,
        api,
        cloud_id: match action {
            PlanAction::Update => prior.map(|p| p.cloud_id.clone()),
            _ => None,
        },
        attributes: resolved,
        record: Some(ResourceState {
            kind: spec.kind,
            provider: spec.provider.clone(),
            cloud_id: String::new(),
            spec_hash,
            live_hash: String::new(),
            outputs: Attributes::new(),
            dependencies: resolver::dependencies_of(spec),
            protected: spec.protected,
            applied_at: None,
            duration_seconds: None,
        }),
        accepted: OnceLock::new(),
        timeout: cfg.operation_timeout,
    }))
}

/// Write a finished operation into state and persist it.
fn commit(
    state: &mut StateFile,
    store: &dyn StateStore,
    resource_id: &str,
    action: PlanAction,
    record: Option<ResourceState>,
    live: Option<LiveResource>,
    duration: Duration,
) -> Result<()> {
    match (record, live) {
        (Some(mut record), Some(live)) => {
            record.live_hash = hasher::hash_attributes(&live.attributes);
            record.cloud_id = live.cloud_id;
            record.outputs = live.attributes;
            record.applied_at = Some(eventlog::now_iso8601());
            record.duration_seconds = Some(duration.as_secs_f64());
            state.resources.insert(resource_id.to_string(), record);
        }
        _ if action == PlanAction::Delete => {
            state.resources.shift_remove(resource_id);
        }
        _ => return Ok(()),
    }
    state.generated_at = eventlog::now_iso8601();
    store.save(state)
}

/// Record an object the cloud accepted but that never became ready. An
/// empty spec hash makes the next plan update it in place.
fn commit_pending(
    state: &mut StateFile,
    store: &dyn StateStore,
    resource_id: &str,
    mut record: ResourceState,
    accepted: LiveResource,
) -> Result<()> {
    record.spec_hash = String::new();
    record.live_hash = hasher::hash_attributes(&accepted.attributes);
    record.cloud_id = accepted.cloud_id;
    record.outputs = accepted.attributes;
    state.resources.insert(resource_id.to_string(), record);
    state.generated_at = eventlog::now_iso8601();
    store.save(state)
}

/// A cloud operation handed to a worker task.
struct Operation {
    resource_id: String,
    action: PlanAction,
    api: Arc<dyn ResourceApi>,
    cloud_id: Option<String>,
    attributes: Attributes,
    /// State entry to record on success, minus live fields
    record: Option<ResourceState>,
    /// What create/update returned, kept if the wait never finishes
    accepted: OnceLock<LiveResource>,
    timeout: Duration,
}

/// What a worker hands back to the coordinator.
struct Finished {
    resource_id: String,
    action: PlanAction,
    record: Option<ResourceState>,
    /// Set when the cloud accepted a create/update but the wait failed
    accepted: Option<LiveResource>,
    result: Result<Option<LiveResource>>,
    duration: Duration,
}

impl Operation {
    async fn run(self) -> Finished {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.call()).await {
            Ok(Ok(live)) => Ok(live),
            Ok(Err(source)) => Err(Error::Provision {
                resource: self.resource_id.clone(),
                action: self.action,
                source,
            }),
            Err(_) => Err(Error::Timeout {
                resource: self.resource_id.clone(),
                action: self.action,
                timeout: self.timeout,
            }),
        };
        Finished {
            resource_id: self.resource_id,
            action: self.action,
            record: self.record,
            accepted: self.accepted.into_inner(),
            result,
            duration: start.elapsed(),
        }
    }

    async fn call(&self) -> std::result::Result<Option<LiveResource>, ApiError> {
        let cloud_id = self.cloud_id.as_deref().unwrap_or_default();
        match self.action {
            PlanAction::Create => {
                let created = self.api.create(&self.resource_id, &self.attributes).await?;
                let cloud_id = created.cloud_id.clone();
                let _ = self.accepted.set(created);
                self.api.wait_until_ready(&cloud_id).await.map(Some)
            }
            PlanAction::Update => {
                let updated = self.api.update(cloud_id, &self.attributes).await?;
                let cloud_id = updated.cloud_id.clone();
                let _ = self.accepted.set(updated);
                self.api.wait_until_ready(&cloud_id).await.map(Some)
            }
            PlanAction::Delete => match self.api.delete(cloud_id).await {
                Ok(()) => Ok(None),
                Err(ApiError::NotFound { .. }) => {
                    tracing::warn!(resource = %self.resource_id, cloud_id, "already deleted");
                    Ok(None)
                }
                Err(e) => Err(e),
            },
            PlanAction::NoOp => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::simulated::{ApiCall, ApiOp, SimulatedCloud};
    use crate::core::parser::parse_config;
    use crate::core::state::{FileStateStore, MemoryStateStore};
    use serde_json::json;

    const SCENARIO: &str = r#"
version: "1.0"
name: example-site
resources:
  zone:
    type: dns_zone
    attributes:
      name: example.com
  cert-validation:
    type: dns_record
    attributes:
      zone_id: "${zone.zone_id}"
      name: _acme-challenge.example.com
      record_type: CNAME
  cert:
    type: tls_certificate
    depends_on: [cert-validation]
    attributes:
      domain_name: example.com
  bucket:
    type: bucket
    attributes:
      bucket: www.example.com
  cdn:
    type: cdn_distribution
    attributes:
      origin_domain_name: "${bucket.bucket_regional_domain_name}"
      certificate_arn: "${cert.arn}"
      aliases: [www.example.com]
outputs:
  site_domain: "${cdn.domain_name}"
  endpoint: "https://${cdn.domain_name}/"
"#;

    fn load(yaml: &str) -> LoadedConfig {
        LoadedConfig::load(parse_config(yaml).unwrap()).unwrap()
    }

    fn sequential() -> ApplyConfig {
        ApplyConfig {
            parallelism: 1,
            operation_timeout: Duration::from_secs(60),
            event_log: None,
            holder: "test".to_string(),
            refresh: false,
        }
    }

    fn creates(calls: &[ApiCall]) -> Vec<String> {
        calls
            .iter()
            .filter(|c| c.op == ApiOp::Create)
            .map(|c| c.resource_id.clone())
            .collect()
    }

    fn position(calls: &[ApiCall], op: ApiOp, id: &str) -> usize {
        calls
            .iter()
            .position(|c| c.op == op && c.resource_id == id)
            .unwrap()
    }

    #[tokio::test]
    async fn test_sf012_scenario_applies_in_dependency_order() {
        let loaded = load(SCENARIO);
        let cloud = SimulatedCloud::new();
        let registry = cloud.registry(&loaded.config.providers);
        let store = MemoryStateStore::new();

        let report = apply(&loaded, &registry, &store, &sequential()).await.unwrap();

        assert_eq!(
            creates(&cloud.calls()),
            vec!["zone", "cert-validation", "cert", "bucket", "cdn"]
        );
        assert_eq!(report.count(PlanAction::Create), 5);
        assert_eq!(store.save_count(), 5);

        let state = store.load().unwrap();
        let cdn = &state.resources["cdn"];
        assert_eq!(cdn.outputs["status"], json!("Deployed"));
        assert_eq!(report.outputs["site_domain"], cdn.outputs["domain_name"]);
        let domain = report.outputs["site_domain"].as_str().unwrap();
        assert!(domain.ends_with(".cdn.sim-cloud.test"));
        assert_eq!(report.outputs["endpoint"], json!(format!("https://{}/", domain)));
        assert_eq!(cdn.dependencies, vec!["bucket", "cert"]);
    }

    #[tokio::test]
    async fn test_sf012_dependents_receive_live_values() {
        let loaded = load(SCENARIO);
        let cloud = SimulatedCloud::new();
        let registry = cloud.registry(&loaded.config.providers);
        let store = MemoryStateStore::new();
        apply(&loaded, &registry, &store, &sequential()).await.unwrap();

        let state = store.load().unwrap();
        let calls = cloud.calls();
        let record_call = &calls[position(&calls, ApiOp::Create, "cert-validation")];
        let sent = record_call.attributes.as_ref().unwrap();
        assert_eq!(sent["zone_id"], state.resources["zone"].outputs["zone_id"]);

        let cdn_call = &calls[position(&calls, ApiOp::Create, "cdn")];
        let sent = cdn_call.attributes.as_ref().unwrap();
        assert_eq!(
            sent["origin_domain_name"],
            json!("www.example.com.s3.us-east-1.sim-cloud.test")
        );
        assert_eq!(sent["certificate_arn"], state.resources["cert"].outputs["arn"]);
        assert_eq!(sent["aliases"], json!(["www.example.com"]));
    }

    #[tokio::test]
    async fn test_sf012_second_apply_is_all_noop_with_zero_calls() {
        let loaded = load(SCENARIO);
        let cloud = SimulatedCloud::new();
        let registry = cloud.registry(&loaded.config.providers);
        let store = MemoryStateStore::new();
        apply(&loaded, &registry, &store, &sequential()).await.unwrap();
        let before = store.load().unwrap();
        cloud.clear_calls();

        let plan = planner::plan(&loaded.config, &loaded.order, &before).unwrap();
        assert!(!plan.has_changes());
        assert_eq!(plan.unchanged, 5);

        let report = apply(&loaded, &registry, &store, &sequential()).await.unwrap();
        assert!(report.operations.is_empty());
        assert_eq!(report.unchanged, 5);
        assert!(cloud.calls().is_empty());
        assert_eq!(store.load().unwrap().resources, before.resources);
        assert_eq!(report.outputs["site_domain"], before.resources["cdn"].outputs["domain_name"]);
    }

    #[tokio::test]
    async fn test_sf012_failure_on_third_operation_is_fail_fast() {
        let loaded = load(SCENARIO);
        let cloud = SimulatedCloud::new();
        let registry = cloud.registry(&loaded.config.providers);
        let store = MemoryStateStore::new();
        cloud.fail_on("cert", ApiOp::Create, "certificate limit exceeded");

        let err = apply(&loaded, &registry, &store, &sequential()).await.unwrap_err();
        assert!(matches!(&err, Error::Provision { resource, action: PlanAction::Create, .. } if resource == "cert"));
        assert!(err.to_string().contains("certificate limit exceeded"));
        assert_eq!(err.exit_code(), 3);

        let state = store.load().unwrap();
        let applied: Vec<&String> = state.resources.keys().collect();
        assert_eq!(applied, vec!["zone", "cert-validation"]);
        assert!(!cloud.contains("bucket"));
        assert!(!cloud.contains("cdn"));
        assert_eq!(creates(&cloud.calls()), vec!["zone", "cert-validation", "cert"]);

        // Re-running picks up where it stopped.
        cloud.clear_calls();
        let report = apply(&loaded, &registry, &store, &sequential()).await.unwrap();
        assert_eq!(report.unchanged, 2);
        assert_eq!(creates(&cloud.mutating_calls()), vec!["cert", "bucket", "cdn"]);
        assert_eq!(cloud.mutating_calls().len(), 3);
        assert_eq!(store.load().unwrap().resources.len(), 5);
    }

    #[tokio::test]
    async fn test_sf012_parallel_branches_respect_dependencies() {
        let loaded = load(SCENARIO);
        let cloud = SimulatedCloud::new();
        cloud.set_latency(Duration::from_millis(20));
        let registry = cloud.registry(&loaded.config.providers);
        let store = MemoryStateStore::new();
        let cfg = ApplyConfig {
            parallelism: 4,
            ..sequential()
        };

        apply(&loaded, &registry, &store, &cfg).await.unwrap();

        assert!(cloud.max_in_flight() > 1);
        let calls = cloud.calls();
        for (dependent, dependency) in [
            ("cert-validation", "zone"),
            ("cert", "cert-validation"),
            ("cdn", "cert"),
            ("cdn", "bucket"),
        ] {
            assert!(
                position(&calls, ApiOp::WaitUntilReady, dependency)
                    < position(&calls, ApiOp::Create, dependent),
                "{} started before {} was ready",
                dependent,
                dependency
            );
        }
        assert_eq!(store.load().unwrap().resources.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sf012_operation_timeout_halts_plan() {
        let loaded = load(SCENARIO);
        let cloud = SimulatedCloud::new();
        let registry = cloud.registry(&loaded.config.providers);
        let store = MemoryStateStore::new();
        cloud.hang_on("cert");

        let err = apply(&loaded, &registry, &store, &sequential()).await.unwrap_err();
        assert!(matches!(&err, Error::Timeout { resource, .. } if resource == "cert"));
        assert_eq!(err.exit_code(), 5);
        assert!(err.to_string().contains("within 60s"));

        let state = store.load().unwrap();
        let recorded: Vec<&String> = state.resources.keys().collect();
        assert_eq!(recorded, vec!["zone", "cert-validation", "cert"]);
        assert_eq!(state.resources["cert"].spec_hash, "");
        assert!(!cloud.contains("bucket"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sf012_reapply_after_timed_out_create_updates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let cloud_file = dir.path().join("cloud.json");
        let loaded = load(SCENARIO);
        let store = MemoryStateStore::new();
        let cfg = ApplyConfig {
            operation_timeout: Duration::from_millis(50),
            ..sequential()
        };

        let cloud = SimulatedCloud::open(&cloud_file).unwrap();
        cloud.hang_on("bucket");
        let registry = cloud.registry(&loaded.config.providers);
        let err = apply(&loaded, &registry, &store, &cfg).await.unwrap_err();
        assert_eq!(err.to_string(), "CREATE bucket did not finish within 50ms");

        let pending = &store.load().unwrap().resources["bucket"];
        assert_eq!(pending.cloud_id, "www.example.com");
        assert!(pending.spec_hash.is_empty());
        let plan = planner::plan(&loaded.config, &loaded.order, &store.load().unwrap()).unwrap();
        assert_eq!(plan.change("bucket").unwrap().action, PlanAction::Update);

        // A fresh process sees the same cloud without the stuck wait.
        let cloud = SimulatedCloud::open(&cloud_file).unwrap();
        let registry = cloud.registry(&loaded.config.providers);
        let report = apply(&loaded, &registry, &store, &cfg).await.unwrap();
        assert_eq!(report.count(PlanAction::Update), 1);
        assert_eq!(creates(&cloud.calls()), vec!["cdn"]);
        assert_eq!(cloud.object_count(), 5);

        cloud.clear_calls();
        let report = apply(&loaded, &registry, &store, &cfg).await.unwrap();
        assert_eq!(report.unchanged, 5);
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_sf012_failed_wait_keeps_accepted_object_tracked() {
        let loaded = load(SCENARIO);
        let cloud = SimulatedCloud::new();
        let registry = cloud.registry(&loaded.config.providers);
        let store = MemoryStateStore::new();
        cloud.fail_on("cdn", ApiOp::WaitUntilReady, "origin unreachable");

        let err = apply(&loaded, &registry, &store, &sequential()).await.unwrap_err();
        assert!(matches!(&err, Error::Provision { resource, .. } if resource == "cdn"));
        let cdn_id = store.load().unwrap().resources["cdn"].cloud_id.clone();
        assert!(!cdn_id.is_empty());

        cloud.clear_calls();
        apply(&loaded, &registry, &store, &sequential()).await.unwrap();
        assert!(creates(&cloud.calls()).is_empty());
        assert_eq!(cloud.object_count(), 5);
        let cdn = &store.load().unwrap().resources["cdn"];
        assert_eq!(cdn.cloud_id, cdn_id);
        assert!(!cdn.spec_hash.is_empty());
    }

    #[tokio::test]
    async fn test_sf012_in_flight_operations_drain_after_failure() {
        let loaded = load(SCENARIO);
        let cloud = SimulatedCloud::new();
        cloud.set_latency(Duration::from_millis(5));
        let registry = cloud.registry(&loaded.config.providers);
        let store = MemoryStateStore::new();
        // zone and bucket start together; zone fails, bucket still lands.
        cloud.fail_on("zone", ApiOp::Create, "throttled");
        let cfg = ApplyConfig {
            parallelism: 4,
            ..sequential()
        };

        let err = apply(&loaded, &registry, &store, &cfg).await.unwrap_err();
        assert_eq!(err.resource(), Some("zone"));
        let state = store.load().unwrap();
        assert!(state.resources.contains_key("bucket"));
        assert!(!state.resources.contains_key("cert-validation"));
        assert!(!cloud.contains("cdn"));
    }

    #[tokio::test]
    async fn test_sf012_protected_delete_refused_without_calls() {
        let first = load(
            r#"
version: "1.0"
name: t
resources:
  zone:
    type: dns_zone
    protected: true
    attributes: { name: example.com }
  bucket:
    type: bucket
    attributes: { bucket: www.example.com }
"#,
        );
        let cloud = SimulatedCloud::new();
        let registry = cloud.registry(&first.config.providers);
        let store = MemoryStateStore::new();
        apply(&first, &registry, &store, &sequential()).await.unwrap();
        let before = store.load().unwrap();
        let saves = store.save_count();
        cloud.clear_calls();

        let second = load(
            r#"
version: "1.0"
name: t
resources:
  bucket:
    type: bucket
    attributes: { bucket: www.example.com }
"#,
        );
        let err = apply(&second, &registry, &store, &sequential()).await.unwrap_err();
        assert!(matches!(&err, Error::ProtectedResource { resource } if resource == "zone"));
        assert_eq!(err.exit_code(), 4);
        assert!(cloud.calls().is_empty());
        assert_eq!(store.save_count(), saves);
        assert_eq!(store.load().unwrap().resources, before.resources);

        let err = destroy(&second.config, &registry, &store, &sequential()).await.unwrap_err();
        assert!(matches!(err, Error::ProtectedResource { .. }));
        assert!(cloud.contains("zone"));
    }

    #[tokio::test]
    async fn test_sf012_destroy_deletes_dependents_first() {
        let loaded = load(SCENARIO);
        let cloud = SimulatedCloud::new();
        let registry = cloud.registry(&loaded.config.providers);
        let store = MemoryStateStore::new();
        apply(&loaded, &registry, &store, &sequential()).await.unwrap();
        cloud.clear_calls();

        let report = destroy(&loaded.config, &registry, &store, &sequential()).await.unwrap();
        assert_eq!(report.count(PlanAction::Delete), 5);
        let deleted: Vec<String> = cloud
            .calls()
            .into_iter()
            .filter(|c| c.op == ApiOp::Delete)
            .map(|c| c.resource_id)
            .collect();
        assert_eq!(deleted, vec!["cdn", "bucket", "cert", "cert-validation", "zone"]);
        assert_eq!(cloud.object_count(), 0);
        assert!(store.load().unwrap().resources.is_empty());
    }

    #[tokio::test]
    async fn test_sf012_upstream_change_promotes_noop_dependent() {
        let loaded = load(SCENARIO);
        let cloud = SimulatedCloud::new();
        let registry = cloud.registry(&loaded.config.providers);
        let store = MemoryStateStore::new();
        apply(&loaded, &registry, &store, &sequential()).await.unwrap();
        cloud.clear_calls();

        let renamed = load(&SCENARIO.replace("bucket: www.example.com", "bucket: static.example.com"));
        let plan = planner::plan(&renamed.config, &renamed.order, &store.load().unwrap()).unwrap();
        assert_eq!(plan.change("bucket").unwrap().action, PlanAction::Update);
        assert_eq!(plan.change("cdn").unwrap().action, PlanAction::NoOp);

        let report = apply(&renamed, &registry, &store, &sequential()).await.unwrap();
        assert_eq!(report.count(PlanAction::Update), 2);
        let calls = cloud.mutating_calls();
        let cdn_update = calls
            .iter()
            .find(|c| c.op == ApiOp::Update && c.resource_id == "cdn")
            .unwrap();
        assert_eq!(
            cdn_update.attributes.as_ref().unwrap()["origin_domain_name"],
            json!("static.example.com.s3.us-east-1.sim-cloud.test")
        );

        // Converged again.
        cloud.clear_calls();
        let report = apply(&renamed, &registry, &store, &sequential()).await.unwrap();
        assert!(report.operations.is_empty());
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_sf012_removed_declaration_is_deleted() {
        let loaded = load(SCENARIO);
        let cloud = SimulatedCloud::new();
        let registry = cloud.registry(&loaded.config.providers);
        let store = MemoryStateStore::new();
        apply(&loaded, &registry, &store, &sequential()).await.unwrap();

        let trimmed = load(
            r#"
version: "1.0"
name: example-site
resources:
  zone:
    type: dns_zone
    attributes:
      name: example.com
"#,
        );
        let report = apply(&trimmed, &registry, &store, &sequential()).await.unwrap();
        assert_eq!(report.count(PlanAction::Delete), 4);
        assert_eq!(report.unchanged, 1);
        let state = store.load().unwrap();
        assert_eq!(state.resources.keys().collect::<Vec<_>>(), vec!["zone"]);
        assert_eq!(cloud.object_count(), 1);
    }

    #[tokio::test]
    async fn test_sf012_refresh_repairs_drift() {
        let loaded = load(SCENARIO);
        let cloud = SimulatedCloud::new();
        let registry = cloud.registry(&loaded.config.providers);
        let store = MemoryStateStore::new();
        apply(&loaded, &registry, &store, &sequential()).await.unwrap();

        cloud.tamper("bucket", "website_endpoint", json!("elsewhere.test"));
        cloud.remove_out_of_band("cert-validation");
        cloud.clear_calls();

        let cfg = ApplyConfig {
            refresh: true,
            ..sequential()
        };
        let report = apply(&loaded, &registry, &store, &cfg).await.unwrap();
        assert_eq!(report.count(PlanAction::Update), 1);
        assert_eq!(report.count(PlanAction::Create), 1);
        assert!(cloud.contains("cert-validation"));

        let findings = drift::detect_drift(&registry, &store.load().unwrap()).await;
        assert!(findings.is_empty(), "{:?}", findings);
    }

    #[tokio::test]
    async fn test_sf012_lease_held_blocks_apply() {
        let loaded = load(SCENARIO);
        let cloud = SimulatedCloud::new();
        let registry = cloud.registry(&loaded.config.providers);
        let store = MemoryStateStore::new();
        let _held = store.acquire_lease("someone-else").unwrap();

        let err = apply(&loaded, &registry, &store, &sequential()).await.unwrap_err();
        assert!(matches!(&err, Error::LockHeld { holder, .. } if holder == "someone-else"));
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_sf012_file_store_and_event_log() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load(SCENARIO);
        let cloud = SimulatedCloud::new();
        let registry = cloud.registry(&loaded.config.providers);
        let store = FileStateStore::new(dir.path());
        let cfg = ApplyConfig {
            event_log: Some(eventlog::event_log_path(dir.path())),
            ..sequential()
        };

        apply(&loaded, &registry, &store, &cfg).await.unwrap();
        assert!(!store.lease_path().exists());
        assert_eq!(store.load().unwrap().resources.len(), 5);

        let events = eventlog::read_events(&eventlog::event_log_path(dir.path())).unwrap();
        assert!(matches!(events.first().map(|e| &e.event), Some(ProvenanceEvent::ApplyStarted { operations: 5, .. })));
        assert!(matches!(
            events.last().map(|e| &e.event),
            Some(ProvenanceEvent::ApplyCompleted { resources_applied: 5, resources_failed: 0, .. })
        ));
        let applied = events
            .iter()
            .filter(|e| matches!(e.event, ProvenanceEvent::ResourceApplied { .. }))
            .count();
        assert_eq!(applied, 5);
    }

    #[tokio::test]
    async fn test_sf012_missing_handle_is_provision_error() {
        let loaded = load(SCENARIO);
        let registry = CloudRegistry::new();
        let store = MemoryStateStore::new();
        let err = apply(&loaded, &registry, &store, &sequential()).await.unwrap_err();
        assert!(matches!(
            &err,
            Error::Provision { resource, source: ApiError::NoHandle { .. }, .. } if resource == "zone"
        ));
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn test_sf012_compute_outputs_skips_unknown() {
        let mut outputs = IndexMap::new();
        outputs.insert("domain".to_string(), "${cdn.domain_name}".to_string());
        let state = crate::core::state::new_state();
        assert!(compute_outputs(&outputs, &state).is_empty());
    }

    #[test]
    fn test_sf012_apply_config_from_policy() {
        let cfg = ApplyConfig::from_policy(&Policy::default());
        assert_eq!(cfg.parallelism, 4);
        assert_eq!(cfg.operation_timeout, Duration::from_secs(1800));
        assert!(!cfg.refresh);
    }
}
