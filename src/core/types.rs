//! SF-001: Declaration schema, resource kinds, state records, plans and provenance events.
//!
//! Everything here derives Serialize/Deserialize so declarations and state
//! round-trip through YAML, and events through JSONL.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Attribute map of a resource (declared, resolved or live).
pub type Attributes = IndexMap<String, serde_json::Value>;

/// Provider alias used when a resource does not name one.
pub const DEFAULT_PROVIDER: &str = "default";

// ============================================================================
// Top-level siteform.yaml
// ============================================================================

/// Root declaration: the desired state of the site stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Human-readable stack name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Global parameters (templatable via `{{params.key}}`)
    #[serde(default)]
    pub params: HashMap<String, serde_yaml_ng::Value>,

    /// Named provider handles. `default` always exists.
    #[serde(default)]
    pub providers: IndexMap<String, ProviderConfig>,

    /// Resource declarations (order-preserving)
    pub resources: IndexMap<String, ResourceSpec>,

    /// Named outputs, each an expression over resource attributes
    #[serde(default)]
    pub outputs: IndexMap<String, String>,

    /// Execution policy
    #[serde(default)]
    pub policy: Policy,
}

impl SiteConfig {
    /// Whether `alias` names a usable provider handle.
    pub fn has_provider(&self, alias: &str) -> bool {
        alias == DEFAULT_PROVIDER || self.providers.contains_key(alias)
    }
}

/// Settings of one provider handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Region the handle operates in
    #[serde(default = "default_region")]
    pub region: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

// ============================================================================
// Resources
// ============================================================================

/// A single declared resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Resource kind
    #[serde(rename = "type")]
    pub kind: ResourceKind,

    /// Provider alias whose handle manages this resource
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Declared attributes; strings may contain `${id.attr}` references
    #[serde(default)]
    pub attributes: Attributes,

    /// Explicit dependencies in addition to those implied by references
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Never issue a delete against this resource
    #[serde(default)]
    pub protected: bool,
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

impl ResourceSpec {
    /// Human-readable label taken from the kind's naming attribute.
    pub fn label(&self) -> Option<String> {
        self.attributes
            .get(self.kind.name_attribute())
            .map(json_value_to_string)
    }
}

/// Kinds of cloud resource the engine can drive. One capability handle exists per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Bucket,
    CdnDistribution,
    DnsZone,
    DnsRecord,
    TlsCertificate,
    AccessPolicy,
}

impl ResourceKind {
    /// Every kind, in a fixed order.
    pub const ALL: [ResourceKind; 6] = [
        Self::Bucket,
        Self::CdnDistribution,
        Self::DnsZone,
        Self::DnsRecord,
        Self::TlsCertificate,
        Self::AccessPolicy,
    ];

    /// Attributes a declaration of this kind must carry.
    pub fn required_attributes(self) -> &'static [&'static str] {
        match self {
            Self::Bucket => &["bucket"],
            Self::CdnDistribution => &["origin_domain_name"],
            Self::DnsZone => &["name"],
            Self::DnsRecord => &["zone_id", "name", "record_type"],
            Self::TlsCertificate => &["domain_name"],
            Self::AccessPolicy => &["bucket", "policy"],
        }
    }

    /// Attributes the cloud API generates for this kind, known only after apply.
    pub fn computed_attributes(self) -> &'static [&'static str] {
        match self {
            Self::Bucket => &[
                "id",
                "arn",
                "bucket_domain_name",
                "bucket_regional_domain_name",
                "website_endpoint",
            ],
            Self::CdnDistribution => &["id", "arn", "domain_name", "hosted_zone_id", "status"],
            Self::DnsZone => &["zone_id", "arn", "name_servers"],
            Self::DnsRecord => &["id", "fqdn"],
            Self::TlsCertificate => &[
                "id",
                "arn",
                "status",
                "validation_record_name",
                "validation_record_type",
                "validation_record_value",
            ],
            Self::AccessPolicy => &["id"],
        }
    }

    /// The declared attribute that names an instance in plan output.
    pub fn name_attribute(self) -> &'static str {
        match self {
            Self::Bucket | Self::AccessPolicy => "bucket",
            Self::CdnDistribution => "origin_domain_name",
            Self::DnsZone | Self::DnsRecord => "name",
            Self::TlsCertificate => "domain_name",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bucket => write!(f, "bucket"),
            Self::CdnDistribution => write!(f, "cdn_distribution"),
            Self::DnsZone => write!(f, "dns_zone"),
            Self::DnsRecord => write!(f, "dns_record"),
            Self::TlsCertificate => write!(f, "tls_certificate"),
            Self::AccessPolicy => write!(f, "access_policy"),
        }
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Execution policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Maximum operations in flight on independent branches
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Per-operation budget, including wait-until-ready
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// Append provenance events to the state directory's event log
    #[serde(default = "default_true")]
    pub tripwire: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            operation_timeout_secs: default_operation_timeout(),
            tripwire: true,
        }
    }
}

fn default_parallelism() -> usize {
    4
}

fn default_operation_timeout() -> u64 {
    1800
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Persisted state
// ============================================================================

/// The persisted state of a stack: one entry per applied resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    /// Schema version
    pub schema: String,

    /// When the file was last written
    pub generated_at: String,

    /// Generator version
    pub generator: String,

    /// Per-resource state, in apply order
    #[serde(default)]
    pub resources: IndexMap<String, ResourceState>,
}

/// Last-known state of one applied resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Resource kind
    #[serde(rename = "type")]
    pub kind: ResourceKind,

    /// Provider alias that manages it
    pub provider: String,

    /// Identifier assigned by the cloud API
    pub cloud_id: String,

    /// BLAKE3 of the resolved spec that produced this state; empty while
    /// the resource was accepted but never reported ready
    pub spec_hash: String,

    /// BLAKE3 of the live attributes, for drift detection
    pub live_hash: String,

    /// Live attributes returned by the cloud API
    #[serde(default)]
    pub outputs: Attributes,

    /// Resources this one depended on when applied
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Refuse deletes, even after the declaration is removed
    #[serde(default)]
    pub protected: bool,

    /// When the resource was last applied
    #[serde(default)]
    pub applied_at: Option<String>,

    /// Duration of last apply in seconds
    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

// ============================================================================
// Plan
// ============================================================================

/// Action to take on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Create,
    Update,
    Delete,
    NoOp,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

/// A single planned change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    /// Resource ID
    pub resource_id: String,

    /// Resource kind
    pub kind: ResourceKind,

    /// Action to take
    pub action: PlanAction,

    /// Resource IDs whose operations must finish first
    pub after: Vec<String>,

    /// Human-readable description
    pub description: String,
}

/// Full execution plan, topologically ordered.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Stack name
    pub name: String,

    /// Planned changes in execution order
    pub changes: Vec<PlannedChange>,

    /// Summary counts
    pub to_create: u32,
    pub to_update: u32,
    pub to_delete: u32,
    pub unchanged: u32,
}

impl ExecutionPlan {
    /// Whether executing the plan would call the cloud API at all.
    pub fn has_changes(&self) -> bool {
        self.to_create + self.to_update + self.to_delete > 0
    }

    /// Resource IDs in execution order.
    pub fn order(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.resource_id.as_str()).collect()
    }

    /// Find the change for a resource.
    pub fn change(&self, resource_id: &str) -> Option<&PlannedChange> {
        self.changes.iter().find(|c| c.resource_id == resource_id)
    }

    /// Recompute the summary counts from `changes`.
    pub fn recount(&mut self) {
        let count = |a: PlanAction| self.changes.iter().filter(|c| c.action == a).count() as u32;
        self.to_create = count(PlanAction::Create);
        self.to_update = count(PlanAction::Update);
        self.to_delete = count(PlanAction::Delete);
        self.unchanged = count(PlanAction::NoOp);
    }
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    ApplyStarted {
        stack: String,
        run_id: String,
        siteform_version: String,
        operations: u32,
    },
    ResourceStarted {
        resource: String,
        action: String,
    },
    ResourceApplied {
        resource: String,
        action: String,
        duration_seconds: f64,
        hash: String,
    },
    ResourceFailed {
        resource: String,
        action: String,
        error: String,
    },
    ApplyCompleted {
        stack: String,
        run_id: String,
        resources_applied: u32,
        resources_unchanged: u32,
        resources_failed: u32,
        total_seconds: f64,
    },
    DriftDetected {
        resource: String,
        expected_hash: String,
        actual_hash: String,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Value helpers
// ============================================================================

/// Convert a serde_yaml_ng::Value to a string for template resolution.
pub fn yaml_value_to_string(val: &serde_yaml_ng::Value) -> String {
    match val {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        serde_yaml_ng::Value::Null => String::new(),
        other => format!("{:?}", other),
    }
}

/// String form of an attribute value, used when a reference is embedded in text.
pub fn json_value_to_string(val: &serde_json::Value) -> String {
    match val {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================
