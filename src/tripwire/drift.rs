//! SF-016: Drift detection. Compares live resources to recorded live hashes.

use super::{eventlog, hasher};
use crate::cloud::CloudRegistry;
use crate::core::types::{
    Attributes, ExecutionPlan, PlanAction, ProvenanceEvent, ResourceKind, ResourceState, StateFile,
};
use std::path::Path;

/// A single drift finding.
#[derive(Debug, Clone)]
pub struct DriftFinding {
    pub resource_id: String,
    pub kind: ResourceKind,
    pub expected_hash: String,
    pub actual_hash: String,
    pub detail: String,
    /// The resource no longer exists in the cloud
    pub missing: bool,
}

/// Read one applied resource and compare it to its recorded live hash.
pub async fn check_resource_drift(
    registry: &CloudRegistry,
    resource_id: &str,
    recorded: &ResourceState,
) -> Option<DriftFinding> {
    let finding = |actual_hash: String, detail: String, missing: bool| DriftFinding {
        resource_id: resource_id.to_string(),
        kind: recorded.kind,
        expected_hash: recorded.live_hash.clone(),
        actual_hash,
        detail,
        missing,
    };

    let api = match registry.handle(&recorded.provider, recorded.kind) {
        Ok(api) => api,
        Err(e) => return Some(finding("ERROR".to_string(), e.to_string(), false)),
    };

    match api.read(&recorded.cloud_id).await {
        Ok(None) => Some(finding(
            "MISSING".to_string(),
            format!("{} {} no longer exists", recorded.kind, recorded.cloud_id),
            true,
        )),
        Ok(Some(live)) => {
            let actual = hasher::hash_attributes(&live.attributes);
            if actual == recorded.live_hash {
                None
            } else {
                let changed = changed_attributes(&recorded.outputs, &live.attributes);
                Some(finding(
                    actual,
                    format!("attributes changed: {}", changed.join(", ")),
                    false,
                ))
            }
        }
        Err(e) => Some(finding("ERROR".to_string(), e.to_string(), false)),
    }
}

/// Check every resource in state for drift, in state order.
pub async fn detect_drift(registry: &CloudRegistry, state: &StateFile) -> Vec<DriftFinding> {
    let mut findings = Vec::new();
    for (id, recorded) in &state.resources {
        if let Some(finding) = check_resource_drift(registry, id, recorded).await {
            tracing::warn!(
                resource = %finding.resource_id,
                kind = %finding.kind,
                detail = %finding.detail,
                "drift detected"
            );
            findings.push(finding);
        }
    }
    findings
}

/// Keys added, removed or changed between recorded and live attributes.
fn changed_attributes(recorded: &Attributes, live: &Attributes) -> Vec<String> {
    let mut keys: Vec<String> = live
        .iter()
        .filter(|(k, v)| recorded.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    keys.extend(
        recorded
            .keys()
            .filter(|k| !live.contains_key(*k))
            .cloned(),
    );
    keys
}

/// Append a `drift_detected` event per finding.
pub fn record_findings(log: Option<&Path>, findings: &[DriftFinding]) {
    for f in findings {
        eventlog::record(
            log,
            ProvenanceEvent::DriftDetected {
                resource: f.resource_id.clone(),
                expected_hash: f.expected_hash.clone(),
                actual_hash: f.actual_hash.clone(),
            },
        );
    }
}

/// Turn unchanged plan entries with drift back into work: a missing
/// resource is re-created, a changed one is updated. Returns how many
/// entries changed.
pub fn mark_for_refresh(plan: &mut ExecutionPlan, findings: &[DriftFinding]) -> usize {
    let mut marked = 0;
    for change in plan.changes.iter_mut() {
        if change.action != PlanAction::NoOp {
            continue;
        }
        let Some(finding) = findings.iter().find(|f| f.resource_id == change.resource_id) else {
            continue;
        };
        if finding.missing {
            change.action = PlanAction::Create;
            change.description = format!(
                "{}: re-create {} (deleted outside siteform)",
                change.resource_id, change.kind
            );
        } else {
            change.action = PlanAction::Update;
            change.description = format!(
                "{}: update {} (drifted: {})",
                change.resource_id, change.kind, finding.detail
            );
        }
        marked += 1;
    }
    plan.recount();
    marked
}
