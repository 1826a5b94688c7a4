//! SF-004: Plan generation. Diffs declared resources against persisted state.

use super::error::{Error, Result, ValidationIssue};
use super::resolver;
use super::types::*;
use crate::tripwire::hasher;

/// Generate an execution plan by comparing declarations to state.
///
/// `order` is the topological order produced at load time.
pub fn plan(config: &SiteConfig, order: &[String], state: &StateFile) -> Result<ExecutionPlan> {
    let declared: Vec<(&String, &ResourceSpec)> = order
        .iter()
        .filter_map(|id| config.resources.get_key_value(id))
        .collect();
    let plan = diff(&config.name, &declared, state)?;
    tracing::info!(
        stack = %plan.name,
        create = plan.to_create,
        update = plan.to_update,
        delete = plan.to_delete,
        unchanged = plan.unchanged,
        "plan computed"
    );
    Ok(plan)
}

/// Plan the removal of everything in state.
pub fn plan_destroy(name: &str, state: &StateFile) -> Result<ExecutionPlan> {
    diff(name, &[], state)
}

fn diff(
    name: &str,
    declared: &[(&String, &ResourceSpec)],
    state: &StateFile,
) -> Result<ExecutionPlan> {
    let mut issues = Vec::new();
    let mut entries: Vec<(PlannedChange, Vec<String>)> = Vec::new();

    for (id, spec) in declared {
        let prior = state.resources.get(*id);
        if let Some(prior) = prior {
            if prior.kind != spec.kind {
                issues.push(ValidationIssue::for_resource(
                    (*id).clone(),
                    format!(
                        "declared as {} but state records a {}; remove it from state first",
                        spec.kind, prior.kind
                    ),
                ));
                continue;
            }
        }
        let (action, description) = determine_action(id, spec, prior, state);
        let after = resolver::dependencies_of(spec);
        entries.push((
            PlannedChange {
                resource_id: (*id).clone(),
                kind: spec.kind,
                action,
                after: after.clone(),
                description,
            },
            after,
        ));
    }

    if !issues.is_empty() {
        return Err(Error::Validation(issues));
    }

    // Deletes wait for every prior-state dependent. Later-applied resources
    // come first among otherwise unordered deletes.
    let is_declared = |id: &str| declared.iter().any(|(d, _)| d.as_str() == id);
    for (id, prior) in state.resources.iter().rev() {
        if is_declared(id.as_str()) {
            continue;
        }
        let dependents: Vec<String> = state
            .resources
            .iter()
            .filter(|(_, r)| r.dependencies.contains(id))
            .map(|(dep_id, _)| dep_id.clone())
            .collect();
        entries.push((
            PlannedChange {
                resource_id: id.clone(),
                kind: prior.kind,
                action: PlanAction::Delete,
                after: dependents.clone(),
                description: describe_delete(id, prior),
            },
            dependents,
        ));
    }

    let nodes: Vec<(String, Vec<String>)> = entries
        .iter()
        .map(|(c, edges)| (c.resource_id.clone(), edges.clone()))
        .collect();
    let order = resolver::topological_order(&nodes)?;

    let mut by_id: std::collections::HashMap<String, PlannedChange> = entries
        .into_iter()
        .map(|(c, _)| (c.resource_id.clone(), c))
        .collect();
    let changes: Vec<PlannedChange> = order.iter().filter_map(|id| by_id.remove(id)).collect();

    let mut plan = ExecutionPlan {
        name: name.to_string(),
        changes,
        to_create: 0,
        to_update: 0,
        to_delete: 0,
        unchanged: 0,
    };
    plan.recount();
    Ok(plan)
}

/// Determine what action to take for a declared resource.
fn determine_action(
    id: &str,
    spec: &ResourceSpec,
    prior: Option<&ResourceState>,
    state: &StateFile,
) -> (PlanAction, String) {
    let Some(prior) = prior else {
        return (PlanAction::Create, describe_create(id, spec));
    };
    if prior.spec_hash.is_empty() {
        return (
            PlanAction::Update,
            format!("{}: update {} (previous apply did not finish)", id, spec.kind),
        );
    }

    match resolver::resolve_attributes(&spec.attributes, &state.resources) {
        Ok(resolved) => {
            let desired = hash_desired_state(spec.kind, &spec.provider, spec.protected, &resolved);
            if desired == prior.spec_hash {
                (PlanAction::NoOp, format!("{}: no changes", id))
            } else {
                (
                    PlanAction::Update,
                    format!("{}: update {} (declaration changed)", id, spec.kind),
                )
            }
        }
        Err(reference) => (
            PlanAction::Update,
            format!("{}: update {} ({} known after apply)", id, spec.kind, reference),
        ),
    }
}

/// Hash of a resource's desired state: kind, provider, protection and
/// fully-resolved attributes, in canonical form.
pub fn hash_desired_state(
    kind: ResourceKind,
    provider: &str,
    protected: bool,
    attributes: &Attributes,
) -> String {
    let kind = kind.to_string();
    let protected = if protected { "protected" } else { "unprotected" };
    let attributes = hasher::hash_attributes(attributes);
    hasher::composite_hash(&[&kind, provider, protected, &attributes])
}

fn describe_create(id: &str, spec: &ResourceSpec) -> String {
    let label = spec.label().filter(|l| !l.is_empty());
    match label {
        Some(label) => format!("{}: create {} {}", id, spec.kind, label),
        None => format!("{}: create {}", id, spec.kind),
    }
}

fn describe_delete(id: &str, prior: &ResourceState) -> String {
    let protected = if prior.protected { " [protected]" } else { "" };
    format!("{}: delete {} {}{}", id, prior.kind, prior.cloud_id, protected)
}
