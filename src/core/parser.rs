//! SF-002: YAML parsing and validation.
//!
//! Parses siteform.yaml and validates structural constraints:
//! - Version must be "1.0"
//! - Provider aliases must be declared
//! - Resource ids are limited to letters, digits, '_' and '-'
//! - depends_on and `${id.attr}` targets must exist, and every `${` opens
//!   a well-formed reference
//! - Referenced attributes must be declared or computed by the target kind
//! - Required attributes per resource kind
//! - The dependency graph must be acyclic

use super::error::{Error, Result, ValidationIssue};
use super::resolver;
use super::types::*;
use std::path::Path;

/// Parse a siteform.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<SiteConfig> {
    let content = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

/// Parse a siteform.yaml from a string.
pub fn parse_config(yaml: &str) -> Result<SiteConfig> {
    serde_yaml_ng::from_str(yaml).map_err(Error::Parse)
}

/// Resolve `{{params.key}}` templates in every resource attribute.
pub fn resolve_params(config: &mut SiteConfig) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let params = config.params.clone();
    for (id, resource) in config.resources.iter_mut() {
        for (key, value) in resource.attributes.iter_mut() {
            match resolver::resolve_value_templates(value, &params) {
                Ok(resolved) => *value = resolved,
                Err(e) => issues.push(ValidationIssue::for_resource(
                    id.clone(),
                    format!("attribute '{}': {}", key, e),
                )),
            }
        }
    }
    issues
}

/// Validate a parsed config. Returns every issue found (empty = valid).
pub fn validate_config(config: &SiteConfig) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if config.version != "1.0" {
        issues.push(ValidationIssue::new(format!(
            "version must be \"1.0\", got \"{}\"",
            config.version
        )));
    }

    if config.name.trim().is_empty() {
        issues.push(ValidationIssue::new("name must not be empty"));
    }

    if config.policy.parallelism == 0 {
        issues.push(ValidationIssue::new("policy.parallelism must be at least 1"));
    }
    if config.policy.operation_timeout_secs == 0 {
        issues.push(ValidationIssue::new(
            "policy.operation_timeout_secs must be at least 1",
        ));
    }

    for (id, resource) in &config.resources {
        if !resolver::is_valid_resource_id(id) {
            issues.push(ValidationIssue::for_resource(
                id.clone(),
                "resource id may only contain letters, digits, '_' and '-'",
            ));
        }

        if !config.has_provider(&resource.provider) {
            issues.push(ValidationIssue::for_resource(
                id.clone(),
                format!("unknown provider '{}'", resource.provider),
            ));
        }

        for dep in &resource.depends_on {
            if dep == id {
                issues.push(ValidationIssue::for_resource(id.clone(), "depends on itself"));
            } else if !config.resources.contains_key(dep) {
                issues.push(ValidationIssue::for_resource(
                    id.clone(),
                    format!("depends on undeclared resource '{}'", dep),
                ));
            }
        }

        for attr in resource.kind.required_attributes() {
            let missing = match resource.attributes.get(*attr) {
                None | Some(serde_json::Value::Null) => true,
                Some(serde_json::Value::String(s)) => s.is_empty(),
                Some(_) => false,
            };
            if missing {
                issues.push(ValidationIssue::for_resource(
                    id.clone(),
                    format!("({}) missing required attribute '{}'", resource.kind, attr),
                ));
            }
        }

        for (key, value) in &resource.attributes {
            for fragment in resolver::malformed_in_value(value) {
                issues.push(ValidationIssue::for_resource(
                    id.clone(),
                    format!(
                        "attribute '{}': '{}' is not a valid reference (expected ${{resource.attribute}})",
                        key, fragment
                    ),
                ));
            }
        }

        for reference in resolver::spec_references(resource) {
            if reference.resource == *id {
                issues.push(ValidationIssue::for_resource(
                    id.clone(),
                    format!("{} refers to itself", reference),
                ));
            } else if let Some(message) = check_reference(config, &reference) {
                issues.push(ValidationIssue::for_resource(id.clone(), message));
            }
        }
    }

    for (name, expr) in &config.outputs {
        for fragment in resolver::malformed_references(expr) {
            issues.push(ValidationIssue::new(format!(
                "output '{}': '{}' is not a valid reference (expected ${{resource.attribute}})",
                name, fragment
            )));
        }
        let refs = resolver::expression_references(expr);
        if refs.is_empty() {
            issues.push(ValidationIssue::new(format!(
                "output '{}' does not reference any resource",
                name
            )));
        }
        for reference in refs {
            if let Some(message) = check_reference(config, &reference) {
                issues.push(ValidationIssue::new(format!("output '{}': {}", name, message)));
            }
        }
    }

    issues
}

fn check_reference(config: &SiteConfig, reference: &resolver::Reference) -> Option<String> {
    let Some(target) = config.resources.get(&reference.resource) else {
        return Some(format!(
            "{} references undeclared resource '{}'",
            reference, reference.resource
        ));
    };
    let known = target.attributes.contains_key(&reference.attribute)
        || target
            .kind
            .computed_attributes()
            .contains(&reference.attribute.as_str());
    if known {
        None
    } else {
        Some(format!(
            "{} names attribute '{}', which {} '{}' neither declares nor computes",
            reference, reference.attribute, target.kind, reference.resource
        ))
    }
}

/// A validated declaration set with its topological order.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: SiteConfig,
    /// Resource IDs, dependencies first
    pub order: Vec<String>,
}

impl LoadedConfig {
    /// Resolve params, validate, and order a parsed declaration set.
    pub fn load(mut config: SiteConfig) -> Result<Self> {
        let mut issues = resolve_params(&mut config);
        issues.extend(validate_config(&config));
        if !issues.is_empty() {
            return Err(Error::Validation(issues));
        }
        let order = resolver::build_execution_order(&config)?;
        tracing::debug!(stack = %config.name, resources = order.len(), "declarations loaded");
        Ok(Self { config, order })
    }

    /// Parse and load a declaration file.
    pub fn load_file(path: &Path) -> Result<Self> {
        Self::load(parse_config_file(path)?)
    }
}
