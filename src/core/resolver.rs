//! SF-003: Template resolution, reference analysis and dependency DAG construction.
//!
//! Two kinds of placeholder appear in declarations:
//! - `{{params.key}}` is resolved once, at load time.
//! - `${resource.attribute}` refers to another resource's declared or
//!   computed attribute. Each reference is a dependency edge and is
//!   substituted only when the target's values are known.
//!
//! Topological order uses Kahn's algorithm with declaration-order
//! tie-breaking, so independent resources keep the order they were written in.

use super::error::{Error, Result, ValidationIssue};
use super::types::*;
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::OnceLock;

/// A `${resource.attribute}` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub resource: String,
    pub attribute: String,
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.resource, self.attribute)
    }
}

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z0-9_-]+)\.([A-Za-z0-9_]+)\}").expect("reference pattern is valid")
    })
}

fn capture_reference(caps: &Captures<'_>) -> Reference {
    Reference {
        resource: caps[1].to_string(),
        attribute: caps[2].to_string(),
    }
}

/// Resolve all `{{params.key}}` templates in a string.
pub fn resolve_template(
    template: &str,
    params: &HashMap<String, serde_yaml_ng::Value>,
) -> std::result::Result<String, String> {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let close = result[open..]
            .find("}}")
            .ok_or_else(|| format!("unclosed template at position {}", open))?;
        let close = open + close + 2;
        let key = result[open + 2..close - 2].trim();

        let value = match key.strip_prefix("params.") {
            Some(param_key) => params
                .get(param_key)
                .map(yaml_value_to_string)
                .ok_or_else(|| format!("unknown param: {}", param_key))?,
            None => return Err(format!("unknown template variable: {}", key)),
        };

        result.replace_range(open..close, &value);
        start = open + value.len();
    }

    Ok(result)
}

/// Resolve `{{params.key}}` templates in every string of a value tree.
pub fn resolve_value_templates(
    value: &Value,
    params: &HashMap<String, serde_yaml_ng::Value>,
) -> std::result::Result<Value, String> {
    Ok(match value {
        Value::String(s) => Value::String(resolve_template(s, params)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve_value_templates(v, params))
                .collect::<std::result::Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_value_templates(v, params)?);
            }
            Value::Object(out)
        }
        scalar => scalar.clone(),
    })
}

/// References in a single expression string, in order of appearance.
pub fn expression_references(expr: &str) -> Vec<Reference> {
    reference_pattern()
        .captures_iter(expr)
        .map(|c| capture_reference(&c))
        .collect()
}

/// Whether `id` can be named by a `${id.attr}` reference.
pub fn is_valid_resource_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// `${...}` fragments in an expression that do not form a valid reference.
pub fn malformed_references(expr: &str) -> Vec<String> {
    let valid: HashSet<usize> = reference_pattern().find_iter(expr).map(|m| m.start()).collect();
    expr.match_indices("${")
        .filter(|(at, _)| !valid.contains(at))
        .map(|(at, _)| {
            let rest = &expr[at..];
            match rest.find('}') {
                Some(end) => rest[..=end].to_string(),
                None => rest.to_string(),
            }
        })
        .collect()
}

/// Malformed `${...}` fragments anywhere in a value tree.
pub fn malformed_in_value(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => malformed_references(s),
        Value::Array(items) => items.iter().flat_map(malformed_in_value).collect(),
        Value::Object(map) => map.values().flat_map(malformed_in_value).collect(),
        _ => Vec::new(),
    }
}

/// Every reference anywhere in a value tree, deduplicated, in order of appearance.
pub fn extract_references(value: &Value) -> Vec<Reference> {
    let mut refs = Vec::new();
    collect_references(value, &mut refs);
    refs
}

fn collect_references(value: &Value, refs: &mut Vec<Reference>) {
    match value {
        Value::String(s) => {
            for r in expression_references(s) {
                if !refs.contains(&r) {
                    refs.push(r);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, refs)),
        Value::Object(map) => map.values().for_each(|v| collect_references(v, refs)),
        _ => {}
    }
}

/// References made by a resource's attributes.
pub fn spec_references(spec: &ResourceSpec) -> Vec<Reference> {
    let mut refs = Vec::new();
    for value in spec.attributes.values() {
        collect_references(value, &mut refs);
    }
    refs
}

/// All resources a spec depends on: explicit `depends_on` plus referenced resources.
pub fn dependencies_of(spec: &ResourceSpec) -> Vec<String> {
    let mut deps: Vec<String> = Vec::new();
    let referenced = spec_references(spec).into_iter().map(|r| r.resource);
    for dep in spec.depends_on.iter().cloned().chain(referenced) {
        if !deps.contains(&dep) {
            deps.push(dep);
        }
    }
    deps
}

/// Substitute references in `value`. `lookup` supplies the current value of
/// a reference; the first reference it cannot supply is returned as the error.
///
/// A string that is exactly one reference takes the referenced value with its
/// JSON type intact; references embedded in longer text are stringified.
pub fn substitute<F>(value: &Value, lookup: &F) -> std::result::Result<Value, Reference>
where
    F: Fn(&Reference) -> Option<Value>,
{
    Ok(match value {
        Value::String(s) => substitute_str(s, lookup)?,
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| substitute(v, lookup))
                .collect::<std::result::Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), substitute(v, lookup)?);
            }
            Value::Object(out)
        }
        scalar => scalar.clone(),
    })
}

fn substitute_str<F>(s: &str, lookup: &F) -> std::result::Result<Value, Reference>
where
    F: Fn(&Reference) -> Option<Value>,
{
    let pattern = reference_pattern();

    if let Some(caps) = pattern.captures(s) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(s.len()) {
            let reference = capture_reference(&caps);
            return lookup(&reference).ok_or(reference);
        }
    } else {
        return Ok(Value::String(s.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in pattern.captures_iter(s) {
        let Some(whole) = caps.get(0) else { continue };
        let reference = capture_reference(&caps);
        let value = lookup(&reference).ok_or(reference)?;
        out.push_str(&s[last..whole.start()]);
        out.push_str(&json_value_to_string(&value));
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

/// Look up a reference among applied resources' live outputs.
pub fn lookup_output(
    resources: &indexmap::IndexMap<String, ResourceState>,
    reference: &Reference,
) -> Option<Value> {
    resources
        .get(&reference.resource)
        .and_then(|r| r.outputs.get(&reference.attribute))
        .cloned()
}

/// Substitute every reference in a resource's attributes using live outputs.
pub fn resolve_attributes(
    attributes: &Attributes,
    resources: &indexmap::IndexMap<String, ResourceState>,
) -> std::result::Result<Attributes, Reference> {
    let lookup = |r: &Reference| lookup_output(resources, r);
    attributes
        .iter()
        .map(|(k, v)| Ok((k.clone(), substitute(v, &lookup)?)))
        .collect()
}

/// Evaluate an output expression against live outputs.
pub fn resolve_expression(
    expr: &str,
    resources: &indexmap::IndexMap<String, ResourceState>,
) -> std::result::Result<Value, Reference> {
    let lookup = |r: &Reference| lookup_output(resources, r);
    substitute_str(expr, &lookup)
}

/// Build a topological execution order from resource dependencies.
/// Uses Kahn's algorithm with declaration-order tie-breaking for determinism.
pub fn build_execution_order(config: &SiteConfig) -> Result<Vec<String>> {
    let edges: Vec<(String, Vec<String>)> = config
        .resources
        .iter()
        .map(|(id, spec)| (id.clone(), dependencies_of(spec)))
        .collect();
    topological_order(&edges)
}

/// Kahn's algorithm over `(node, dependencies)` pairs. Ties are broken by the
/// position of the node in `nodes`.
pub fn topological_order(nodes: &[(String, Vec<String>)]) -> Result<Vec<String>> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut issues = Vec::new();

    for (i, (id, deps)) in nodes.iter().enumerate() {
        for dep in deps {
            match index.get(dep.as_str()) {
                Some(&d) if d == i => issues.push(ValidationIssue::for_resource(
                    id.clone(),
                    "depends on itself",
                )),
                Some(&d) => {
                    dependents[d].push(i);
                    in_degree[i] += 1;
                }
                None => issues.push(ValidationIssue::for_resource(
                    id.clone(),
                    format!("depends on undeclared resource '{}'", dep),
                )),
            }
        }
    }
    if !issues.is_empty() {
        return Err(Error::Validation(issues));
    }

    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| i)
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(current) = ready.pop_first() {
        order.push(nodes[current].0.clone());
        for &next in &dependents[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() != nodes.len() {
        let cycle_members: Vec<&str> = nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, (id, _))| id.as_str())
            .collect();
        return Err(Error::Validation(vec![ValidationIssue::new(format!(
            "dependency cycle detected involving: {}",
            cycle_members.join(", ")
        ))]));
    }

    Ok(order)
}
