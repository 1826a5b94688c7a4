//! SF-006: Error taxonomy.
//!
//! Every error names the resource (or lease holder) it concerns. Validation
//! errors are raised before any API call; the others end an execution early
//! without rolling back operations that already succeeded.

use super::types::PlanAction;
use crate::cloud::ApiError;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A single problem found while loading or diffing declarations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Offending resource (or output) identifier, if any
    pub resource: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            resource: None,
            message: message.into(),
        }
    }

    pub fn for_resource(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            resource: Some(resource.into()),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource {
            Some(r) => write!(f, "{}: {}", r, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n  - ")
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed:\n  - {}", join_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse declarations: {0}")]
    Parse(#[source] serde_yaml_ng::Error),

    #[error("{action} {resource} failed: {source}")]
    Provision {
        resource: String,
        action: PlanAction,
        source: ApiError,
    },

    #[error("refusing to delete protected resource {resource}")]
    ProtectedResource { resource: String },

    #[error("{action} {resource} did not finish within {timeout:?}")]
    Timeout {
        resource: String,
        action: PlanAction,
        timeout: Duration,
    },

    #[error("state is locked by {holder} since {acquired_at} (lease file {})", .path.display())]
    LockHeld {
        holder: String,
        acquired_at: String,
        path: PathBuf,
    },

    #[error("state store error at {}: {message}", .path.display())]
    State { path: PathBuf, message: String },

    #[error("worker task failed: {0}")]
    Worker(String),

    #[error("{0}")]
    Command(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a single-issue validation error.
    pub fn validation(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(vec![ValidationIssue::for_resource(resource, message)])
    }

    pub fn state(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        Self::State {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// The resource this error concerns, if it names one.
    pub fn resource(&self) -> Option<&str> {
        match self {
            Self::Provision { resource, .. }
            | Self::ProtectedResource { resource }
            | Self::Timeout { resource, .. } => Some(resource),
            Self::Validation(issues) => issues.iter().find_map(|i| i.resource.as_deref()),
            _ => None,
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) | Self::Parse(_) | Self::Read { .. } => 2,
            Self::Provision { .. } => 3,
            Self::ProtectedResource { .. } => 4,
            Self::Timeout { .. } => 5,
            Self::LockHeld { .. } => 6,
            Self::State { .. } | Self::Worker(_) | Self::Command(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ResourceKind;

    #[test]
    fn test_sf006_validation_display_lists_issues() {
        let err = Error::Validation(vec![
            ValidationIssue::for_resource("cert", "references undeclared resource 'zone'"),
            ValidationIssue::new("name must not be empty"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("cert: references undeclared resource 'zone'"));
        assert!(msg.contains("\n  - name must not be empty"));
        assert_eq!(err.resource(), Some("cert"));
    }

    #[test]
    fn test_sf006_provision_names_resource_and_cause() {
        let err = Error::Provision {
            resource: "site-bucket".to_string(),
            action: PlanAction::Create,
            source: ApiError::Rejected {
                kind: ResourceKind::Bucket,
                message: "bucket name taken".to_string(),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("site-bucket"));
        assert!(msg.contains("bucket name taken"));
        assert_eq!(err.resource(), Some("site-bucket"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_sf006_exit_codes_distinct() {
        let codes = [
            Error::validation("a", "bad").exit_code(),
            Error::Provision {
                resource: "a".into(),
                action: PlanAction::Update,
                source: ApiError::Backend("x".into()),
            }
            .exit_code(),
            Error::ProtectedResource {
                resource: "a".into(),
            }
            .exit_code(),
            Error::Timeout {
                resource: "a".into(),
                action: PlanAction::Create,
                timeout: Duration::from_secs(3),
            }
            .exit_code(),
            Error::LockHeld {
                holder: "h".into(),
                acquired_at: "t".into(),
                path: PathBuf::from("/s/state.lease"),
            }
            .exit_code(),
        ];
        assert_eq!(codes, [2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_sf006_timeout_display() {
        let err = Error::Timeout {
            resource: "cdn".into(),
            action: PlanAction::Create,
            timeout: Duration::from_secs(90),
        };
        assert_eq!(err.to_string(), "CREATE cdn did not finish within 90s");

        let short = Error::Timeout {
            resource: "bucket".into(),
            action: PlanAction::Create,
            timeout: Duration::from_millis(50),
        };
        assert_eq!(short.to_string(), "CREATE bucket did not finish within 50ms");
    }

    #[test]
    fn test_sf006_command_error_is_generic_failure() {
        let err = Error::Command("2 drift finding(s)".into());
        assert_eq!(err.to_string(), "2 drift finding(s)");
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.resource(), None);
    }
}
