//! SF-020: Cloud resource API, one capability handle per resource kind.
//!
//! The engine never talks to a provider SDK directly. Each (provider alias,
//! kind) pair resolves to a [`ResourceApi`] handle in a [`CloudRegistry`],
//! which is passed explicitly to whatever needs it.

pub mod simulated;

use crate::core::types::{Attributes, ResourceKind};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a cloud API call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    #[error("{kind} {cloud_id} not found")]
    NotFound {
        kind: ResourceKind,
        cloud_id: String,
    },

    #[error("{kind} request rejected: {message}")]
    Rejected {
        kind: ResourceKind,
        message: String,
    },

    #[error("{kind} {cloud_id} reached failed status {status}")]
    FailedStatus {
        kind: ResourceKind,
        cloud_id: String,
        status: String,
    },

    #[error("no handle registered for provider '{provider}' and kind {kind}")]
    NoHandle {
        provider: String,
        kind: ResourceKind,
    },

    #[error("backend error: {0}")]
    Backend(String),
}

/// A resource as the cloud API reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveResource {
    /// Identifier assigned by the provider
    pub cloud_id: String,

    /// Declared attributes merged with generated ones
    pub attributes: Attributes,
}

/// Create/read/update/delete/wait capability for one resource kind.
///
/// `create` and `update` may return before the provider has finished;
/// `wait_until_ready` blocks until the resource reaches a terminal status.
#[async_trait]
pub trait ResourceApi: Send + Sync {
    /// The kind this handle manages.
    fn kind(&self) -> ResourceKind;

    async fn create(&self, resource_id: &str, attributes: &Attributes)
        -> Result<LiveResource, ApiError>;

    /// `Ok(None)` when the resource no longer exists.
    async fn read(&self, cloud_id: &str) -> Result<Option<LiveResource>, ApiError>;

    async fn update(&self, cloud_id: &str, attributes: &Attributes)
        -> Result<LiveResource, ApiError>;

    async fn delete(&self, cloud_id: &str) -> Result<(), ApiError>;

    async fn wait_until_ready(&self, cloud_id: &str) -> Result<LiveResource, ApiError>;
}

/// Named capability handles, keyed by provider alias and kind.
#[derive(Default, Clone)]
pub struct CloudRegistry {
    handles: BTreeMap<(String, ResourceKind), Arc<dyn ResourceApi>>,
}

impl CloudRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` for `provider`. Replaces any handle of the same kind.
    pub fn register(&mut self, provider: impl Into<String>, handle: Arc<dyn ResourceApi>) {
        self.handles.insert((provider.into(), handle.kind()), handle);
    }

    /// Look up the handle for a provider alias and kind.
    pub fn handle(&self, provider: &str, kind: ResourceKind) -> Result<Arc<dyn ResourceApi>, ApiError> {
        self.handles
            .get(&(provider.to_string(), kind))
            .cloned()
            .ok_or_else(|| ApiError::NoHandle {
                provider: provider.to_string(),
                kind,
            })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
