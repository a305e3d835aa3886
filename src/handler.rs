//! The pluggable per-resource side-effect handler.

use crate::error::{Error, HandlerError, Result};
use crate::types::Resource;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::OnceLock;

/// Side effects of owning a resource.
///
/// Implementations must tolerate concurrent calls for distinct resources:
/// batches during setup and rebalance run with no ordering guarantee. The
/// orchestrator never retries a failed call itself; allocation failures are
/// naturally retried on the next rebalance, termination failures are
/// reported once via `handle_failed_termination`.
#[async_trait]
pub trait ResourceHandler: Send + Sync + 'static {
    /// Start handling a resource this node now owns (e.g. open a socket).
    async fn handle_resource(&self, resource: &Resource) -> std::result::Result<(), HandlerError>;

    /// Called when `handle_resource` failed. The resource stays unowned.
    fn handle_failed_resource(&self, resource: &Resource, error: &HandlerError);

    /// Stop handling a resource this node no longer owns.
    async fn terminate_resource(&self, resource: &Resource)
        -> std::result::Result<(), HandlerError>;

    /// Called when `terminate_resource` failed. The resource is still gone
    /// from the ownership set.
    fn handle_failed_termination(&self, resource: &Resource, error: &HandlerError);
}

/// Set-once slot for the active handler, scoped to one manager.
#[derive(Default)]
pub struct HandlerRegistry {
    slot: OnceLock<Arc<dyn ResourceHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler. Registering twice is an internal error.
    pub fn register(&self, handler: Arc<dyn ResourceHandler>) -> Result<()> {
        self.slot
            .set(handler)
            .map_err(|_| Error::Internal("resource handler already registered".to_string()))
    }

    /// The active handler.
    pub fn current(&self) -> Result<Arc<dyn ResourceHandler>> {
        self.slot
            .get()
            .cloned()
            .ok_or(Error::NotConfigured("resource handler"))
    }
}
