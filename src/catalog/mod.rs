//! The pluggable source of the authoritative resource catalog.

pub mod http;

use crate::error::{Error, Result};
use crate::manager::AllocationApi;
use crate::types::Resource;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::OnceLock;

pub use http::HttpCatalogRetriever;

/// Produces the full list of resources that should exist cluster-wide.
///
/// `setup` receives the manager's allocation surface so a polling retriever
/// can route newly discovered resources through ring ownership instead of
/// handing them to the local orchestrator directly.
#[async_trait]
pub trait CatalogRetriever: Send + Sync + 'static {
    /// One-time initialization; may spawn a polling loop.
    async fn setup(&self, api: Arc<dyn AllocationApi>) -> Result<()>;

    /// Fetch the full catalog. Fails with `CatalogFetchError` when the source
    /// is unreachable or returns a non-success indication.
    async fn fetch_resources(&self) -> Result<Vec<Resource>>;

    /// Stop any background activity. Always safe to call, never fails.
    async fn tear_down(&self);
}

/// Set-once slot for the active retriever, scoped to one manager.
#[derive(Default)]
pub struct RetrieverRegistry {
    slot: OnceLock<Arc<dyn CatalogRetriever>>,
}

impl RetrieverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the retriever. Registering twice is an internal error.
    pub fn register(&self, retriever: Arc<dyn CatalogRetriever>) -> Result<()> {
        self.slot
            .set(retriever)
            .map_err(|_| Error::Internal("catalog retriever already registered".to_string()))
    }

    /// The active retriever.
    pub fn current(&self) -> Result<Arc<dyn CatalogRetriever>> {
        self.slot
            .get()
            .cloned()
            .ok_or(Error::NotConfigured("catalog retriever"))
    }
}
