//! HTTP catalog retriever with optional polling.
//!
//! The default catalog source: GET a URL returning
//! `{ "data": [ {"id": ...}, ... ] }`. In polling mode the catalog is
//! re-fetched on a fixed interval and every returned resource is routed
//! through the manager's allocation surface, so resources owned elsewhere
//! are forwarded rather than handled locally.

use crate::catalog::CatalogRetriever;
use crate::config::HttpCatalogConfig;
use crate::error::{CatalogFetchError, Result};
use crate::manager::AllocationApi;
use crate::types::{CatalogResponse, Resource};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Catalog retriever for an HTTP endpoint.
pub struct HttpCatalogRetriever {
    config: HttpCatalogConfig,
    client: reqwest::Client,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl HttpCatalogRetriever {
    pub fn new(config: HttpCatalogConfig) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &config.headers {
            match (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "Ignoring malformed catalog header"),
            }
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .default_headers(headers)
            .build()
            .expect("a timeout and validated headers always produce a client");

        Self {
            config,
            client,
            poll_handle: Mutex::new(None),
        }
    }

    async fn fetch(client: &reqwest::Client, url: &str) -> Result<Vec<Resource>> {
        debug!(url, "Fetching resource catalog");

        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| CatalogFetchError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        if status >= 300 {
            return Err(CatalogFetchError::Status {
                url: url.to_string(),
                status,
            }
            .into());
        }

        let catalog: CatalogResponse = response
            .json()
            .await
            .map_err(|e| CatalogFetchError::InvalidBody(e.to_string()))?;

        Ok(catalog.data)
    }

    /// One polling pass: fetch and route every resource through ownership.
    ///
    /// Failures are logged and skipped; they must never stop future passes.
    async fn poll_once(client: &reqwest::Client, url: &str, api: &Arc<dyn AllocationApi>) {
        let resources = match Self::fetch(client, url).await {
            Ok(resources) => resources,
            Err(e) => {
                warn!(error = %e, "Catalog poll fetch failed, skipping this pass");
                return;
            }
        };

        for resource in resources {
            if let Err(e) = api.allocate_resource(&resource).await {
                warn!(
                    resource_id = %resource.id,
                    error = %e,
                    "Polled resource could not be allocated"
                );
            }
        }
    }
}

#[async_trait]
impl CatalogRetriever for HttpCatalogRetriever {
    async fn setup(&self, api: Arc<dyn AllocationApi>) -> Result<()> {
        if !self.config.poll_for_new_resources {
            return Ok(());
        }

        let client = self.client.clone();
        let url = self.config.resources_url.clone();
        let interval = self.config.poll_interval;

        info!(url = %url, interval_ms = interval.as_millis() as u64, "Starting catalog polling");

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; the initial fetch already
            // happened during manager start.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                debug!("Polling for new resources");
                Self::poll_once(&client, &url, &api).await;
            }
        });

        *self.poll_handle.lock() = Some(handle);
        Ok(())
    }

    async fn fetch_resources(&self) -> Result<Vec<Resource>> {
        Self::fetch(&self.client, &self.config.resources_url).await
    }

    async fn tear_down(&self) {
        if let Some(handle) = self.poll_handle.lock().take() {
            handle.abort();
            info!("Stopped catalog polling");
        }
    }
}
