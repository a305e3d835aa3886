use crate::catalog::CatalogRetriever;
use crate::error::{CatalogFetchError, HandlerError, Result};
use crate::handler::ResourceHandler;
use crate::manager::AllocationApi;
use crate::types::Resource;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

/// Allocate an OS-assigned localhost address by briefly binding to port 0.
pub async fn free_tcp_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener); // Release the port immediately
    addr
}

/// Poll `check` until it returns true or the timeout elapses.
pub async fn wait_for<F>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

/// Handler that records every callback and can be told to fail specific ids.
#[derive(Default)]
pub struct MockHandler {
    handled: Mutex<Vec<String>>,
    terminated: Mutex<Vec<String>>,
    failed_handles: Mutex<Vec<String>>,
    failed_terminations: Mutex<Vec<String>>,
    fail_handle_ids: HashSet<String>,
    fail_terminate_all: AtomicBool,
}

impl MockHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A handler whose `handle_resource` fails for the given ids.
    pub fn failing_for(ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            fail_handle_ids: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    /// A handler whose every `terminate_resource` fails.
    pub fn failing_terminations() -> Arc<Self> {
        let handler = Self::new();
        handler.fail_terminate_all.store(true, Ordering::SeqCst);
        handler
    }

    pub fn handled_ids(&self) -> Vec<String> {
        let mut ids = self.handled.lock().clone();
        ids.sort();
        ids
    }

    pub fn terminated_ids(&self) -> Vec<String> {
        let mut ids = self.terminated.lock().clone();
        ids.sort();
        ids
    }

    pub fn failed_handle_ids(&self) -> Vec<String> {
        self.failed_handles.lock().clone()
    }

    pub fn failed_termination_ids(&self) -> Vec<String> {
        self.failed_terminations.lock().clone()
    }
}

#[async_trait]
impl ResourceHandler for MockHandler {
    async fn handle_resource(&self, resource: &Resource) -> std::result::Result<(), HandlerError> {
        self.handled.lock().push(resource.id.clone());
        if self.fail_handle_ids.contains(&resource.id) {
            return Err(format!("refused to handle {}", resource.id).into());
        }
        Ok(())
    }

    fn handle_failed_resource(&self, resource: &Resource, _error: &HandlerError) {
        self.failed_handles.lock().push(resource.id.clone());
    }

    async fn terminate_resource(
        &self,
        resource: &Resource,
    ) -> std::result::Result<(), HandlerError> {
        self.terminated.lock().push(resource.id.clone());
        if self.fail_terminate_all.load(Ordering::SeqCst) {
            return Err(format!("refused to terminate {}", resource.id).into());
        }
        Ok(())
    }

    fn handle_failed_termination(&self, resource: &Resource, _error: &HandlerError) {
        self.failed_terminations.lock().push(resource.id.clone());
    }
}

/// Retriever serving an in-memory catalog, with a switch to fail fetches.
#[derive(Default)]
pub struct MockRetriever {
    resources: Mutex<Vec<Resource>>,
    fail_fetches: AtomicBool,
    fetches: AtomicUsize,
    torn_down: AtomicBool,
}

impl MockRetriever {
    pub fn new(ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            resources: Mutex::new(ids.iter().map(|id| Resource::new(*id)).collect()),
            ..Default::default()
        })
    }

    /// A retriever whose every fetch fails.
    pub fn failing() -> Arc<Self> {
        let retriever = Self::new(&[]);
        retriever.fail_fetches.store(true, Ordering::SeqCst);
        retriever
    }

    /// Replace the served catalog.
    pub fn set_resources(&self, ids: &[&str]) {
        *self.resources.lock() = ids.iter().map(|id| Resource::new(*id)).collect();
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn was_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogRetriever for MockRetriever {
    async fn setup(&self, _api: Arc<dyn AllocationApi>) -> Result<()> {
        Ok(())
    }

    async fn fetch_resources(&self) -> Result<Vec<Resource>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(CatalogFetchError::Transport("injected fetch failure".to_string()).into());
        }
        Ok(self.resources.lock().clone())
    }

    async fn tear_down(&self) {
        self.torn_down.store(true, Ordering::SeqCst);
    }
}
