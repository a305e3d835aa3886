//! The public manager facade.
//!
//! `Manager::start` wires the whole node together: validates configuration,
//! registers the handler and catalog retriever, joins the ring, performs the
//! initial catalog fetch and setup, and starts the rebalance supervisor.
//! `allocate_resource`/`deallocate_resource` route an operation to the owning
//! node, handling locally or forwarding over RPC.

use crate::catalog::{CatalogRetriever, HttpCatalogRetriever, RetrieverRegistry};
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::handler::{HandlerRegistry, ResourceHandler};
use crate::orchestrator::Orchestrator;
use crate::rebalance::RebalanceSupervisor;
use crate::ring::rpc::ForwardTarget;
use crate::ring::RingClient;
use crate::types::{NodeAddr, Resource, ResourceOp};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// The manager's allocation surface, as seen by catalog retrievers.
///
/// Routing goes through ring ownership: the resource is handled locally when
/// this node owns it and forwarded to the owner otherwise.
#[async_trait]
pub trait AllocationApi: Send + Sync + 'static {
    /// Ensure the resource is handled by its owning node.
    async fn allocate_resource(&self, resource: &Resource) -> Result<()>;

    /// Ensure the resource is terminated on its owning node.
    async fn deallocate_resource(&self, resource: &Resource) -> Result<()>;
}

/// Applies forwarded operations from peers to the local orchestrator.
///
/// The ring slot is set right after the ring starts; a forward racing that
/// window sees checksum 0 and is rejected, which the sender retries.
struct ForwardReceiver {
    orchestrator: Arc<Orchestrator>,
    ring: OnceLock<Arc<RingClient>>,
}

#[async_trait]
impl ForwardTarget for ForwardReceiver {
    fn ring_checksum(&self) -> u64 {
        self.ring.get().map(|r| r.checksum()).unwrap_or(0)
    }

    async fn apply(&self, op: ResourceOp, resource: Resource) -> std::result::Result<(), String> {
        debug!(resource_id = %resource.id, op = %op, "Applying forwarded operation");
        let result = match op {
            ResourceOp::Allocate => self.orchestrator.allocate(resource).await,
            ResourceOp::Deallocate => self.orchestrator.terminate(resource).await,
        };
        result.map_err(|e| e.to_string())
    }
}

/// One node of the resource manager cluster.
pub struct Manager {
    config: ManagerConfig,
    ring: Arc<RingClient>,
    orchestrator: Arc<Orchestrator>,
    retrievers: Arc<RetrieverRegistry>,
    supervisor: Mutex<Option<RebalanceSupervisor>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Start a node with the default HTTP catalog retriever.
    pub async fn start(
        config: ManagerConfig,
        handler: Arc<dyn ResourceHandler>,
    ) -> Result<Arc<Self>> {
        config.validate(false)?;
        let retriever = Arc::new(HttpCatalogRetriever::new(config.catalog.clone()));
        Self::start_inner(config, handler, retriever).await
    }

    /// Start a node with a custom catalog retriever.
    ///
    /// The HTTP catalog settings are ignored; the retriever is the sole
    /// source of the resource catalog.
    pub async fn start_with_retriever(
        config: ManagerConfig,
        handler: Arc<dyn ResourceHandler>,
        retriever: Arc<dyn CatalogRetriever>,
    ) -> Result<Arc<Self>> {
        config.validate(true)?;
        Self::start_inner(config, handler, retriever).await
    }

    async fn start_inner(
        config: ManagerConfig,
        handler: Arc<dyn ResourceHandler>,
        retriever: Arc<dyn CatalogRetriever>,
    ) -> Result<Arc<Self>> {
        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register(handler)?;
        let retrievers = Arc::new(RetrieverRegistry::new());
        retrievers.register(retriever.clone())?;

        let orchestrator = Orchestrator::new(
            handlers,
            retrievers.clone(),
            config.cache_all_resources,
        );

        let receiver = Arc::new(ForwardReceiver {
            orchestrator: orchestrator.clone(),
            ring: OnceLock::new(),
        });

        let ring = RingClient::start(
            config.ring.clone(),
            config.seed_addrs.clone(),
            config.forward.clone(),
            receiver.clone(),
        )
        .await?;
        let _ = receiver.ring.set(ring.clone());

        let manager = Arc::new(Self {
            config,
            ring: ring.clone(),
            orchestrator: orchestrator.clone(),
            retrievers: retrievers.clone(),
            supervisor: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });

        // Retriever setup and initial catalog load. The ring is already
        // joined, so a failure here must unwind it.
        let api: Arc<dyn AllocationApi> = manager.clone();
        let setup = async {
            retriever.setup(api).await?;
            let resources = retriever.fetch_resources().await?;
            orchestrator.initial_setup(&ring, resources).await
        };
        if let Err(e) = setup.await {
            error!(error = %e, "Startup failed after ring join, unwinding");
            ring.shutdown().await;
            retriever.tear_down().await;
            return Err(e);
        }

        *manager.supervisor.lock() = Some(RebalanceSupervisor::spawn(
            ring,
            orchestrator,
            retrievers,
            manager.config.max_rebalance_retry_time,
        ));

        info!(whoami = %manager.whoami(), "Resource manager started");
        Ok(manager)
    }

    /// This node's ring identity.
    pub fn whoami(&self) -> NodeAddr {
        self.ring.whoami()
    }

    /// The node currently owning the given resource id.
    pub fn lookup(&self, resource_id: &str) -> Result<NodeAddr> {
        self.ring.lookup(resource_id).ok_or(Error::RingEmpty)
    }

    /// Resources currently handled by this node. Defensive copy.
    pub fn allocated_resources(&self) -> Vec<Resource> {
        self.orchestrator.owned_resources()
    }

    /// The ring client, for inspection.
    pub fn ring(&self) -> &Arc<RingClient> {
        &self.ring
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) || self.ring.is_shut_down() {
            return Err(Error::Internal("manager is stopped".to_string()));
        }
        Ok(())
    }

    async fn route(&self, resource: &Resource, op: ResourceOp) -> Result<()> {
        self.ensure_running()?;
        let owner = self.lookup(&resource.id)?;

        if owner == self.whoami() {
            match op {
                ResourceOp::Allocate => self.orchestrator.allocate(resource.clone()).await,
                ResourceOp::Deallocate => self.orchestrator.terminate(resource.clone()).await,
            }
        } else {
            debug!(
                resource_id = %resource.id,
                owner = %owner,
                op = %op,
                "Resource owned elsewhere, forwarding"
            );
            self.ring.forward(resource, owner, op).await?;
            Ok(())
        }
    }

    /// Stop this node: stop rebalancing, leave the ring, terminate every
    /// locally handled resource, and tear the retriever down. Idempotent.
    ///
    /// A rebalance in flight drains before the node leaves, so handler calls
    /// it started are never cancelled mid-execution.
    ///
    /// Terminations run concurrently and are best effort; failures surface
    /// through `handle_failed_termination` only.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(whoami = %self.whoami(), "Stopping resource manager");

        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            supervisor.stop().await;
        }
        self.ring.shutdown().await;

        let mut tasks = JoinSet::new();
        for resource in self.orchestrator.owned_resources() {
            let orchestrator = self.orchestrator.clone();
            tasks.spawn(async move {
                let _ = orchestrator.terminate(resource).await;
            });
        }
        while tasks.join_next().await.is_some() {}
        self.orchestrator.reset();

        if let Ok(retriever) = self.retrievers.current() {
            retriever.tear_down().await;
        }
    }
}

#[async_trait]
impl AllocationApi for Manager {
    async fn allocate_resource(&self, resource: &Resource) -> Result<()> {
        self.route(resource, ResourceOp::Allocate).await
    }

    async fn deallocate_resource(&self, resource: &Resource) -> Result<()> {
        self.route(resource, ResourceOp::Deallocate).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RingConfig;
    use crate::error::ConfigError;
    use crate::testing::{free_tcp_addr, MockHandler, MockRetriever};
    use std::time::Duration;

    async fn single_node_config(app: &str) -> ManagerConfig {
        let rpc_addr = free_tcp_addr().await;
        let gossip_addr = free_tcp_addr().await;
        ManagerConfig::new(RingConfig::new(app, rpc_addr, gossip_addr))
            // Seeding with our own gossip address bootstraps a fresh ring
            .with_seed_addrs(vec![gossip_addr])
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let rpc_addr = free_tcp_addr().await;
        let config = ManagerConfig::new(RingConfig::new("", rpc_addr, rpc_addr));

        let err = Manager::start_with_retriever(
            config,
            MockHandler::new(),
            MockRetriever::new(&[]),
        )
        .await
        .unwrap_err();

        match err {
            Error::Config(ConfigError { violations }) => {
                assert!(violations.len() >= 2);
            }
            other => panic!("expected config error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_single_node_lifecycle() {
        let config = single_node_config("herd-mgr-lifecycle").await;
        let handler = MockHandler::new();
        let retriever = MockRetriever::new(&["a", "b", "c"]);

        let manager = Manager::start_with_retriever(config, handler.clone(), retriever)
            .await
            .unwrap();

        let mut owned: Vec<String> = manager
            .allocated_resources()
            .into_iter()
            .map(|r| r.id)
            .collect();
        owned.sort();
        assert_eq!(owned, vec!["a", "b", "c"]);

        manager.stop().await;
        assert!(manager.allocated_resources().is_empty());
        assert_eq!(handler.terminated_ids().len(), 3);

        // A second stop is a no-op
        manager.stop().await;
        assert_eq!(handler.terminated_ids().len(), 3);
    }

    #[tokio::test]
    async fn test_allocate_and_deallocate_locally() {
        let config = single_node_config("herd-mgr-alloc").await;
        let handler = MockHandler::new();
        let retriever = MockRetriever::new(&[]);

        let manager = Manager::start_with_retriever(config, handler.clone(), retriever)
            .await
            .unwrap();

        let resource = Resource::new("orders-queue");
        manager.allocate_resource(&resource).await.unwrap();
        assert_eq!(manager.allocated_resources().len(), 1);
        assert_eq!(handler.handled_ids(), vec!["orders-queue"]);

        manager.deallocate_resource(&resource).await.unwrap();
        assert!(manager.allocated_resources().is_empty());
        assert_eq!(handler.terminated_ids(), vec!["orders-queue"]);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_stop_completes_when_terminations_fail() {
        let config = single_node_config("herd-mgr-failstop").await;
        let handler = MockHandler::failing_terminations();
        let retriever = MockRetriever::new(&["a", "b"]);

        let manager = Manager::start_with_retriever(config, handler.clone(), retriever)
            .await
            .unwrap();
        assert_eq!(manager.allocated_resources().len(), 2);

        manager.stop().await;
        assert!(manager.allocated_resources().is_empty());
        assert_eq!(handler.failed_termination_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_operations_fail_after_stop() {
        let config = single_node_config("herd-mgr-stopped").await;
        let manager = Manager::start_with_retriever(
            config,
            MockHandler::new(),
            MockRetriever::new(&[]),
        )
        .await
        .unwrap();

        manager.stop().await;
        let err = manager
            .allocate_resource(&Resource::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_failed_initial_fetch_unwinds_ring() {
        let config = single_node_config("herd-mgr-unwind").await;
        let retriever = MockRetriever::failing();

        let err = Manager::start_with_retriever(config, MockHandler::new(), retriever.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CatalogFetch(_)));
        assert!(retriever.was_torn_down());
    }

    #[tokio::test]
    async fn test_lookup_points_at_self_on_single_node() {
        let config = single_node_config("herd-mgr-lookup").await;
        let manager = Manager::start_with_retriever(
            config,
            MockHandler::new(),
            MockRetriever::new(&[]),
        )
        .await
        .unwrap();

        assert_eq!(manager.lookup("anything").unwrap(), manager.whoami());
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_default_http_retriever_requires_url() {
        let rpc_addr = free_tcp_addr().await;
        let gossip_addr = free_tcp_addr().await;
        let config = ManagerConfig::new(RingConfig::new("herd-mgr-nourl", rpc_addr, gossip_addr))
            .with_seed_addrs(vec![gossip_addr]);

        let err = Manager::start(config, MockHandler::new()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    // Exercised indirectly everywhere, but the poll path deserves a direct
    // check: a polling retriever routes through the manager as AllocationApi.
    #[tokio::test]
    async fn test_polling_retriever_routes_through_manager() {
        let config = single_node_config("herd-mgr-poll").await;
        let handler = MockHandler::new();
        let retriever = MockRetriever::new(&[]);

        let manager = Manager::start_with_retriever(config, handler.clone(), retriever)
            .await
            .unwrap();

        let api: Arc<dyn AllocationApi> = manager.clone();
        api.allocate_resource(&Resource::new("polled")).await.unwrap();

        for _ in 0..100 {
            if !manager.allocated_resources().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.handled_ids(), vec!["polled"]);

        manager.stop().await;
    }
}
