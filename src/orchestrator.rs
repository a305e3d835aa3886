//! The ownership protocol core.
//!
//! Tracks the set of resources this node owns, computes ownership diffs on
//! rebalance, and drives the handler. Handler failures are absorbed here and
//! reported through the handler's own failure callbacks; they never abort a
//! batch or cross the public API.

use crate::catalog::RetrieverRegistry;
use crate::handler::HandlerRegistry;
use crate::ring::RingClient;
use crate::types::Resource;
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Ownership state, mutated only by the orchestrator.
///
/// `in_flight` guards against double handler invocation when overlapping
/// setup/rebalance batches race on the same id: an id is claimed before its
/// handler call starts and released when the call resolves.
#[derive(Default)]
struct OwnershipState {
    /// Resources whose `handle_resource` succeeded, in allocation order.
    owned: Vec<Resource>,

    /// Ids with a handler call currently in flight.
    in_flight: HashSet<String>,
}

/// Computes and applies the diff between desired and actual local ownership.
pub struct Orchestrator {
    handlers: Arc<HandlerRegistry>,
    retrievers: Arc<RetrieverRegistry>,
    cache_all_resources: bool,
    state: Mutex<OwnershipState>,
    catalog_cache: Mutex<Option<Vec<Resource>>>,
}

impl Orchestrator {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        retrievers: Arc<RetrieverRegistry>,
        cache_all_resources: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            handlers,
            retrievers,
            cache_all_resources,
            state: Mutex::new(OwnershipState::default()),
            catalog_cache: Mutex::new(None),
        })
    }

    /// Filter the full catalog to the resources this node owns, optionally
    /// snapshot the catalog cache, and hand each owned resource to the
    /// handler. Per-resource handler calls run concurrently; one failure
    /// neither aborts nor delays the others. Already-owned ids are skipped.
    pub async fn initial_setup(
        self: &Arc<Self>,
        ring: &RingClient,
        resources: Vec<Resource>,
    ) -> Result<()> {
        info!(total = resources.len(), "Setting up resources");

        if self.cache_all_resources {
            *self.catalog_cache.lock() = Some(resources.clone());
        }

        let mine: Vec<Resource> = resources.into_iter().filter(|r| ring.owns(&r.id)).collect();
        info!(owned = mine.len(), "Resources owned by this node");

        let mut tasks = JoinSet::new();
        for resource in mine {
            let orchestrator = self.clone();
            tasks.spawn(async move { orchestrator.allocate(resource).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Ok(result) = joined {
                result?;
            }
        }

        Ok(())
    }

    /// Re-derive the desired ownership set and reconcile against the current
    /// one.
    ///
    /// The desired set comes from the catalog cache when populated, else from
    /// a fresh retriever fetch (whose failure propagates to the retry
    /// policy). The diff is computed by id: to-allocate and to-deallocate
    /// batches run concurrently with no ordering guarantee. Re-running with
    /// no net change is a no-op.
    pub async fn rebalance(self: &Arc<Self>, ring: &RingClient) -> Result<()> {
        info!(checksum = ring.checksum(), "Rebalancing resources");

        let catalog = match self.catalog_cache.lock().clone() {
            Some(cached) if !cached.is_empty() => cached,
            _ => self.retrievers.current()?.fetch_resources().await?,
        };

        let desired: Vec<Resource> = catalog.into_iter().filter(|r| ring.owns(&r.id)).collect();
        let desired_ids: HashSet<&str> = desired.iter().map(|r| r.id.as_str()).collect();

        let (to_allocate, to_deallocate) = {
            let state = self.state.lock();
            let owned_ids: HashSet<&str> = state.owned.iter().map(|r| r.id.as_str()).collect();

            let to_allocate: Vec<Resource> = desired
                .iter()
                .filter(|r| !owned_ids.contains(r.id.as_str()))
                .cloned()
                .collect();
            let to_deallocate: Vec<Resource> = state
                .owned
                .iter()
                .filter(|r| !desired_ids.contains(r.id.as_str()))
                .cloned()
                .collect();
            (to_allocate, to_deallocate)
        };

        info!(
            allocate = to_allocate.len(),
            deallocate = to_deallocate.len(),
            "Computed ownership diff"
        );

        let mut tasks = JoinSet::new();
        for resource in to_allocate {
            let orchestrator = self.clone();
            tasks.spawn(async move { orchestrator.allocate(resource).await });
        }
        for resource in to_deallocate {
            let orchestrator = self.clone();
            tasks.spawn(async move { orchestrator.terminate(resource).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Ok(result) = joined {
                result?;
            }
        }

        Ok(())
    }

    /// Hand one resource to the handler and record ownership on success.
    ///
    /// On handler failure the resource stays unowned (eligible again on the
    /// next rebalance) and `handle_failed_resource` fires once. Ids already
    /// owned, or with a handler call in flight, are skipped.
    pub async fn allocate(self: &Arc<Self>, resource: Resource) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.owned.iter().any(|r| r.id == resource.id) {
                debug!(resource_id = %resource.id, "Resource already handled, skipping");
                return Ok(());
            }
            if !state.in_flight.insert(resource.id.clone()) {
                debug!(resource_id = %resource.id, "Allocation already in flight, skipping");
                return Ok(());
            }
        }

        let handler = self.handlers.current()?;

        match handler.handle_resource(&resource).await {
            Ok(()) => {
                let mut state = self.state.lock();
                state.in_flight.remove(&resource.id);
                state.owned.push(resource);
            }
            Err(e) => {
                self.state.lock().in_flight.remove(&resource.id);
                error!(
                    resource_id = %resource.id,
                    error = %e,
                    "handle_resource failed"
                );
                handler.handle_failed_resource(&resource, &e);
            }
        }

        Ok(())
    }

    /// Remove one resource from the ownership set, then terminate it.
    ///
    /// Removal happens before the handler call so a slow or failing
    /// termination can never be observed as still-owned. A termination
    /// failure fires `handle_failed_termination` once and is not retried.
    pub async fn terminate(self: &Arc<Self>, resource: Resource) -> Result<()> {
        self.state.lock().owned.retain(|r| r.id != resource.id);

        let handler = self.handlers.current()?;

        if let Err(e) = handler.terminate_resource(&resource).await {
            error!(
                resource_id = %resource.id,
                error = %e,
                "terminate_resource failed"
            );
            handler.handle_failed_termination(&resource, &e);
        }

        Ok(())
    }

    /// A defensive copy of the ownership set.
    pub fn owned_resources(&self) -> Vec<Resource> {
        self.state.lock().owned.clone()
    }

    /// Whether the full-catalog cache currently holds a snapshot.
    pub fn has_cached_catalog(&self) -> bool {
        self.catalog_cache.lock().is_some()
    }

    /// Clear the ownership set. Teardown/restart hook only.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.owned.clear();
        state.in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ForwardConfig, RingConfig};
    use crate::error::{Error, HandlerError};
    use crate::handler::ResourceHandler;
    use crate::catalog::CatalogRetriever;
    use crate::manager::AllocationApi;
    use crate::ring::rpc::ForwardTarget;
    use crate::types::ResourceOp;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullTarget;

    #[async_trait]
    impl ForwardTarget for NullTarget {
        fn ring_checksum(&self) -> u64 {
            0
        }

        async fn apply(&self, _op: ResourceOp, _resource: Resource) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    /// Ring with only this node: it owns every id.
    async fn local_ring() -> Arc<RingClient> {
        let config = RingConfig::new(
            "herd-test",
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:1".parse().unwrap(),
        );
        RingClient::start_isolated(config, ForwardConfig::default(), Arc::new(NullTarget))
            .await
            .unwrap()
    }

    /// Handler recording per-id call counts; fails for configured ids.
    #[derive(Default)]
    struct CountingHandler {
        handled: Mutex<HashMap<String, usize>>,
        terminated: Mutex<HashMap<String, usize>>,
        failed: Mutex<Vec<String>>,
        failed_terminations: Mutex<Vec<String>>,
        fail_handle_ids: HashSet<String>,
        fail_terminate_ids: HashSet<String>,
        handle_delay: std::time::Duration,
    }

    impl CountingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn failing_handle(ids: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                fail_handle_ids: ids.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            })
        }

        /// A handler that sleeps inside `handle_resource`, keeping
        /// allocations in flight long enough to overlap.
        fn slow(delay: std::time::Duration) -> Arc<Self> {
            Arc::new(Self {
                handle_delay: delay,
                ..Default::default()
            })
        }

        fn failing_terminate(ids: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                fail_terminate_ids: ids.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            })
        }

        fn handle_count(&self, id: &str) -> usize {
            self.handled.lock().get(id).copied().unwrap_or(0)
        }

        fn terminate_count(&self, id: &str) -> usize {
            self.terminated.lock().get(id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl ResourceHandler for CountingHandler {
        async fn handle_resource(
            &self,
            resource: &Resource,
        ) -> std::result::Result<(), HandlerError> {
            *self.handled.lock().entry(resource.id.clone()).or_insert(0) += 1;
            if !self.handle_delay.is_zero() {
                tokio::time::sleep(self.handle_delay).await;
            }
            if self.fail_handle_ids.contains(&resource.id) {
                return Err(format!("cannot handle {}", resource.id).into());
            }
            Ok(())
        }

        fn handle_failed_resource(&self, resource: &Resource, _error: &HandlerError) {
            self.failed.lock().push(resource.id.clone());
        }

        async fn terminate_resource(
            &self,
            resource: &Resource,
        ) -> std::result::Result<(), HandlerError> {
            *self
                .terminated
                .lock()
                .entry(resource.id.clone())
                .or_insert(0) += 1;
            if self.fail_terminate_ids.contains(&resource.id) {
                return Err(format!("cannot terminate {}", resource.id).into());
            }
            Ok(())
        }

        fn handle_failed_termination(&self, resource: &Resource, _error: &HandlerError) {
            self.failed_terminations.lock().push(resource.id.clone());
        }
    }

    /// Retriever serving a fixed list and counting fetches.
    struct FixedRetriever {
        resources: Mutex<Vec<Resource>>,
        fetches: AtomicUsize,
    }

    impl FixedRetriever {
        fn new(ids: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                resources: Mutex::new(ids.iter().map(|id| Resource::new(*id)).collect()),
                fetches: AtomicUsize::new(0),
            })
        }

        fn set_resources(&self, ids: &[&str]) {
            *self.resources.lock() = ids.iter().map(|id| Resource::new(*id)).collect();
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CatalogRetriever for FixedRetriever {
        async fn setup(&self, _api: Arc<dyn AllocationApi>) -> Result<()> {
            Ok(())
        }

        async fn fetch_resources(&self) -> Result<Vec<Resource>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.resources.lock().clone())
        }

        async fn tear_down(&self) {}
    }

    fn orchestrator_with(
        handler: Arc<CountingHandler>,
        retriever: Arc<FixedRetriever>,
        cache: bool,
    ) -> Arc<Orchestrator> {
        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register(handler).unwrap();
        let retrievers = Arc::new(RetrieverRegistry::new());
        retrievers.register(retriever).unwrap();
        Orchestrator::new(handlers, retrievers, cache)
    }

    fn ids(resources: &[Resource]) -> Vec<&str> {
        let mut ids: Vec<&str> = resources.iter().map(|r| r.id.as_str()).collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_initial_setup_owns_everything_on_single_node() {
        let ring = local_ring().await;
        let handler = CountingHandler::new();
        let orchestrator =
            orchestrator_with(handler.clone(), FixedRetriever::new(&[]), false);

        let resources = vec![Resource::new("1"), Resource::new("2"), Resource::new("3")];
        orchestrator.initial_setup(&ring, resources).await.unwrap();

        assert_eq!(ids(&orchestrator.owned_resources()), vec!["1", "2", "3"]);
        assert_eq!(handler.handle_count("1"), 1);
        assert_eq!(handler.handle_count("2"), 1);
        assert_eq!(handler.handle_count("3"), 1);
    }

    #[tokio::test]
    async fn test_initial_setup_is_idempotent() {
        let ring = local_ring().await;
        let handler = CountingHandler::new();
        let orchestrator =
            orchestrator_with(handler.clone(), FixedRetriever::new(&[]), false);

        let resources = vec![Resource::new("1"), Resource::new("2")];
        orchestrator
            .initial_setup(&ring, resources.clone())
            .await
            .unwrap();
        orchestrator.initial_setup(&ring, resources).await.unwrap();

        assert_eq!(ids(&orchestrator.owned_resources()), vec!["1", "2"]);
        assert_eq!(handler.handle_count("1"), 1);
        assert_eq!(handler.handle_count("2"), 1);
    }

    #[tokio::test]
    async fn test_overlapping_setups_never_double_invoke_the_handler() {
        let ring = local_ring().await;
        let handler = CountingHandler::slow(std::time::Duration::from_millis(50));
        let orchestrator =
            orchestrator_with(handler.clone(), FixedRetriever::new(&[]), false);

        let resources: Vec<Resource> = (0..8).map(|i| Resource::new(format!("r-{i}"))).collect();

        // Both batches run while every allocation is still sleeping; the
        // in-flight guard must keep the second batch from re-invoking.
        let (first, second) = tokio::join!(
            orchestrator.initial_setup(&ring, resources.clone()),
            orchestrator.initial_setup(&ring, resources)
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(orchestrator.owned_resources().len(), 8);
        for i in 0..8 {
            assert_eq!(handler.handle_count(&format!("r-{i}")), 1);
        }
    }

    #[tokio::test]
    async fn test_allocation_failure_is_isolated() {
        let ring = local_ring().await;
        let handler = CountingHandler::failing_handle(&["2"]);
        let orchestrator =
            orchestrator_with(handler.clone(), FixedRetriever::new(&[]), false);

        let resources = vec![Resource::new("1"), Resource::new("2"), Resource::new("3")];
        orchestrator.initial_setup(&ring, resources).await.unwrap();

        assert_eq!(ids(&orchestrator.owned_resources()), vec!["1", "3"]);
        assert_eq!(handler.failed.lock().as_slice(), &["2".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_allocation_retried_on_next_rebalance() {
        let ring = local_ring().await;
        let handler = CountingHandler::failing_handle(&["2"]);
        let retriever = FixedRetriever::new(&["1", "2"]);
        let orchestrator = orchestrator_with(handler.clone(), retriever, false);

        orchestrator
            .initial_setup(&ring, vec![Resource::new("1"), Resource::new("2")])
            .await
            .unwrap();
        assert_eq!(ids(&orchestrator.owned_resources()), vec!["1"]);

        // "2" is still absent from the owned set, so the rebalance tries again
        orchestrator.rebalance(&ring).await.unwrap();
        assert_eq!(handler.handle_count("2"), 2);
    }

    #[tokio::test]
    async fn test_rebalance_diff_correctness() {
        let ring = local_ring().await;
        let handler = CountingHandler::new();
        let retriever = FixedRetriever::new(&["3", "4", "5"]);
        let orchestrator = orchestrator_with(handler.clone(), retriever, false);

        orchestrator
            .initial_setup(&ring, vec![Resource::new("1"), Resource::new("3")])
            .await
            .unwrap();

        orchestrator.rebalance(&ring).await.unwrap();

        assert_eq!(ids(&orchestrator.owned_resources()), vec!["3", "4", "5"]);
        // Allocated exactly {4, 5}
        assert_eq!(handler.handle_count("4"), 1);
        assert_eq!(handler.handle_count("5"), 1);
        assert_eq!(handler.handle_count("3"), 1); // from setup only
        // Terminated exactly {1}
        assert_eq!(handler.terminate_count("1"), 1);
        assert_eq!(handler.terminate_count("3"), 0);
    }

    #[tokio::test]
    async fn test_rebalance_is_idempotent() {
        let ring = local_ring().await;
        let handler = CountingHandler::new();
        let retriever = FixedRetriever::new(&["1", "2"]);
        let orchestrator = orchestrator_with(handler.clone(), retriever, false);

        orchestrator
            .initial_setup(&ring, vec![Resource::new("1"), Resource::new("2")])
            .await
            .unwrap();
        orchestrator.rebalance(&ring).await.unwrap();
        orchestrator.rebalance(&ring).await.unwrap();

        assert_eq!(handler.handle_count("1"), 1);
        assert_eq!(handler.handle_count("2"), 1);
        assert_eq!(handler.terminate_count("1"), 0);
    }

    #[tokio::test]
    async fn test_termination_failure_does_not_readd() {
        let ring = local_ring().await;
        let handler = CountingHandler::failing_terminate(&["1"]);
        let retriever = FixedRetriever::new(&["2"]);
        let orchestrator = orchestrator_with(handler.clone(), retriever, false);

        orchestrator
            .initial_setup(&ring, vec![Resource::new("1"), Resource::new("2")])
            .await
            .unwrap();

        orchestrator.rebalance(&ring).await.unwrap();

        assert_eq!(ids(&orchestrator.owned_resources()), vec!["2"]);
        assert_eq!(
            handler.failed_terminations.lock().as_slice(),
            &["1".to_string()]
        );

        // A further rebalance does not re-terminate
        orchestrator.rebalance(&ring).await.unwrap();
        assert_eq!(handler.terminate_count("1"), 1);
    }

    #[tokio::test]
    async fn test_cache_mode_skips_refetch() {
        let ring = local_ring().await;
        let handler = CountingHandler::new();
        let retriever = FixedRetriever::new(&["1", "2"]);
        let orchestrator = orchestrator_with(handler, retriever.clone(), true);

        orchestrator
            .initial_setup(&ring, vec![Resource::new("1"), Resource::new("2")])
            .await
            .unwrap();
        assert!(orchestrator.has_cached_catalog());

        orchestrator.rebalance(&ring).await.unwrap();
        orchestrator.rebalance(&ring).await.unwrap();

        assert_eq!(retriever.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_without_cache_every_rebalance_fetches() {
        let ring = local_ring().await;
        let handler = CountingHandler::new();
        let retriever = FixedRetriever::new(&["1"]);
        let orchestrator = orchestrator_with(handler, retriever.clone(), false);

        orchestrator.initial_setup(&ring, Vec::new()).await.unwrap();
        orchestrator.rebalance(&ring).await.unwrap();
        orchestrator.rebalance(&ring).await.unwrap();

        assert_eq!(retriever.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_rebalance_drops_resources_owned_elsewhere() {
        let ring = local_ring().await;
        let handler = CountingHandler::new();
        let retriever = FixedRetriever::new(&["1", "2", "3"]);
        let orchestrator = orchestrator_with(handler.clone(), retriever.clone(), false);

        orchestrator
            .initial_setup(
                &ring,
                vec![Resource::new("1"), Resource::new("2"), Resource::new("3")],
            )
            .await
            .unwrap();
        assert_eq!(orchestrator.owned_resources().len(), 3);

        // A peer joins and takes over part of the id space
        let peer: crate::types::NodeAddr = "127.0.0.1:4999".parse().unwrap();
        ring.simulate_join(peer).await;
        for _ in 0..100 {
            if ring.member_count() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        orchestrator.rebalance(&ring).await.unwrap();

        let owned = orchestrator.owned_resources();
        for resource in &owned {
            assert!(ring.owns(&resource.id));
        }
        // Everything no longer owned was terminated exactly once
        for id in ["1", "2", "3"] {
            let expected = if ring.owns(id) { 0 } else { 1 };
            assert_eq!(handler.terminate_count(id), expected, "id {}", id);
        }
    }

    #[tokio::test]
    async fn test_owned_resources_is_a_defensive_copy() {
        let ring = local_ring().await;
        let handler = CountingHandler::new();
        let orchestrator =
            orchestrator_with(handler, FixedRetriever::new(&[]), false);

        orchestrator
            .initial_setup(&ring, vec![Resource::new("1")])
            .await
            .unwrap();

        let mut copy = orchestrator.owned_resources();
        copy.clear();
        assert_eq!(orchestrator.owned_resources().len(), 1);
    }

    #[tokio::test]
    async fn test_reset_clears_ownership() {
        let ring = local_ring().await;
        let handler = CountingHandler::new();
        let orchestrator =
            orchestrator_with(handler, FixedRetriever::new(&[]), false);

        orchestrator
            .initial_setup(&ring, vec![Resource::new("1")])
            .await
            .unwrap();
        orchestrator.reset();
        assert!(orchestrator.owned_resources().is_empty());
    }

    #[tokio::test]
    async fn test_rebalance_propagates_missing_retriever() {
        let ring = local_ring().await;
        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register(CountingHandler::new()).unwrap();
        let orchestrator =
            Orchestrator::new(handlers, Arc::new(RetrieverRegistry::new()), false);

        let err = orchestrator.rebalance(&ring).await.unwrap_err();
        assert!(matches!(err, Error::NotConfigured("catalog retriever")));
    }
}
