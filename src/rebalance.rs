//! Membership-driven rebalancing.
//!
//! A single supervisor task subscribes to ring membership changes and runs
//! the orchestrator's rebalance in response. Triggers are serialized: while a
//! rebalance (or its retries) is in flight, further membership changes
//! coalesce into at most one pending run against the then-current ring.
//!
//! A failing rebalance is retried with exponential backoff until it succeeds
//! or a wall-clock budget is spent. Spending the budget means this node can
//! no longer converge on its ownership set, so it leaves the ring and tears
//! the catalog retriever down rather than serve a stale partition.

use crate::catalog::RetrieverRegistry;
use crate::error::Error;
use crate::orchestrator::Orchestrator;
use crate::ring::RingClient;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Runs rebalances in response to membership changes, one at a time.
pub struct RebalanceSupervisor {
    shutdown_tx: mpsc::Sender<()>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RebalanceSupervisor {
    /// Subscribe to the ring and start supervising. Must be called after the
    /// ring is up.
    pub fn spawn(
        ring: Arc<RingClient>,
        orchestrator: Arc<Orchestrator>,
        retrievers: Arc<RetrieverRegistry>,
        max_retry_time: Duration,
    ) -> Self {
        let mut changes = ring.subscribe();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let handle = tokio::spawn(async move {
            loop {
                // Shutdown is only observed between rebalances, so a run in
                // flight always completes before the task exits.
                let mut change = tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => return,
                    maybe = changes.recv() => match maybe {
                        Some(change) => change,
                        None => return,
                    },
                };
                // Coalesce queued changes into one run against the latest ring.
                while let Ok(newer) = changes.try_recv() {
                    change = newer;
                }
                debug!(
                    added = change.added.len(),
                    removed = change.removed.len(),
                    checksum = change.checksum,
                    "Membership changed, rebalancing"
                );

                match rebalance_with_retry(&ring, &orchestrator, max_retry_time).await {
                    Ok(()) => {}
                    Err(e) => {
                        error!(error = %e, "Rebalance budget exhausted, leaving the ring");
                        ring.shutdown().await;
                        if let Ok(retriever) = retrievers.current() {
                            retriever.tear_down().await;
                        }
                        return;
                    }
                }
            }
        });
        Self {
            shutdown_tx,
            handle: parking_lot::Mutex::new(Some(handle)),
        }
    }

    /// Stop supervising. A rebalance in flight finishes its handler calls
    /// before this resolves. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.try_send(());
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for RebalanceSupervisor {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.try_send(());
    }
}

/// Retry a failing rebalance with exponential backoff until the elapsed-time
/// budget is spent. Catalog fetch failures during the rebalance count against
/// the same budget.
async fn rebalance_with_retry(
    ring: &Arc<RingClient>,
    orchestrator: &Arc<Orchestrator>,
    budget: Duration,
) -> Result<(), Error> {
    let started = Instant::now();
    let mut attempts: u32 = 0;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        attempts += 1;
        match orchestrator.rebalance(ring).await {
            Ok(()) => {
                info!(attempts, "Rebalance complete");
                return Ok(());
            }
            Err(e) => {
                let elapsed = started.elapsed();
                if elapsed >= budget {
                    return Err(Error::RebalanceExhausted {
                        attempts,
                        elapsed_ms: elapsed.as_millis() as u64,
                    });
                }
                warn!(
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "Rebalance failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}
