//! The ring client: membership, ownership lookup, and remote forwarding.
//!
//! Composes the gossip membership layer, the consistent hash ring, and the
//! resource RPC endpoint into the handle the rest of the crate consumes. The
//! ring is mutated only by this subsystem; the orchestrator, rebalance
//! supervisor, and manager just query it.

use crate::config::{ForwardConfig, RingConfig};
use crate::error::{BootstrapError, ForwardError};
use crate::ring::hashring::HashRing;
use crate::ring::membership::{GossipMembership, MemberDelta};
use crate::ring::rpc::{self, ForwardRequest, ForwardTarget, RpcServer};
use crate::types::{NodeAddr, Resource, ResourceOp};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delay between forward retry attempts.
const FORWARD_RETRY_DELAY: Duration = Duration::from_millis(200);

/// One membership delta as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    /// Nodes that joined in this delta.
    pub added: Vec<NodeAddr>,

    /// Nodes that left in this delta.
    pub removed: Vec<NodeAddr>,

    /// Ring checksum after applying the delta.
    pub checksum: u64,
}

/// Handle to cluster membership and the forwarding primitive.
pub struct RingClient {
    config: RingConfig,
    forward_config: ForwardConfig,
    ring: RwLock<HashRing>,
    membership: tokio::sync::Mutex<GossipMembership>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<MembershipChange>>>,
    rpc_shutdown: Mutex<Option<mpsc::Sender<()>>>,
    pump_handle: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for RingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RingClient {
    /// Join (or bootstrap) the ring and start serving forwarded operations.
    ///
    /// Resolves only once the RPC endpoint is bound and this node is a stable
    /// gossip member. On failure nothing is left running.
    pub async fn start(
        config: RingConfig,
        seed_addrs: Vec<SocketAddr>,
        forward_config: ForwardConfig,
        target: Arc<dyn ForwardTarget>,
    ) -> Result<Arc<Self>, BootstrapError> {
        let client = Self::bind(config, seed_addrs, forward_config, target).await?;

        // Join the gossip network. On failure, unwind the RPC server too.
        let mut membership = client.membership.lock().await;
        if let Err(e) = membership.start().await {
            drop(membership);
            client.stop_local_tasks().await;
            return Err(e);
        }

        // Members discovered during the seed join land in the registry before
        // the pump drains their deltas; seed the ring from the registry so
        // lookup is correct the moment start returns.
        {
            let registry = membership.registry();
            let mut ring = client.ring.write();
            for member in registry.members() {
                ring.add_node(member);
            }
        }
        drop(membership);

        info!(
            whoami = %client.whoami(),
            members = client.ring.read().node_count(),
            checksum = client.checksum(),
            "Ring client ready"
        );
        Ok(client)
    }

    /// Start with the RPC endpoint and event pump but without gossip.
    ///
    /// Membership is driven via `simulate_join`/`simulate_leave`. For tests.
    pub async fn start_isolated(
        config: RingConfig,
        forward_config: ForwardConfig,
        target: Arc<dyn ForwardTarget>,
    ) -> Result<Arc<Self>, BootstrapError> {
        Self::bind(config, Vec::new(), forward_config, target).await
    }

    /// Bind the RPC endpoint and spawn the membership event pump. The ring
    /// starts with only this node.
    async fn bind(
        mut config: RingConfig,
        seed_addrs: Vec<SocketAddr>,
        forward_config: ForwardConfig,
        target: Arc<dyn ForwardTarget>,
    ) -> Result<Arc<Self>, BootstrapError> {
        let (server, rpc_shutdown) = RpcServer::bind(config.rpc_addr, target).await?;

        // Port 0 resolves at bind time; the resolved address is the identity
        // gossiped to the ring.
        if config.rpc_addr.port() == 0 {
            if let Ok(addr) = server.local_addr() {
                config.rpc_addr = addr;
            }
        }

        let mut membership = GossipMembership::new(config.clone(), seed_addrs);
        let delta_rx = membership
            .take_delta_rx()
            .expect("fresh membership always has a delta receiver");

        let mut ring = HashRing::new();
        ring.add_node(config.rpc_addr);

        let client = Arc::new(Self {
            config,
            forward_config,
            ring: RwLock::new(ring),
            membership: tokio::sync::Mutex::new(membership),
            subscribers: Mutex::new(Vec::new()),
            rpc_shutdown: Mutex::new(Some(rpc_shutdown)),
            pump_handle: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        tokio::spawn(server.run());

        let pump = tokio::spawn(Self::pump_deltas(client.clone(), delta_rx));
        *client.pump_handle.lock() = Some(pump);

        Ok(client)
    }

    /// Consume membership deltas: update the ring, fan out to subscribers.
    async fn pump_deltas(
        client: Arc<Self>,
        mut delta_rx: mpsc::UnboundedReceiver<MemberDelta>,
    ) {
        while let Some(delta) = delta_rx.recv().await {
            let change = {
                let mut ring = client.ring.write();
                let (added, removed) = match delta {
                    MemberDelta::Joined(addr) => {
                        ring.add_node(addr);
                        (vec![addr], Vec::new())
                    }
                    MemberDelta::Left(addr) => {
                        ring.remove_node(addr);
                        (Vec::new(), vec![addr])
                    }
                };
                MembershipChange {
                    added,
                    removed,
                    checksum: ring.checksum(),
                }
            };

            info!(
                added = ?change.added,
                removed = ?change.removed,
                checksum = change.checksum,
                "Ring membership changed"
            );

            client
                .subscribers
                .lock()
                .retain(|tx| tx.send(change.clone()).is_ok());
        }
    }

    /// Identity of the local node as known to the ring.
    pub fn whoami(&self) -> NodeAddr {
        self.config.rpc_addr
    }

    /// The owning node for a resource id.
    ///
    /// Never fails after a successful start: the ring always contains self.
    pub fn lookup(&self, resource_id: &str) -> Option<NodeAddr> {
        self.ring.read().lookup(resource_id)
    }

    /// Whether this node owns the given resource id.
    pub fn owns(&self, resource_id: &str) -> bool {
        self.lookup(resource_id) == Some(self.whoami())
    }

    /// Current ring checksum.
    pub fn checksum(&self) -> u64 {
        self.ring.read().checksum()
    }

    /// Number of ring members, including self.
    pub fn member_count(&self) -> usize {
        self.ring.read().node_count()
    }

    /// Subscribe to membership changes. Each delta is delivered once per
    /// subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MembershipChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Send a resource operation to the remote owner.
    ///
    /// Bounded timeout per attempt and a bounded retry count. Self-forwarding
    /// is a routing bug, not a transport concern, and is rejected outright.
    pub async fn forward(
        &self,
        resource: &Resource,
        target: NodeAddr,
        op: ResourceOp,
    ) -> Result<(), ForwardError> {
        if target == self.whoami() {
            return Err(ForwardError::Remote {
                addr: target.to_string(),
                reason: "refusing to forward to self".to_string(),
            });
        }

        let mut last_err = ForwardError::Unreachable {
            addr: target.to_string(),
            reason: "no attempts made".to_string(),
        };

        for attempt in 1..=self.forward_config.retry_limit {
            let request = ForwardRequest {
                ring_checksum: self.checksum(),
                op,
                resource: resource.clone(),
            };

            debug!(
                resource_id = %resource.id,
                target = %target,
                op = %op,
                attempt,
                "Forwarding resource operation"
            );

            match rpc::send_forward(
                target,
                request,
                self.forward_config.connect_timeout,
                self.forward_config.timeout,
            )
            .await
            {
                Ok(resp) if resp.success => return Ok(()),
                Ok(resp) if resp.checksum_mismatch => {
                    // Gossip may still be converging; retry after a pause.
                    last_err = ForwardError::ChecksumMismatch {
                        addr: target.to_string(),
                    };
                }
                Ok(resp) => {
                    return Err(ForwardError::Remote {
                        addr: target.to_string(),
                        reason: resp.error.unwrap_or_else(|| "unknown".to_string()),
                    });
                }
                Err(e) => {
                    warn!(
                        resource_id = %resource.id,
                        target = %target,
                        attempt,
                        error = %e,
                        "Forward attempt failed"
                    );
                    last_err = e;
                }
            }

            if attempt < self.forward_config.retry_limit {
                tokio::time::sleep(FORWARD_RETRY_DELAY).await;
            }
        }

        Err(last_err)
    }

    /// Whether `shutdown` has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Leave the ring and stop serving. Idempotent, safe after failed setup.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.membership.lock().await.leave().await;
        self.stop_local_tasks().await;
        info!(whoami = %self.whoami(), "Ring client shut down");
    }

    async fn stop_local_tasks(&self) {
        if let Some(shutdown) = self.rpc_shutdown.lock().take() {
            let _ = shutdown.send(()).await;
        }
        if let Some(pump) = self.pump_handle.lock().take() {
            pump.abort();
        }
    }

    /// Inject a member join without gossip. For tests.
    pub async fn simulate_join(&self, rpc_addr: NodeAddr) {
        self.membership.lock().await.simulate_join(rpc_addr);
    }

    /// Inject a member leave without gossip. For tests.
    pub async fn simulate_leave(&self, rpc_addr: NodeAddr) {
        self.membership.lock().await.simulate_leave(rpc_addr);
    }
}
