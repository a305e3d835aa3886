//! Gossip-based ring membership via the `memberlist` SWIM implementation.
//!
//! Each node gossips a small metadata blob carrying its application namespace
//! and the address of its resource RPC endpoint. The RPC address is the
//! node's identity on the hash ring; join/leave events from gossip drive ring
//! updates and, downstream, rebalancing.

use memberlist::delegate::{CompositeDelegate, EventDelegate, NodeDelegate};
use memberlist::net::resolver::socket_addr::SocketAddrResolver;
use memberlist::net::stream_layer::tcp::Tcp;
use memberlist::net::{NetTransport, NetTransportOptions};
use memberlist::proto::Meta;
use memberlist::tokio::TokioRuntime;
use memberlist::{Memberlist, Options};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::RingConfig;
use crate::error::BootstrapError;
use crate::types::NodeAddr;

/// Type alias for the gossip transport layer.
type Transport =
    NetTransport<SmolStr, SocketAddrResolver<TokioRuntime>, Tcp<TokioRuntime>, TokioRuntime>;

/// Composite delegate wiring our event and node-metadata delegates into
/// memberlist. The remaining slots are void.
type GossipDelegate = CompositeDelegate<
    SmolStr,
    SocketAddr,
    memberlist::delegate::VoidDelegate<SmolStr, SocketAddr>,
    memberlist::delegate::VoidDelegate<SmolStr, SocketAddr>,
    GossipEventDelegate,
    memberlist::delegate::VoidDelegate<SmolStr, SocketAddr>,
    GossipNodeDelegate,
    memberlist::delegate::VoidDelegate<SmolStr, SocketAddr>,
>;

/// Metadata broadcast via gossip for one ring member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RingNodeMetadata {
    /// Application namespace; nodes from other apps are ignored.
    pub app: String,

    /// Address of the node's resource RPC endpoint (its ring identity).
    pub rpc_addr: NodeAddr,

    /// Crate version, for operator visibility.
    pub version: String,
}

impl RingNodeMetadata {
    pub fn new(app: impl Into<String>, rpc_addr: NodeAddr) -> Self {
        Self {
            app: app.into(),
            rpc_addr,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Serialize for the gossip metadata slot (512-byte limit).
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}

/// A single membership delta observed via gossip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberDelta {
    /// A node of our app joined the ring.
    Joined(NodeAddr),
    /// A node left the ring, gracefully or by failure detection.
    Left(NodeAddr),
}

/// Registry mapping gossip identities to ring identities.
#[derive(Debug, Default)]
pub struct MemberRegistry {
    /// gossip name -> rpc address
    by_gossip_id: RwLock<HashMap<SmolStr, NodeAddr>>,
}

impl MemberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a member. Returns true if the member was new.
    pub fn register(&self, gossip_id: SmolStr, rpc_addr: NodeAddr) -> bool {
        self.by_gossip_id.write().insert(gossip_id, rpc_addr).is_none()
    }

    /// Remove a member by gossip id, returning its rpc address.
    pub fn unregister(&self, gossip_id: &SmolStr) -> Option<NodeAddr> {
        self.by_gossip_id.write().remove(gossip_id)
    }

    pub fn rpc_addr(&self, gossip_id: &SmolStr) -> Option<NodeAddr> {
        self.by_gossip_id.read().get(gossip_id).copied()
    }

    /// All known member rpc addresses.
    pub fn members(&self) -> Vec<NodeAddr> {
        self.by_gossip_id.read().values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.by_gossip_id.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_gossip_id.read().is_empty()
    }
}

/// Delegate receiving join/leave/update notifications from memberlist.
pub struct GossipEventDelegate {
    app: String,
    local_rpc_addr: NodeAddr,
    registry: Arc<MemberRegistry>,
    delta_tx: mpsc::UnboundedSender<MemberDelta>,
}

impl GossipEventDelegate {
    fn handle_join(&self, gossip_id: &SmolStr, meta: &[u8]) {
        let Some(metadata) = RingNodeMetadata::from_bytes(meta) else {
            debug!(gossip_id = %gossip_id, "Ignoring member with undecodable metadata");
            return;
        };

        if metadata.app != self.app {
            debug!(
                gossip_id = %gossip_id,
                app = %metadata.app,
                "Ignoring member from different app"
            );
            return;
        }
        if metadata.rpc_addr == self.local_rpc_addr {
            return; // self
        }

        if self.registry.register(gossip_id.clone(), metadata.rpc_addr) {
            info!(node = %metadata.rpc_addr, "Node joined the ring");
            let _ = self.delta_tx.send(MemberDelta::Joined(metadata.rpc_addr));
        }
    }

    fn handle_leave(&self, gossip_id: &SmolStr) {
        if let Some(rpc_addr) = self.registry.unregister(gossip_id) {
            info!(node = %rpc_addr, "Node left the ring");
            let _ = self.delta_tx.send(MemberDelta::Left(rpc_addr));
        }
    }
}

impl EventDelegate for GossipEventDelegate {
    type Id = SmolStr;
    type Address = SocketAddr;

    fn notify_join(
        &self,
        node: Arc<memberlist::proto::NodeState<Self::Id, Self::Address>>,
    ) -> impl Future<Output = ()> + Send {
        let gossip_id = node.id().clone();
        let meta = node.meta().to_vec();
        self.handle_join(&gossip_id, &meta);
        async {}
    }

    fn notify_leave(
        &self,
        node: Arc<memberlist::proto::NodeState<Self::Id, Self::Address>>,
    ) -> impl Future<Output = ()> + Send {
        let gossip_id = node.id().clone();
        self.handle_leave(&gossip_id);
        async {}
    }

    fn notify_update(
        &self,
        node: Arc<memberlist::proto::NodeState<Self::Id, Self::Address>>,
    ) -> impl Future<Output = ()> + Send {
        // Re-registering on update keeps the rpc address current; a changed
        // address shows up as a fresh join.
        let gossip_id = node.id().clone();
        let meta = node.meta().to_vec();
        self.handle_join(&gossip_id, &meta);
        async {}
    }
}

/// Delegate providing this node's metadata to memberlist gossip.
pub struct GossipNodeDelegate {
    local_meta: Meta,
}

impl GossipNodeDelegate {
    fn new(metadata: &RingNodeMetadata) -> Self {
        let bytes = metadata.to_bytes();
        let meta = Meta::try_from(bytes).unwrap_or_else(|_| Meta::empty());
        Self { local_meta: meta }
    }
}

impl NodeDelegate for GossipNodeDelegate {
    fn node_meta(&self, _limit: usize) -> impl Future<Output = Meta> + Send {
        let meta = self.local_meta.clone();
        async move { meta }
    }

    fn notify_message(&self, _msg: Cow<'_, [u8]>) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn broadcast_messages<F>(
        &self,
        _limit: usize,
        _encoded_len: F,
    ) -> impl Future<Output = impl Iterator<Item = bytes::Bytes> + Send> + Send
    where
        F: Fn(bytes::Bytes) -> (usize, bytes::Bytes) + Send + Sync + 'static,
    {
        async { std::iter::empty() }
    }

    fn local_state(&self, _join: bool) -> impl Future<Output = bytes::Bytes> + Send {
        async { bytes::Bytes::new() }
    }

    fn merge_remote_state(&self, _buf: &[u8], _join: bool) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Gossip membership handle for one node.
///
/// Created unstarted; `start` joins the gossip network, `leave`/`shutdown`
/// exit it. Membership deltas are consumed via `recv_delta`.
pub struct GossipMembership {
    config: RingConfig,
    seed_addrs: Vec<SocketAddr>,
    registry: Arc<MemberRegistry>,
    delta_tx: mpsc::UnboundedSender<MemberDelta>,
    delta_rx: Option<mpsc::UnboundedReceiver<MemberDelta>>,
    memberlist: Option<Arc<Memberlist<Transport, GossipDelegate>>>,
}

impl GossipMembership {
    /// Create a new, not-yet-started membership handle.
    pub fn new(config: RingConfig, seed_addrs: Vec<SocketAddr>) -> Self {
        let (delta_tx, delta_rx) = mpsc::unbounded_channel();

        Self {
            config,
            seed_addrs,
            registry: Arc::new(MemberRegistry::new()),
            delta_tx,
            delta_rx: Some(delta_rx),
            memberlist: None,
        }
    }

    /// The member registry, for lookups by the ring client.
    pub fn registry(&self) -> Arc<MemberRegistry> {
        self.registry.clone()
    }

    /// Take the delta receiver. Called once by the ring client's event pump.
    pub fn take_delta_rx(&mut self) -> Option<mpsc::UnboundedReceiver<MemberDelta>> {
        self.delta_rx.take()
    }

    /// Whether the gossip layer has been started.
    pub fn is_started(&self) -> bool {
        self.memberlist.is_some()
    }

    /// Join the gossip network and contact the seed hosts.
    ///
    /// Fails with `BootstrapError` when the transport cannot bind or when no
    /// seed responds. A seed list consisting only of this node's own gossip
    /// address bootstraps a fresh ring.
    pub async fn start(&mut self) -> Result<(), BootstrapError> {
        info!(
            app = %self.config.app,
            gossip_addr = %self.config.gossip_addr,
            rpc_addr = %self.config.rpc_addr,
            "Joining gossip ring"
        );

        let local_metadata = RingNodeMetadata::new(&self.config.app, self.config.rpc_addr);
        let node_delegate = GossipNodeDelegate::new(&local_metadata);
        let event_delegate = GossipEventDelegate {
            app: self.config.app.clone(),
            local_rpc_addr: self.config.rpc_addr,
            registry: self.registry.clone(),
            delta_tx: self.delta_tx.clone(),
        };

        let delegate: GossipDelegate = CompositeDelegate::new()
            .with_node_delegate(node_delegate)
            .with_event_delegate(event_delegate);

        let node_name: SmolStr = self.config.node_name().into();
        let mut transport_opts = NetTransportOptions::<
            SmolStr,
            SocketAddrResolver<TokioRuntime>,
            Tcp<TokioRuntime>,
        >::new(node_name);
        transport_opts.add_bind_address(self.config.gossip_addr.into());

        if let Some(advertise_addr) = self.config.advertise_addr {
            transport_opts = transport_opts.with_advertise_address(advertise_addr.into());
        }

        let memberlist =
            Memberlist::with_delegate(delegate, transport_opts, Options::local())
                .await
                .map_err(|e| BootstrapError::GossipBind(e.to_string()))?;

        // Contact seeds. Joining our own address means we are the first node
        // of a fresh ring, which is not a failure.
        let own_addrs = [
            self.config.gossip_addr,
            self.config.advertise_addr.unwrap_or(self.config.gossip_addr),
        ];
        let mut foreign_seeds = 0usize;
        let mut joined = 0usize;
        let mut last_err = String::new();

        for seed in &self.seed_addrs {
            if own_addrs.contains(seed) {
                continue;
            }
            foreign_seeds += 1;

            let node = memberlist::transport::Node::new(
                format!("seed-{}", seed).into(),
                memberlist::proto::MaybeResolvedAddress::Resolved(*seed),
            );
            match memberlist.join(node).await {
                Ok(_) => {
                    info!(seed = %seed, "Joined seed host");
                    joined += 1;
                }
                Err(e) => {
                    warn!(seed = %seed, error = %e, "Failed to join seed host");
                    last_err = e.to_string();
                }
            }
        }

        if foreign_seeds > 0 && joined == 0 {
            // No seed responded; tear the transport down before failing.
            let _ = memberlist.shutdown().await;
            return Err(BootstrapError::NoSeedResponded(last_err));
        }

        self.memberlist = Some(Arc::new(memberlist));
        info!(members = self.registry.len() + 1, "Gossip ring ready");

        Ok(())
    }

    /// Gracefully leave the gossip ring. Idempotent.
    pub async fn leave(&mut self) {
        if let Some(memberlist) = self.memberlist.take() {
            info!(rpc_addr = %self.config.rpc_addr, "Leaving gossip ring");
            if let Err(e) = memberlist.leave(Duration::from_secs(5)).await {
                warn!(error = %e, "Error leaving gossip ring");
            }
            if let Err(e) = memberlist.shutdown().await {
                warn!(error = %e, "Error shutting down gossip transport");
            }
        }
    }

    /// Inject a join without gossip, for tests.
    pub fn simulate_join(&self, rpc_addr: NodeAddr) {
        let gossip_id: SmolStr = format!("sim-{}", rpc_addr).into();
        if self.registry.register(gossip_id, rpc_addr) {
            let _ = self.delta_tx.send(MemberDelta::Joined(rpc_addr));
        }
    }

    /// Inject a leave without gossip, for tests.
    pub fn simulate_leave(&self, rpc_addr: NodeAddr) {
        let gossip_id: SmolStr = format!("sim-{}", rpc_addr).into();
        if self.registry.unregister(&gossip_id).is_some() {
            let _ = self.delta_tx.send(MemberDelta::Left(rpc_addr));
        }
    }
}
