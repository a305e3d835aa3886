//! Ring subsystem: gossip membership, consistent hashing, and forwarding.
//!
//! The ring client wraps the gossip layer and the hash ring into the handle
//! the orchestrator and manager consume: `lookup`, `whoami`, membership
//! change subscriptions, and the remote-forward primitive.

pub mod client;
pub mod hashring;
pub mod membership;
pub mod rpc;

pub use client::{MembershipChange, RingClient};
pub use hashring::HashRing;
pub use membership::{GossipMembership, MemberDelta, MemberRegistry, RingNodeMetadata};
pub use rpc::{ForwardRequest, ForwardResponse, ForwardTarget, Message, RpcServer};
