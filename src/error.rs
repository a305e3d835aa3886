//! Error types for the resource manager.

use thiserror::Error;

/// Result type alias for resource manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error raised by a handler's `handle_resource`/`terminate_resource`.
///
/// Handler errors never cross the public API: the orchestrator converts them
/// into `handle_failed_resource`/`handle_failed_termination` callbacks.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for the resource manager.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid startup configuration. Fatal, prevents start.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The ring/transport failed to come up. Fatal, prevents start.
    #[error("bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),

    /// The catalog retriever failed. Fatal during initial setup; recovered by
    /// the rebalance retry policy mid-life.
    #[error("catalog fetch error: {0}")]
    CatalogFetch(#[from] CatalogFetchError),

    /// A forwarded operation could not reach the owning node.
    #[error("forward error: {0}")]
    Forward(#[from] ForwardError),

    /// The rebalance retry budget was exhausted. Fatal, triggers node
    /// shutdown from the ring.
    #[error("rebalancing failed after {attempts} attempts over {elapsed_ms} ms")]
    RebalanceExhausted { attempts: u32, elapsed_ms: u64 },

    /// A registry was read before registration.
    #[error("{0} has not been configured")]
    NotConfigured(&'static str),

    /// The hash ring has no members.
    #[error("hash ring is empty")]
    RingEmpty,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Invalid startup configuration.
///
/// Carries every violation found, not just the first.
#[derive(Error, Debug)]
pub struct ConfigError {
    /// All violations found during validation.
    pub violations: Vec<String>,
}

impl ConfigError {
    pub fn new(violations: Vec<String>) -> Self {
        Self { violations }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.violations.join("; "))
    }
}

/// Ring bootstrap errors.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// Failed to bind the RPC listener.
    #[error("failed to bind rpc listener on {addr}: {reason}")]
    RpcBind { addr: String, reason: String },

    /// Failed to bind the gossip transport.
    #[error("failed to bind gossip transport: {0}")]
    GossipBind(String),

    /// No seed host responded.
    #[error("no seed host responded: {0}")]
    NoSeedResponded(String),

    /// The ring never reached a ready state.
    #[error("ring did not become ready: {0}")]
    NotReady(String),
}

/// Catalog retriever errors.
#[derive(Error, Debug)]
pub enum CatalogFetchError {
    /// The catalog source returned a non-success status.
    #[error("catalog at {url} returned status {status}")]
    Status { url: String, status: u16 },

    /// The catalog source was unreachable.
    #[error("catalog transport error: {0}")]
    Transport(String),

    /// The catalog body could not be decoded.
    #[error("invalid catalog body: {0}")]
    InvalidBody(String),
}

/// Remote forwarding errors.
#[derive(Error, Debug)]
pub enum ForwardError {
    /// The target node could not be reached.
    #[error("target {addr} unreachable: {reason}")]
    Unreachable { addr: String, reason: String },

    /// The forwarded request timed out.
    #[error("forward to {addr} timed out")]
    Timeout { addr: String },

    /// The remote node rejected or failed the operation.
    #[error("remote node {addr} returned error: {reason}")]
    Remote { addr: String, reason: String },

    /// The remote node's ring view disagrees with ours.
    #[error("ring checksum mismatch with {addr}")]
    ChecksumMismatch { addr: String },

    /// Wire encoding/decoding failed.
    #[error("codec error: {0}")]
    Codec(String),
}
