//! Configuration types for the resource manager.

use crate::error::ConfigError;
use std::net::SocketAddr;
use std::time::Duration;

/// Default total elapsed time allowed for rebalance retries.
pub const DEFAULT_MAX_REBALANCE_RETRY_TIME: Duration = Duration::from_secs(60);

/// Default interval for catalog polling.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Main configuration for the resource manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Ring identity and transport addresses.
    pub ring: RingConfig,

    /// Gossip addresses of seed nodes to join. Required, non-empty. A list
    /// containing only this node's own address bootstraps a new ring.
    pub seed_addrs: Vec<SocketAddr>,

    /// HTTP catalog retriever options. Ignored when a custom retriever is
    /// supplied at start.
    pub catalog: HttpCatalogConfig,

    /// Keep a full snapshot of the last-fetched catalog and rebalance from it
    /// instead of re-fetching.
    pub cache_all_resources: bool,

    /// Total elapsed time the rebalance retry policy may spend before
    /// treating the failure as fatal for the node.
    pub max_rebalance_retry_time: Duration,

    /// Remote forwarding options.
    pub forward: ForwardConfig,
}

impl ManagerConfig {
    /// Create a configuration for the given ring identity.
    pub fn new(ring: RingConfig) -> Self {
        Self {
            ring,
            seed_addrs: Vec::new(),
            catalog: HttpCatalogConfig::default(),
            cache_all_resources: false,
            max_rebalance_retry_time: DEFAULT_MAX_REBALANCE_RETRY_TIME,
            forward: ForwardConfig::default(),
        }
    }

    /// Set the seed gossip addresses.
    pub fn with_seed_addrs(mut self, seeds: Vec<SocketAddr>) -> Self {
        self.seed_addrs = seeds;
        self
    }

    /// Set the HTTP catalog options.
    pub fn with_catalog(mut self, catalog: HttpCatalogConfig) -> Self {
        self.catalog = catalog;
        self
    }

    /// Enable or disable the full-catalog cache.
    pub fn with_cache_all_resources(mut self, enabled: bool) -> Self {
        self.cache_all_resources = enabled;
        self
    }

    /// Set the rebalance retry time budget.
    pub fn with_max_rebalance_retry_time(mut self, budget: Duration) -> Self {
        self.max_rebalance_retry_time = budget;
        self
    }

    /// Set forwarding options.
    pub fn with_forward(mut self, forward: ForwardConfig) -> Self {
        self.forward = forward;
        self
    }

    /// Validate the configuration, reporting every violation found.
    ///
    /// `custom_retriever` relaxes the catalog URL requirement: a plugged-in
    /// retriever brings its own source.
    pub fn validate(&self, custom_retriever: bool) -> Result<(), ConfigError> {
        let mut violations = Vec::new();

        if self.ring.app.is_empty() {
            violations.push("ring.app must not be empty".to_string());
        }
        if self.seed_addrs.is_empty() {
            violations.push("seed_addrs must not be empty".to_string());
        }
        if self.ring.rpc_addr == self.ring.gossip_addr {
            violations.push("ring.rpc_addr and ring.gossip_addr must differ".to_string());
        }
        if !custom_retriever && self.catalog.resources_url.is_empty() {
            violations
                .push("catalog.resources_url is required without a custom retriever".to_string());
        }
        if self.catalog.poll_for_new_resources && self.catalog.poll_interval.is_zero() {
            violations.push("catalog.poll_interval must be positive when polling".to_string());
        }
        if self.max_rebalance_retry_time.is_zero() {
            violations.push("max_rebalance_retry_time must be positive".to_string());
        }
        if self.forward.timeout.is_zero() {
            violations.push("forward.timeout must be positive".to_string());
        }
        if self.forward.retry_limit == 0 {
            violations.push("forward.retry_limit must be at least 1".to_string());
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::new(violations))
        }
    }
}

/// Ring identity and transport addresses.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Application namespace. Nodes advertising a different app are ignored
    /// even if they share the gossip network.
    pub app: String,

    /// Address of this node's resource RPC endpoint. Doubles as the node's
    /// identity in the ring.
    pub rpc_addr: SocketAddr,

    /// Address to bind for gossip.
    pub gossip_addr: SocketAddr,

    /// Address to advertise to other nodes, when different from the bind
    /// address (NAT/containers).
    pub advertise_addr: Option<SocketAddr>,

    /// Gossip node name (defaults to "{app}-{rpc_addr}").
    pub node_name: Option<String>,
}

impl RingConfig {
    pub fn new(app: impl Into<String>, rpc_addr: SocketAddr, gossip_addr: SocketAddr) -> Self {
        Self {
            app: app.into(),
            rpc_addr,
            gossip_addr,
            advertise_addr: None,
            node_name: None,
        }
    }

    /// Set the advertised gossip address.
    pub fn with_advertise_addr(mut self, addr: SocketAddr) -> Self {
        self.advertise_addr = Some(addr);
        self
    }

    /// Set a custom gossip node name.
    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = Some(name.into());
        self
    }

    /// The gossip node name for this node.
    pub fn node_name(&self) -> String {
        self.node_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.app, self.rpc_addr))
    }
}

/// HTTP catalog retriever options.
#[derive(Debug, Clone)]
pub struct HttpCatalogConfig {
    /// URL returning `{ "data": [ {"id": ...}, ... ] }`.
    pub resources_url: String,

    /// Per-request timeout.
    pub request_timeout: Duration,

    /// Headers sent with every catalog request (authentication etc.).
    pub headers: Vec<(String, String)>,

    /// Periodically re-fetch the catalog and route new resources through
    /// ring ownership.
    pub poll_for_new_resources: bool,

    /// Polling interval.
    pub poll_interval: Duration,
}

impl Default for HttpCatalogConfig {
    fn default() -> Self {
        Self {
            resources_url: String::new(),
            request_timeout: Duration::from_secs(10),
            headers: Vec::new(),
            poll_for_new_resources: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl HttpCatalogConfig {
    pub fn new(resources_url: impl Into<String>) -> Self {
        Self {
            resources_url: resources_url.into(),
            ..Default::default()
        }
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Attach a header to every catalog request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Enable polling at the given interval.
    pub fn with_polling(mut self, interval: Duration) -> Self {
        self.poll_for_new_resources = true;
        self.poll_interval = interval;
        self
    }
}

/// Remote forwarding options.
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    /// Timeout for a single forwarded request (connect + exchange).
    pub timeout: Duration,

    /// Connection timeout for reaching the owning node.
    pub connect_timeout: Duration,

    /// Number of attempts before a forward fails.
    pub retry_limit: u32,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            retry_limit: 3,
        }
    }
}

impl ForwardConfig {
    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry limit.
    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }
}
