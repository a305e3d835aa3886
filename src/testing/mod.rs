//! Testing utilities for the resource manager.
//!
//! This module provides:
//! - Mock handlers and catalog retrievers that record every callback
//! - OS-assigned port allocation for multi-node tests
//! - Polling helpers for eventually-consistent assertions
//!
//! The end-to-end suites in this directory start real managers with real
//! gossip on localhost and verify ownership, rebalancing, and forwarding
//! across nodes.

mod utils;

pub use utils::{free_tcp_addr, wait_for, MockHandler, MockRetriever};
