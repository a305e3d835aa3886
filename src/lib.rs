//! Cluster-wide resource ownership manager over a consistent hash ring.
//!
//! This crate partitions externally defined resources across a cluster:
//! - **memberlist** gossip for cluster membership
//! - **Consistent hashing** with virtual nodes to assign each resource id an
//!   owning node
//! - **Handler callbacks** so the application reacts to gaining or losing a
//!   resource
//! - **RPC forwarding** so an operation arriving at the wrong node reaches
//!   the owner
//!
//! # Features
//!
//! - Each resource id is owned by exactly one live node
//! - Membership changes trigger an automatic ownership rebalance
//! - Pluggable catalog retrievers (HTTP with optional polling built in)
//! - Misrouted allocate/deallocate operations are forwarded to the owner
//! - Handler failures are isolated per resource and reported via callbacks
//!
//! # Example
//!
//! ```rust,no_run
//! use herd::{
//!     HttpCatalogConfig, Manager, ManagerConfig, Resource, ResourceHandler, RingConfig,
//! };
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct Consumer;
//!
//! #[async_trait]
//! impl ResourceHandler for Consumer {
//!     async fn handle_resource(&self, resource: &Resource) -> Result<(), herd::HandlerError> {
//!         println!("now handling {}", resource.id);
//!         Ok(())
//!     }
//!
//!     fn handle_failed_resource(&self, resource: &Resource, error: &herd::HandlerError) {
//!         eprintln!("could not handle {}: {error}", resource.id);
//!     }
//!
//!     async fn terminate_resource(&self, resource: &Resource) -> Result<(), herd::HandlerError> {
//!         println!("done with {}", resource.id);
//!         Ok(())
//!     }
//!
//!     fn handle_failed_termination(&self, resource: &Resource, error: &herd::HandlerError) {
//!         eprintln!("could not terminate {}: {error}", resource.id);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ring = RingConfig::new(
//!         "my-app",
//!         "10.0.0.1:4000".parse()?,
//!         "10.0.0.1:7946".parse()?,
//!     );
//!     let config = ManagerConfig::new(ring)
//!         .with_seed_addrs(vec!["10.0.0.2:7946".parse()?])
//!         .with_catalog(HttpCatalogConfig::new("http://catalog.internal/resources"));
//!
//!     let manager = Manager::start(config, Arc::new(Consumer)).await?;
//!     println!("handling {} resources", manager.allocated_resources().len());
//!
//!     manager.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 Manager API                  │
//! │  • allocate_resource / deallocate_resource   │
//! │  • allocated_resources()                     │
//! └─────────────────────────────────────────────┘
//!                      │
//!      ┌───────────────┼────────────────┐
//!      ▼               ▼                ▼
//! ┌─────────┐   ┌─────────────┐   ┌──────────┐
//! │  Ring   │   │Orchestrator │   │ Catalog  │
//! │ gossip +│   │ ownership   │   │retriever │
//! │ forward │   │ diff/apply  │   │  (HTTP)  │
//! └─────────┘   └─────────────┘   └──────────┘
//! ```
//!
//! # Ownership Model
//!
//! - **Assignment**: resource id hashed onto a ring of virtual nodes
//! - **Rebalance**: on membership change, diff desired vs. held resources
//!   and call the handler for the delta only
//! - **Forwarding**: operations for resources owned elsewhere are sent to the
//!   owner over framed TCP, guarded by a ring checksum

pub mod catalog;
pub mod config;
pub mod error;
pub mod handler;
pub mod manager;
pub mod orchestrator;
pub mod rebalance;
pub mod ring;
pub mod testing;
pub mod types;

pub use catalog::{CatalogRetriever, HttpCatalogRetriever};
pub use config::{ForwardConfig, HttpCatalogConfig, ManagerConfig, RingConfig};
pub use error::{
    BootstrapError, CatalogFetchError, ConfigError, Error, ForwardError, HandlerError, Result,
};
pub use handler::ResourceHandler;
pub use manager::{AllocationApi, Manager};
pub use ring::{HashRing, MembershipChange, RingClient};
pub use types::{NodeAddr, Resource, ResourceOp};
