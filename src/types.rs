//! Core types used throughout the resource manager.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// A node's identity in the ring: the address of its resource RPC endpoint.
///
/// This is what `lookup` returns, what `whoami` reports, and what forwarding
/// dials.
pub type NodeAddr = SocketAddr;

/// An externally-defined unit of work/ownership.
///
/// Resources are supplied by the catalog and never created by this crate.
/// Identity is `id`; all comparisons key on it. Any additional fields from
/// the catalog are preserved verbatim in `fields`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    /// Stable, caller-assigned identifier.
    pub id: String,

    /// Arbitrary caller-defined fields, carried through untouched.
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Resource {
    /// Create a resource with only an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: serde_json::Map::new(),
        }
    }

    /// Attach an extra field.
    pub fn with_field(mut self, key: &str, value: serde_json::Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }
}

/// Operation applied to a resource, locally or via forwarding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResourceOp {
    /// Hand the resource to the handler on the owning node.
    Allocate,

    /// Terminate the resource on the owning node.
    Deallocate,
}

impl std::fmt::Display for ResourceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceOp::Allocate => write!(f, "allocate"),
            ResourceOp::Deallocate => write!(f, "deallocate"),
        }
    }
}

/// Shape of the HTTP catalog response: `{ "data": [ {"id": ...}, ... ] }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogResponse {
    /// The full resource catalog.
    pub data: Vec<Resource>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_preserves_extra_fields() {
        let raw = json!({"id": "sensor-7", "kind": "mqtt", "port": 1883});
        let resource: Resource = serde_json::from_value(raw.clone()).unwrap();

        assert_eq!(resource.id, "sensor-7");
        assert_eq!(resource.fields.get("kind"), Some(&json!("mqtt")));
        assert_eq!(resource.fields.get("port"), Some(&json!(1883)));

        // Round-trips back to the original shape
        let back = serde_json::to_value(&resource).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn test_catalog_response_shape() {
        let raw = json!({"data": [{"id": "a"}, {"id": "b", "x": 1}]});
        let catalog: CatalogResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(catalog.data.len(), 2);
        assert_eq!(catalog.data[0].id, "a");
        assert_eq!(catalog.data[1].fields.get("x"), Some(&json!(1)));
    }

    #[test]
    fn test_resource_op_display() {
        assert_eq!(ResourceOp::Allocate.to_string(), "allocate");
        assert_eq!(ResourceOp::Deallocate.to_string(), "deallocate");
    }
}
