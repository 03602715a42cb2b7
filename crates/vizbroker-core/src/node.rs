//! Cluster node descriptions

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Node properties that may be set in the inventory
pub const NODE_PROPERTIES: [&str; 2] = ["remote_hostname", "fast_network"];

/// A host in the cluster that carries resources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub host_name: String,
    /// Node index, the final tie-break when choosing between nodes
    pub index: u32,
    /// Static weight; lighter nodes are tried first
    pub weight: i64,
    pub model: Option<String>,
    pub properties: BTreeMap<String, String>,
}

impl Node {
    pub fn new(host_name: impl Into<String>, index: u32) -> Self {
        Self {
            host_name: host_name.into(),
            index,
            weight: 0,
            model: None,
            properties: BTreeMap::new(),
        }
    }

    /// Nodes are weighted by their bias alone, never by index
    pub fn allocation_weight(&self) -> i64 {
        self.weight
    }
}
