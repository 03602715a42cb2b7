//! Request and grant shapes
//!
//! A client request is an ordered list of [`RequestItem`]s. The grant that
//! comes back mirrors it item for item as [`AllocatedItem`]s.

use serde::{Deserialize, Serialize};

use crate::Resource;

/// Pre-defined layout of resources, requested as one unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroup {
    /// Name of a configured group; an unnamed group must carry its layout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Consumer of the group (e.g. "tiled_display"); opaque to the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Inner lists; each one is a co-location group of its own
    #[serde(default)]
    pub layout: Vec<Vec<Resource>>,
}

impl ResourceGroup {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_layout(layout: Vec<Vec<Resource>>) -> Self {
        Self {
            layout,
            ..Default::default()
        }
    }
}

/// Request for a whole, untouched node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRequest {
    /// Restrict the match to this host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    /// Resources the node must carry, matched by type only
    #[serde(default)]
    pub filters: Vec<Resource>,
}

/// One element of a request slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestEntry {
    Resource(Resource),
    Group(ResourceGroup),
    Node(NodeRequest),
}

/// A request slot: one entry, or entries that must share a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestItem {
    One(RequestEntry),
    CoLocated(Vec<RequestEntry>),
}

impl RequestItem {
    pub fn resource(resource: Resource) -> Self {
        RequestItem::One(RequestEntry::Resource(resource))
    }

    pub fn co_located(resources: Vec<Resource>) -> Self {
        RequestItem::CoLocated(resources.into_iter().map(RequestEntry::Resource).collect())
    }

    pub fn group(group: ResourceGroup) -> Self {
        RequestItem::One(RequestEntry::Group(group))
    }

    pub fn node(node: NodeRequest) -> Self {
        RequestItem::One(RequestEntry::Node(node))
    }
}

/// Whole node handed out by a grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGrant {
    pub host_name: String,
    pub resources: Vec<Resource>,
}

/// Granted resources for one request slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocatedItem {
    Resource(Resource),
    CoLocated(Vec<Resource>),
    Group(ResourceGroup),
    Node(NodeGrant),
}

impl AllocatedItem {
    /// Every resource in this slot, flattened
    pub fn resources(&self) -> Vec<&Resource> {
        match self {
            AllocatedItem::Resource(res) => vec![res],
            AllocatedItem::CoLocated(list) => list.iter().collect(),
            AllocatedItem::Group(group) => group.layout.iter().flatten().collect(),
            AllocatedItem::Node(node) => node.resources.iter().collect(),
        }
    }
}
