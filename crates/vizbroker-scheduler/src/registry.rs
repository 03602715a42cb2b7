//! Authoritative resource table

use std::collections::BTreeMap;
use tracing::info;
use vizbroker_core::{
    BrokerConfig, BrokerError, BrokerResult, Node, Resource, ResourceGroup, ResourceKey,
};

/// Every managed resource, keyed by identity
///
/// Built once from the inventory. Only the commit and release paths of the
/// broker mutate entries, and only their ownership state.
#[derive(Debug, Clone, PartialEq)]
pub struct Registry {
    entries: BTreeMap<ResourceKey, Resource>,
    nodes: BTreeMap<String, Node>,
    /// Sum of resource weights per host, taken before any allocation
    weight_when_free: BTreeMap<String, i64>,
    resource_counts: BTreeMap<String, usize>,
    resource_groups: BTreeMap<String, ResourceGroup>,
}

impl Registry {
    /// Build the registry from nodes and their resources
    pub fn new(nodes: Vec<Node>, resources: Vec<Resource>) -> BrokerResult<Self> {
        let mut node_map = BTreeMap::new();
        for node in nodes {
            if node_map.contains_key(&node.host_name) {
                return Err(BrokerError::Config(format!(
                    "node '{}' is defined more than once",
                    node.host_name
                )));
            }
            node_map.insert(node.host_name.clone(), node);
        }

        let mut entries = BTreeMap::new();
        let mut weight_when_free: BTreeMap<String, i64> = BTreeMap::new();
        let mut resource_counts: BTreeMap<String, usize> = BTreeMap::new();

        for res in resources {
            let key = res.key().ok_or_else(|| {
                BrokerError::Config(format!("{} is not completely resolvable", res))
            })?;
            if !node_map.contains_key(&key.host_name) {
                return Err(BrokerError::Config(format!(
                    "{} is on unknown node '{}'",
                    res, key.host_name
                )));
            }
            if !res.owners.is_empty() || res.shared {
                return Err(BrokerError::Config(format!(
                    "{} must not carry allocation state",
                    res
                )));
            }
            if entries.contains_key(&key) {
                return Err(BrokerError::Config(format!("{} is defined more than once", key)));
            }

            *weight_when_free.entry(key.host_name.clone()).or_default() += res.allocation_weight();
            *resource_counts.entry(key.host_name.clone()).or_default() += 1;
            entries.insert(key, res);
        }

        info!(
            nodes = node_map.len(),
            resources = entries.len(),
            "Resource registry built"
        );

        Ok(Self {
            entries,
            nodes: node_map,
            weight_when_free,
            resource_counts,
            resource_groups: BTreeMap::new(),
        })
    }

    /// Build the registry from a validated configuration
    pub fn from_config(config: &BrokerConfig) -> BrokerResult<Self> {
        let nodes = config.nodes.iter().map(|n| n.to_node()).collect();
        let resources = config
            .nodes
            .iter()
            .flat_map(|n| n.resources.iter().cloned())
            .collect();

        Self::new(nodes, resources)?.with_resource_groups(config.resource_groups.clone())
    }

    /// Register named resource group layouts
    pub fn with_resource_groups(mut self, groups: Vec<ResourceGroup>) -> BrokerResult<Self> {
        for group in groups {
            let name = group
                .name
                .clone()
                .ok_or_else(|| BrokerError::Config("resource groups need a name".to_string()))?;
            self.resource_groups.insert(name, group);
        }
        Ok(self)
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&Resource> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &ResourceKey) -> Option<&mut Resource> {
        self.entries.get_mut(key)
    }

    /// All entries in identity order
    pub fn iter(&self) -> impl Iterator<Item = (&ResourceKey, &Resource)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn node(&self, host: &str) -> Option<&Node> {
        self.nodes.get(host)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Total weight of the host's resources when nothing on it is allocated
    pub fn weight_when_free(&self, host: &str) -> i64 {
        self.weight_when_free.get(host).copied().unwrap_or(0)
    }

    /// Number of resources the host carries
    pub fn resource_count(&self, host: &str) -> usize {
        self.resource_counts.get(host).copied().unwrap_or(0)
    }

    pub fn resource_groups(&self) -> &BTreeMap<String, ResourceGroup> {
        &self.resource_groups
    }

    /// Number of entries that can take another owner
    pub fn free_count(&self) -> usize {
        self.entries.values().filter(|r| r.is_free()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vizbroker_core::ResourceClass;

    fn inventory() -> Registry {
        Registry::new(
            vec![Node::new("viz1", 0), Node::new("viz2", 1)],
            vec![
                Resource::gpu().with_index(0).on_host("viz1"),
                Resource::gpu().with_index(1).on_host("viz1"),
                Resource::server().with_index(0).on_host("viz1"),
                Resource::gpu().with_index(0).on_host("viz2"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_registry_lookup() {
        let registry = inventory();
        assert_eq!(registry.len(), 4);
        let key = ResourceKey {
            class: ResourceClass::Gpu,
            index: 1,
            host_name: "viz1".to_string(),
        };
        assert_eq!(registry.get(&key).unwrap().index, Some(1));
        assert_eq!(registry.resource_count("viz1"), 3);
        assert_eq!(registry.resource_count("viz9"), 0);
    }

    #[test]
    fn test_weight_when_free() {
        let registry = inventory();
        // GPU-1 plus the primary server
        assert_eq!(registry.weight_when_free("viz1"), 10001);
        assert_eq!(registry.weight_when_free("viz2"), 0);
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let result = Registry::new(
            vec![Node::new("viz1", 0)],
            vec![
                Resource::gpu().with_index(0).on_host("viz1"),
                Resource::gpu().with_index(0).on_host("viz1"),
            ],
        );
        assert!(matches!(result, Err(BrokerError::Config(_))));
    }

    #[test]
    fn test_unresolvable_resource_rejected() {
        let result = Registry::new(vec![Node::new("viz1", 0)], vec![Resource::gpu().on_host("viz1")]);
        assert!(result.is_err());
    }

    #[test]
    fn test_resource_on_unknown_node_rejected() {
        let result = Registry::new(
            vec![Node::new("viz1", 0)],
            vec![Resource::gpu().with_index(0).on_host("viz2")],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_from_config() {
        let config = BrokerConfig::parse(
            r#"
[[nodes]]
hostname = "viz1"
index = 0

[[nodes.resources]]
class = "gpu"
index = 0

[[nodes.resources]]
class = "keyboard"
index = 0

[[resource_groups]]
name = "desk"
layout = [[{ class = "gpu" }, { class = "keyboard" }]]
"#,
        )
        .unwrap();
        let registry = Registry::from_config(&config).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.free_count(), 2);
        assert!(registry.resource_groups().contains_key("desk"));
        assert_eq!(registry.node("viz1").unwrap().index, 0);
    }
}
