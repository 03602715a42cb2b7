//! Configuration types for vizbroker

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use crate::{
    BrokerError, BrokerResult, Node, Resource, ResourceGroup, ResourceKind, NODE_PROPERTIES,
    SLI_TYPES,
};

/// Main broker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// API server configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Execution backends and the hosts they own
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    /// Resource inventory, per node
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    /// Named resource group layouts
    #[serde(default)]
    pub resource_groups: Vec<ResourceGroup>,
}

impl BrokerConfig {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: &Path) -> BrokerResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BrokerError::Config(format!("Failed to read config file: {}", e)))?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(content: &str) -> BrokerResult<Self> {
        let mut config: BrokerConfig = toml::from_str(content)
            .map_err(|e| BrokerError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the inventory and fill in each resource's host name
    pub fn validate(&mut self) -> BrokerResult<()> {
        let mut hosts = BTreeSet::new();
        let mut keys = BTreeSet::new();

        for node in &mut self.nodes {
            if !hosts.insert(node.hostname.clone()) {
                return Err(BrokerError::Config(format!(
                    "node '{}' is defined more than once",
                    node.hostname
                )));
            }
            for name in node.properties.keys() {
                if !NODE_PROPERTIES.contains(&name.as_str()) {
                    return Err(BrokerError::Config(format!(
                        "invalid property '{}' on node '{}'",
                        name, node.hostname
                    )));
                }
            }
            for res in &mut node.resources {
                let host = res.host_name.get_or_insert_with(|| node.hostname.clone());
                if *host != node.hostname {
                    return Err(BrokerError::Config(format!(
                        "{} is listed under node '{}'",
                        res, node.hostname
                    )));
                }
                if res.index.is_none() {
                    return Err(BrokerError::Config(format!(
                        "{} on node '{}' has no index",
                        res, node.hostname
                    )));
                }
                if res.max_share_count < 1 {
                    return Err(BrokerError::Config(format!("{} has an invalid share limit", res)));
                }
                if !res.owners.is_empty() || res.shared {
                    return Err(BrokerError::Config(format!(
                        "{} must not carry allocation state",
                        res
                    )));
                }
                if let ResourceKind::Sli(_) = res.kind {
                    if let Some(t) = &res.res_type {
                        if !SLI_TYPES.contains(&t.as_str()) {
                            return Err(BrokerError::Config(format!(
                                "invalid SLI type '{}', expected one of {:?}",
                                t, SLI_TYPES
                            )));
                        }
                    }
                }
                if let Some(key) = res.key() {
                    if !keys.insert(key.clone()) {
                        return Err(BrokerError::Config(format!("{} is defined more than once", key)));
                    }
                }
            }
        }

        let mut owner: HashMap<&str, usize> = HashMap::new();
        for (i, backend) in self.backends.iter().enumerate() {
            if backend.nodes.is_empty() {
                return Err(BrokerError::Config(format!(
                    "{} backend #{} manages no nodes",
                    backend.kind, i
                )));
            }
            for host in &backend.nodes {
                if !hosts.contains(host) {
                    return Err(BrokerError::Config(format!(
                        "backend node '{}' is not a configured node",
                        host
                    )));
                }
                if owner.insert(host.as_str(), i).is_some() {
                    return Err(BrokerError::Config(format!(
                        "node '{}' is managed by more than one backend",
                        host
                    )));
                }
            }
        }

        let mut group_names = BTreeSet::new();
        for group in &self.resource_groups {
            let name = group.name.clone().ok_or_else(|| {
                BrokerError::Config("resource groups need a name".to_string())
            })?;
            if group.layout.is_empty() || group.layout.iter().any(|l| l.is_empty()) {
                return Err(BrokerError::Config(format!(
                    "resource group '{}' has an empty layout",
                    name
                )));
            }
            if !group_names.insert(name.clone()) {
                return Err(BrokerError::Config(format!(
                    "resource group '{}' is defined more than once",
                    name
                )));
            }
        }

        Ok(())
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub address: String,
    /// Port for the REST API server
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9191,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Execution backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Runs commands on the broker's own host
    Local,
    /// Runs commands over passwordless SSH
    Ssh,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Ssh => write!(f, "ssh"),
        }
    }
}

/// Execution backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Hosts owned by this backend
    pub nodes: Vec<String>,
    /// Hosts reported as unusable (down or drained)
    #[serde(default)]
    pub drained: Vec<String>,
    /// SSH client binary, ssh backend only
    #[serde(default)]
    pub ssh_command: Option<String>,
    /// Wrapper executable placed before every launched command
    #[serde(default)]
    pub wrapper: Option<PathBuf>,
}

/// One node of the inventory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub hostname: String,
    pub index: u32,
    /// Allocation bias of the whole node
    #[serde(default)]
    pub weight: i64,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl NodeConfig {
    pub fn to_node(&self) -> Node {
        Node {
            host_name: self.hostname.clone(),
            index: self.index,
            weight: self.weight,
            model: self.model.clone(),
            properties: self.properties.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceClass;

    const INVENTORY: &str = r#"
[api]
address = "127.0.0.1"
port = 9200

[[backends]]
kind = "ssh"
nodes = ["viz1", "viz2"]
drained = ["viz2"]

[[nodes]]
hostname = "viz1"
index = 0

[[nodes.resources]]
class = "gpu"
index = 0
type = "Quadro FX 5800"
share_limit = 2
scanout_caps = ["digital", "digital"]

[[nodes.resources]]
class = "server"
index = 0

[[nodes.resources]]
class = "server"
index = 1
type = "virtual"

[[nodes]]
hostname = "viz2"
index = 1
weight = 10

[[nodes.resources]]
class = "gpu"
index = 0

[[resource_groups]]
name = "pair"
handler = "tiled_display"
layout = [[{ class = "gpu", host_name = "viz1", index = 0 }], [{ class = "gpu" }]]
"#;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.api.port, 9191);
        assert_eq!(config.logging.level, "info");
        assert!(config.nodes.is_empty());
    }

    #[test]
    fn test_inventory_parse() {
        let config = BrokerConfig::parse(INVENTORY).unwrap();
        assert_eq!(config.api.port, 9200);
        assert_eq!(config.backends[0].kind, BackendKind::Ssh);
        assert_eq!(config.nodes.len(), 2);

        let gpu = &config.nodes[0].resources[0];
        assert_eq!(gpu.class(), ResourceClass::Gpu);
        assert_eq!(gpu.host_name.as_deref(), Some("viz1"));
        assert_eq!(gpu.max_share_count, 2);
        assert_eq!(gpu.gpu_attributes().unwrap().scanout_caps.len(), 2);

        assert_eq!(config.nodes[1].to_node().allocation_weight(), 10);
        assert_eq!(config.resource_groups[0].layout.len(), 2);
    }

    #[test]
    fn test_duplicate_resource_rejected() {
        let toml_str = r#"
[[nodes]]
hostname = "viz1"
index = 0

[[nodes.resources]]
class = "gpu"
index = 0

[[nodes.resources]]
class = "gpu"
index = 0
"#;
        let err = BrokerConfig::parse(toml_str).unwrap_err();
        assert!(matches!(err, BrokerError::Config(_)));
    }

    #[test]
    fn test_missing_index_rejected() {
        let toml_str = r#"
[[nodes]]
hostname = "viz1"
index = 0

[[nodes.resources]]
class = "keyboard"
"#;
        assert!(BrokerConfig::parse(toml_str).is_err());
    }

    #[test]
    fn test_backend_unknown_node_rejected() {
        let toml_str = r#"
[[backends]]
kind = "local"
nodes = ["elsewhere"]
"#;
        assert!(BrokerConfig::parse(toml_str).is_err());
    }

    #[test]
    fn test_bad_sli_type_rejected() {
        let toml_str = r#"
[[nodes]]
hostname = "viz1"
index = 0

[[nodes.resources]]
class = "sli"
index = 0
type = "bridge"
"#;
        assert!(BrokerConfig::parse(toml_str).is_err());
    }
}
