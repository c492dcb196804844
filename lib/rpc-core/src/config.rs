//! Consumer configuration
//!
//! A services file lists one consumer record per remote service. The client
//! only ever reads these records; nothing here is written back.

use crate::{NodeEntry, Result, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

/// Node selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingStrategy {
    /// Uniformly random node per call
    #[default]
    Random,
    /// Cycle through nodes in order
    RoundRobin,
    /// Random node, probability proportional to weight
    WeightedRandom,
    /// Smooth weighted round-robin
    WeightedRoundRobin,
}

/// Registry location for dynamically discovered nodes
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry driver name, e.g. `consul` or `nacos`
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub address: String,
}

impl RegistryConfig {
    pub fn new(protocol: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            address: address.into(),
        }
    }

    /// Both the driver name and the address must be set for the registry to be used
    pub fn is_configured(&self) -> bool {
        !self.protocol.is_empty() && !self.address.is_empty()
    }
}

fn default_protocol() -> String {
    "jsonrpc".to_string()
}

fn default_path_separator() -> String {
    ".".to_string()
}

fn default_recv_retries() -> u32 {
    1
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}

/// Typed view over a consumer's `options` map
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsumerOptions {
    /// Joins service name and method name into the rpc path
    #[serde(default = "default_path_separator")]
    pub path_separator: String,
    /// Extra reads allowed when a response carries another request's id
    #[serde(default = "default_recv_retries")]
    pub recv_retries: u32,
    /// Poll the registry on this interval; absent means on-demand refresh only
    #[serde(default)]
    pub refresh_interval_ms: Option<u64>,
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub recv_timeout_ms: u64,
    /// Longest response frame a transport accepts, delimiter excluded
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Options this client does not interpret
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            path_separator: default_path_separator(),
            recv_retries: default_recv_retries(),
            refresh_interval_ms: None,
            connect_timeout_ms: default_timeout_ms(),
            recv_timeout_ms: default_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            extra: HashMap::new(),
        }
    }
}

/// Per-service consumer record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub name: String,
    /// RPC protocol label, passed to the registry as a tag
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub load_balancer: LoadBalancingStrategy,
    #[serde(default)]
    pub registry: Option<RegistryConfig>,
    #[serde(default)]
    pub nodes: Option<Vec<NodeEntry>>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub namespace_id: Option<String>,
    #[serde(default)]
    pub options: ConsumerOptions,
}

impl ConsumerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol: default_protocol(),
            load_balancer: LoadBalancingStrategy::default(),
            registry: None,
            nodes: None,
            group_name: None,
            namespace_id: None,
            options: ConsumerOptions::default(),
        }
    }

    pub fn with_nodes(mut self, nodes: Vec<NodeEntry>) -> Self {
        self.nodes = Some(nodes);
        self
    }

    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_load_balancer(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.load_balancer = strategy;
        self
    }

    pub fn with_options(mut self, options: ConsumerOptions) -> Self {
        self.options = options;
        self
    }

    /// Registry block, if it names both a driver and an address
    pub fn configured_registry(&self) -> Option<&RegistryConfig> {
        self.registry.as_ref().filter(|r| r.is_configured())
    }

    /// Static node list, if present and non-empty
    pub fn static_nodes(&self) -> Option<&[NodeEntry]> {
        self.nodes.as_deref().filter(|nodes| !nodes.is_empty())
    }
}

/// The services-consumers list
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub consumers: Vec<ConsumerConfig>,
}

impl ServicesConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| RpcError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&contents)
    }

    /// Look a consumer up by exact name
    pub fn consumer(&self, name: &str) -> Option<&ConsumerConfig> {
        self.consumers.iter().find(|c| c.name == name)
    }

    pub fn require_consumer(&self, name: &str) -> Result<&ConsumerConfig> {
        self.consumer(name)
            .ok_or_else(|| RpcError::ConsumerNotFound(name.to_string()))
    }
}
