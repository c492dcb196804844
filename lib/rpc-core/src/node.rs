//! Service instance addressing
use crate::{Result, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

fn default_weight() -> u32 {
    1
}

/// One network endpoint of a service instance
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub host: String,
    pub port: u16,
    /// Relative weight, only consulted by weighted strategies
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl Node {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: default_weight(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// `host:port` form used for connecting and logging
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Unvalidated node entry as read from configuration or a registry.
///
/// The port is kept as a raw JSON value so a bad entry can be reported
/// verbatim instead of failing the whole file at parse time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub host: String,
    pub port: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

impl NodeEntry {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Value::from(port),
            weight: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Validate the entry and build a [`Node`] for `service`.
    pub fn to_node(&self, service: &str) -> Result<Node> {
        let invalid = |reason: &str| RpcError::InvalidNodeConfig {
            service: service.to_string(),
            entry: self.to_string(),
            reason: reason.to_string(),
        };

        if self.host.is_empty() {
            return Err(invalid("host is empty"));
        }

        let port = match &self.port {
            Value::Number(n) => n.as_u64().ok_or_else(|| invalid("port is not an integer"))?,
            _ => return Err(invalid("port is not an integer")),
        };
        if !(1..=u64::from(u16::MAX)).contains(&port) {
            return Err(invalid("port is out of range 1-65535"));
        }

        let mut node = Node::new(self.host.clone(), port as u16);
        if let Some(weight) = self.weight {
            node.weight = weight;
        }
        Ok(node)
    }
}

impl fmt::Display for NodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{{host: {}, port: {}}}", self.host, self.port),
        }
    }
}
