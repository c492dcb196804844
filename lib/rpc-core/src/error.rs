use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RpcError>;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Service name is empty, cannot build rpc path for method: {method}")]
    MissingServiceName { method: String },

    #[error("Consumer {service} has neither a registry nor a static node list")]
    MissingTopologyConfig { service: String },

    #[error("Invalid node config for {service}: {entry}: {reason}")]
    InvalidNodeConfig {
        service: String,
        entry: String,
        reason: String,
    },

    #[error("Registry {protocol} unavailable for {service}: {reason}")]
    RegistryUnavailable {
        protocol: String,
        service: String,
        reason: String,
    },

    #[error("No available node for service: {service}")]
    NoAvailableNode { service: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Request id mismatch for {service}.{method}: expected {expected}, got {got:?}")]
    RequestIdMismatch {
        service: String,
        method: String,
        expected: String,
        got: Option<String>,
    },

    #[error("Invalid response for {service}.{method}: {reason}")]
    InvalidResponse {
        service: String,
        method: String,
        reason: String,
    },

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures raised by a transport while sending or receiving
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error talking to {node}: {source}")]
    Io {
        node: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {after:?} waiting on {node}")]
    Timeout { node: String, after: Duration },

    #[error("Connection closed by {node}")]
    Closed { node: String },

    #[error("Frame from {node} exceeds {limit} bytes")]
    FrameTooLarge { node: String, limit: usize },

    #[error("No request has been sent on this transport")]
    NotConnected,

    #[error("No load balancer bound to transport")]
    Unbound,
}

impl From<serde_yaml::Error> for RpcError {
    fn from(err: serde_yaml::Error) -> Self {
        RpcError::Config(err.to_string())
    }
}
