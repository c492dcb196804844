//! Core types for client-side RPC dispatch
//!
//! This library provides:
//! - Nodes and raw node entries for service instances
//! - Consumer configuration loaded from a services file
//! - Registry drivers for dynamic node discovery
//! - Node resolution from static lists or registries

pub mod config;
pub mod error;
pub mod node;
pub mod registry;
pub mod resolver;

pub use config::{
    ConsumerConfig, ConsumerOptions, LoadBalancingStrategy, RegistryConfig, ServicesConfig,
};
pub use error::{Result, RpcError, TransportError};
pub use node::{Node, NodeEntry};
pub use registry::{MemoryRegistry, RegistryDriver, RegistryDrivers, RegistryTags, ServiceInfo};
pub use resolver::{NodeRefresher, NodeResolver, RegistryRefresher, ResolvedNodes};
