//! Registry drivers for dynamic node discovery

use crate::NodeEntry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Tags sent along with a registry lookup
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryTags {
    /// RPC protocol the consumer speaks
    pub protocol: String,
    pub group_name: Option<String>,
    pub namespace_id: Option<String>,
}

/// A service governance backend that can list live nodes for a service
#[async_trait]
pub trait RegistryDriver: Send + Sync {
    async fn get_nodes(
        &self,
        address: &str,
        service: &str,
        tags: &RegistryTags,
    ) -> anyhow::Result<Vec<NodeEntry>>;
}

/// Registry drivers keyed by registry protocol name.
///
/// Assembled by the caller and handed to the resolver explicitly.
#[derive(Clone, Default)]
pub struct RegistryDrivers {
    drivers: HashMap<String, Arc<dyn RegistryDriver>>,
}

impl RegistryDrivers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver for a protocol, replacing any previous one
    pub fn register(
        mut self,
        protocol: impl Into<String>,
        driver: Arc<dyn RegistryDriver>,
    ) -> Self {
        self.drivers.insert(protocol.into(), driver);
        self
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn RegistryDriver>> {
        self.drivers.get(protocol).cloned()
    }

    pub fn protocols(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Information about a registered service
#[derive(Clone, Debug)]
pub struct ServiceInfo {
    pub name: String,
    pub protocol: String,
    pub group_name: Option<String>,
    pub namespace_id: Option<String>,
    pub nodes: Vec<NodeEntry>,
}

impl ServiceInfo {
    pub fn new(
        name: impl Into<String>,
        protocol: impl Into<String>,
        nodes: Vec<NodeEntry>,
    ) -> Self {
        Self {
            name: name.into(),
            protocol: protocol.into(),
            group_name: None,
            namespace_id: None,
            nodes,
        }
    }

    pub fn with_group(mut self, group_name: impl Into<String>) -> Self {
        self.group_name = Some(group_name.into());
        self
    }

    pub fn with_namespace(mut self, namespace_id: impl Into<String>) -> Self {
        self.namespace_id = Some(namespace_id.into());
        self
    }

    /// A tag only filters when both the lookup and the registration set it
    fn matches(&self, tags: &RegistryTags) -> bool {
        fn compatible(registered: &Option<String>, wanted: &Option<String>) -> bool {
            match (registered, wanted) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }

        self.protocol == tags.protocol
            && compatible(&self.group_name, &tags.group_name)
            && compatible(&self.namespace_id, &tags.namespace_id)
    }
}

/// In-process registry driver.
///
/// Services registered here are answered for any registry address.
pub struct MemoryRegistry {
    // Map of service name to its registrations, one per protocol
    services: Arc<RwLock<HashMap<String, Vec<ServiceInfo>>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a service, replacing an earlier registration with the same protocol
    pub async fn register_service(&self, info: ServiceInfo) {
        let mut services = self.services.write().await;
        let entries = services.entry(info.name.clone()).or_default();
        entries.retain(|existing| existing.protocol != info.protocol);

        debug!("Registered service: {} ({})", info.name, info.protocol);
        entries.push(info);
    }

    /// Replace the nodes of every registration of a service
    pub async fn update_nodes(&self, name: &str, nodes: Vec<NodeEntry>) -> bool {
        let mut services = self.services.write().await;
        match services.get_mut(name) {
            Some(entries) => {
                for entry in entries.iter_mut() {
                    entry.nodes = nodes.clone();
                }
                debug!("Updated nodes for service: {}", name);
                true
            }
            None => false,
        }
    }

    pub async fn deregister_service(&self, name: &str) {
        let mut services = self.services.write().await;
        services.remove(name);
        debug!("Deregistered service: {}", name);
    }

    pub async fn list_services(&self) -> Vec<ServiceInfo> {
        let services = self.services.read().await;
        services.values().flatten().cloned().collect()
    }

    pub async fn service_count(&self) -> usize {
        let services = self.services.read().await;
        services.len()
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryDriver for MemoryRegistry {
    async fn get_nodes(
        &self,
        _address: &str,
        service: &str,
        tags: &RegistryTags,
    ) -> anyhow::Result<Vec<NodeEntry>> {
        let services = self.services.read().await;
        let nodes: Vec<NodeEntry> = services
            .get(service)
            .into_iter()
            .flatten()
            .filter(|info| info.matches(tags))
            .flat_map(|info| info.nodes.iter().cloned())
            .collect();

        debug!("Registry lookup for {} returned {} nodes", service, nodes.len());
        Ok(nodes)
    }
}
