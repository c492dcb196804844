//! Node resolution from static configuration or a registry

use crate::{
    ConsumerConfig, Node, NodeEntry, RegistryDriver, RegistryDrivers, RegistryTags, Result,
    RpcError,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Re-fetches the node set of one service
#[async_trait]
pub trait NodeRefresher: Send + Sync {
    async fn refresh(&self) -> Result<Vec<Node>>;
}

/// Refresher that re-polls the registry a consumer was resolved from
pub struct RegistryRefresher {
    driver: Arc<dyn RegistryDriver>,
    protocol: String,
    address: String,
    service: String,
    tags: RegistryTags,
}

#[async_trait]
impl NodeRefresher for RegistryRefresher {
    async fn refresh(&self) -> Result<Vec<Node>> {
        fetch_nodes(
            self.driver.as_ref(),
            &self.protocol,
            &self.address,
            &self.service,
            &self.tags,
        )
        .await
    }
}

/// Initial node set plus, for registry topologies, a way to refresh it
pub struct ResolvedNodes {
    pub nodes: Vec<Node>,
    pub refresher: Option<Arc<dyn NodeRefresher>>,
}

impl ResolvedNodes {
    pub fn is_static(&self) -> bool {
        self.refresher.is_none()
    }
}

/// Turns a consumer record into a node set
#[derive(Clone, Default)]
pub struct NodeResolver {
    drivers: RegistryDrivers,
}

impl NodeResolver {
    pub fn new(drivers: RegistryDrivers) -> Self {
        Self { drivers }
    }

    pub fn drivers(&self) -> &RegistryDrivers {
        &self.drivers
    }

    /// Resolve the nodes of a consumer.
    ///
    /// A configured registry takes precedence over a static node list.
    pub async fn resolve(&self, config: &ConsumerConfig) -> Result<ResolvedNodes> {
        let service = config.name.as_str();

        if let Some(registry) = config.configured_registry() {
            let driver = self.drivers.get(&registry.protocol).ok_or_else(|| {
                RpcError::RegistryUnavailable {
                    protocol: registry.protocol.clone(),
                    service: service.to_string(),
                    reason: format!(
                        "no driver registered (available: {:?})",
                        self.drivers.protocols()
                    ),
                }
            })?;

            let tags = RegistryTags {
                protocol: config.protocol.clone(),
                group_name: config.group_name.clone(),
                namespace_id: config.namespace_id.clone(),
            };
            let nodes = fetch_nodes(
                driver.as_ref(),
                &registry.protocol,
                &registry.address,
                service,
                &tags,
            )
            .await?;

            info!(
                "Resolved {} nodes for {} from {} registry at {}",
                nodes.len(),
                service,
                registry.protocol,
                registry.address
            );

            let refresher = RegistryRefresher {
                driver,
                protocol: registry.protocol.clone(),
                address: registry.address.clone(),
                service: service.to_string(),
                tags,
            };
            return Ok(ResolvedNodes {
                nodes,
                refresher: Some(Arc::new(refresher)),
            });
        }

        if let Some(entries) = config.static_nodes() {
            let nodes = build_nodes(service, entries)?;
            info!("Resolved {} static nodes for {}", nodes.len(), service);
            return Ok(ResolvedNodes {
                nodes,
                refresher: None,
            });
        }

        Err(RpcError::MissingTopologyConfig {
            service: service.to_string(),
        })
    }
}

fn build_nodes(service: &str, entries: &[NodeEntry]) -> Result<Vec<Node>> {
    entries.iter().map(|entry| entry.to_node(service)).collect()
}

async fn fetch_nodes(
    driver: &dyn RegistryDriver,
    protocol: &str,
    address: &str,
    service: &str,
    tags: &RegistryTags,
) -> Result<Vec<Node>> {
    debug!("Querying {} registry at {} for {}", protocol, address, service);

    let entries = driver
        .get_nodes(address, service, tags)
        .await
        .map_err(|e| RpcError::RegistryUnavailable {
            protocol: protocol.to_string(),
            service: service.to_string(),
            reason: format!("{:#}", e),
        })?;

    build_nodes(service, &entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceInfo;
    use crate::{MemoryRegistry, RegistryConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingDriver;

    #[async_trait]
    impl RegistryDriver for FailingDriver {
        async fn get_nodes(
            &self,
            address: &str,
            _service: &str,
            _tags: &RegistryTags,
        ) -> anyhow::Result<Vec<NodeEntry>> {
            anyhow::bail!("connection refused: {}", address)
        }
    }

    /// Records the tags it was queried with and answers from a fixed list
    struct RecordingDriver {
        calls: AtomicUsize,
        seen: std::sync::Mutex<Vec<RegistryTags>>,
        nodes: Vec<NodeEntry>,
    }

    #[async_trait]
    impl RegistryDriver for RecordingDriver {
        async fn get_nodes(
            &self,
            _address: &str,
            _service: &str,
            tags: &RegistryTags,
        ) -> anyhow::Result<Vec<NodeEntry>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(tags.clone());
            Ok(self.nodes.clone())
        }
    }

    fn calc_config() -> ConsumerConfig {
        ConsumerConfig::new("Calc").with_nodes(vec![
            NodeEntry::new("10.0.0.1", 9501),
            NodeEntry::new("10.0.0.2", 9501),
        ])
    }

    #[tokio::test]
    async fn test_static_nodes_in_order() {
        let resolved = NodeResolver::default().resolve(&calc_config()).await.unwrap();
        assert!(resolved.is_static());
        assert_eq!(
            resolved.nodes,
            vec![Node::new("10.0.0.1", 9501), Node::new("10.0.0.2", 9501)]
        );
    }

    #[tokio::test]
    async fn test_static_resolution_is_repeatable() {
        let resolver = NodeResolver::default();
        let config = calc_config();
        let first = resolver.resolve(&config).await.unwrap().nodes;
        let second = resolver.resolve(&config).await.unwrap().nodes;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_invalid_static_entry() {
        let mut config = calc_config();
        config.nodes.as_mut().unwrap().push(NodeEntry {
            host: "10.0.0.3".to_string(),
            port: serde_json::json!("http"),
            weight: None,
        });

        match NodeResolver::default().resolve(&config).await {
            Err(RpcError::InvalidNodeConfig { service, entry, .. }) => {
                assert_eq!(service, "Calc");
                assert!(entry.contains("10.0.0.3"));
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected InvalidNodeConfig"),
        }
    }

    #[tokio::test]
    async fn test_missing_topology() {
        let config = ConsumerConfig::new("Calc").with_nodes(vec![]);
        assert!(matches!(
            NodeResolver::default().resolve(&config).await,
            Err(RpcError::MissingTopologyConfig { service }) if service == "Calc"
        ));
    }

    #[tokio::test]
    async fn test_unknown_registry_protocol() {
        let config = calc_config().with_registry(RegistryConfig::new("etcd", "http://etcd:2379"));
        assert!(matches!(
            NodeResolver::default().resolve(&config).await,
            Err(RpcError::RegistryUnavailable { protocol, .. }) if protocol == "etcd"
        ));
    }

    #[tokio::test]
    async fn test_failing_registry() {
        let resolver =
            NodeResolver::new(RegistryDrivers::new().register("consul", Arc::new(FailingDriver)));
        let config = ConsumerConfig::new("Calc")
            .with_registry(RegistryConfig::new("consul", "http://127.0.0.1:8500"));

        match resolver.resolve(&config).await {
            Err(RpcError::RegistryUnavailable { reason, .. }) => {
                assert!(reason.contains("connection refused"));
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected RegistryUnavailable"),
        }
    }

    #[tokio::test]
    async fn test_empty_registry_result_is_not_an_error() {
        let resolver = NodeResolver::new(
            RegistryDrivers::new().register("consul", Arc::new(MemoryRegistry::new())),
        );
        let config = ConsumerConfig::new("Calc")
            .with_registry(RegistryConfig::new("consul", "http://127.0.0.1:8500"));

        let resolved = resolver.resolve(&config).await.unwrap();
        assert!(resolved.nodes.is_empty());
        assert!(!resolved.is_static());
    }

    #[tokio::test]
    async fn test_registry_wins_over_static_nodes() {
        let registry = Arc::new(MemoryRegistry::new());
        registry
            .register_service(ServiceInfo::new(
                "Calc",
                "jsonrpc",
                vec![NodeEntry::new("192.168.1.9", 9600)],
            ))
            .await;
        let drivers = RegistryDrivers::new().register("nacos", registry.clone());
        let resolver = NodeResolver::new(drivers);
        assert_eq!(resolver.drivers().protocols(), vec!["nacos".to_string()]);
        let config = calc_config().with_registry(RegistryConfig::new("nacos", "http://nacos:8848"));

        let resolved = resolver.resolve(&config).await.unwrap();
        assert_eq!(resolved.nodes, vec![Node::new("192.168.1.9", 9600)]);

        registry
            .update_nodes("Calc", vec![NodeEntry::new("192.168.1.10", 9600)])
            .await;
        let refreshed = resolved.refresher.unwrap().refresh().await.unwrap();
        assert_eq!(refreshed, vec![Node::new("192.168.1.10", 9600)]);
    }

    #[tokio::test]
    async fn test_registry_receives_consumer_tags() {
        let driver = Arc::new(RecordingDriver {
            calls: AtomicUsize::new(0),
            seen: std::sync::Mutex::new(Vec::new()),
            nodes: vec![NodeEntry::new("a", 1)],
        });
        let resolver = NodeResolver::new(RegistryDrivers::new().register("consul", driver.clone()));
        let mut config = ConsumerConfig::new("Calc")
            .with_registry(RegistryConfig::new("consul", "http://127.0.0.1:8500"));
        config.group_name = Some("blue".to_string());
        config.namespace_id = Some("prod".to_string());

        let resolved = resolver.resolve(&config).await.unwrap();
        resolved.refresher.unwrap().refresh().await.unwrap();

        assert_eq!(driver.calls.load(Ordering::SeqCst), 2);
        let seen = driver.seen.lock().unwrap();
        assert_eq!(
            seen[0],
            RegistryTags {
                protocol: "jsonrpc".to_string(),
                group_name: Some("blue".to_string()),
                namespace_id: Some("prod".to_string()),
            }
        );
        assert_eq!(seen[0], seen[1]);
    }
}
