//! Load balancing strategies for distributing calls across nodes

use arc_swap::ArcSwap;
use rand::Rng;
use rpc_core::{LoadBalancingStrategy, Node, NodeRefresher, Result, RpcError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Current weights for smooth weighted round-robin, tied to one node set snapshot
#[derive(Default)]
struct SmoothWeights {
    nodes: Option<Arc<Vec<Node>>>,
    current: Vec<i64>,
}

/// Selection state only ever holds counters, so a poisoned lock is still usable
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Load balancer for selecting a node of one service based on a strategy.
///
/// The node set is swapped atomically: a selection always sees either the
/// old set or the new one, never a mix.
pub struct LoadBalancer {
    service: String,
    strategy: LoadBalancingStrategy,
    nodes: ArcSwap<Vec<Node>>,
    round_robin_counter: AtomicUsize,
    smooth_weights: Mutex<SmoothWeights>,
    refresher: Option<Arc<dyn NodeRefresher>>,
}

impl LoadBalancer {
    /// Create a new load balancer with the specified strategy and no nodes
    pub fn new(service: impl Into<String>, strategy: LoadBalancingStrategy) -> Self {
        Self {
            service: service.into(),
            strategy,
            nodes: ArcSwap::from_pointee(Vec::new()),
            round_robin_counter: AtomicUsize::new(0),
            smooth_weights: Mutex::new(SmoothWeights::default()),
            refresher: None,
        }
    }

    pub fn with_nodes(self, nodes: Vec<Node>) -> Self {
        self.set_nodes(nodes);
        self
    }

    /// Register the function used to re-fetch the node set.
    ///
    /// Without one the topology stays static for the balancer's lifetime.
    pub fn with_refresher(mut self, refresher: Arc<dyn NodeRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    pub fn is_static(&self) -> bool {
        self.refresher.is_none()
    }

    /// Replace the node set
    pub fn set_nodes(&self, nodes: Vec<Node>) {
        debug!("Installing {} nodes for {}", nodes.len(), self.service);
        self.nodes.store(Arc::new(nodes));
    }

    /// Snapshot of the current node set
    pub fn nodes(&self) -> Arc<Vec<Node>> {
        self.nodes.load_full()
    }

    /// Select the node for the next call
    pub fn next(&self) -> Result<Node> {
        let nodes = self.nodes.load_full();

        let selected = match self.strategy {
            LoadBalancingStrategy::Random => Self::select_random(&nodes),
            LoadBalancingStrategy::RoundRobin => self.select_round_robin(&nodes),
            LoadBalancingStrategy::WeightedRandom => Self::select_weighted_random(&nodes),
            LoadBalancingStrategy::WeightedRoundRobin => self.select_weighted_round_robin(&nodes),
        };

        selected.ok_or_else(|| RpcError::NoAvailableNode {
            service: self.service.clone(),
        })
    }

    /// Re-fetch and install the node set.
    ///
    /// Returns `Ok(false)` for a static topology. On failure the previous
    /// node set stays in place.
    pub async fn refresh(&self) -> Result<bool> {
        let Some(refresher) = &self.refresher else {
            return Ok(false);
        };

        let nodes = refresher.refresh().await?;
        self.set_nodes(nodes);
        Ok(true)
    }

    /// Refresh the node set on a fixed interval in the background.
    ///
    /// Returns `None` for a static topology. The task stops when the handle
    /// is dropped or the balancer is gone.
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration) -> Option<RefreshHandle> {
        if self.refresher.is_none() || interval.is_zero() {
            return None;
        }

        let balancer: Weak<Self> = Arc::downgrade(self);
        let service = self.service.clone();
        debug!("Refreshing nodes for {} every {:?}", service, interval);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; nodes were just resolved
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(balancer) = balancer.upgrade() else {
                    break;
                };
                if let Err(e) = balancer.refresh().await {
                    warn!("Failed to refresh nodes for {}: {}", service, e);
                }
            }
        });

        Some(RefreshHandle { task })
    }

    /// Select a uniformly random node
    fn select_random(nodes: &[Node]) -> Option<Node> {
        if nodes.is_empty() {
            return None;
        }

        let index = rand::thread_rng().gen_range(0..nodes.len());
        nodes.get(index).cloned()
    }

    /// Select node using round-robin
    fn select_round_robin(&self, nodes: &[Node]) -> Option<Node> {
        if nodes.is_empty() {
            return None;
        }

        let current = self.round_robin_counter.fetch_add(1, Ordering::SeqCst);
        nodes.get(current % nodes.len()).cloned()
    }

    /// Select a random node with probability proportional to its weight
    fn select_weighted_random(nodes: &[Node]) -> Option<Node> {
        let total: u64 = nodes.iter().map(|n| u64::from(n.weight)).sum();
        if total == 0 {
            return Self::select_random(nodes);
        }

        let mut pick = rand::thread_rng().gen_range(0..total);
        for node in nodes {
            let weight = u64::from(node.weight);
            if pick < weight {
                return Some(node.clone());
            }
            pick -= weight;
        }
        nodes.last().cloned()
    }

    /// Smooth weighted round-robin: every pick raises each node by its
    /// weight, takes the highest, and lowers the winner by the total.
    fn select_weighted_round_robin(&self, nodes: &Arc<Vec<Node>>) -> Option<Node> {
        let total: i64 = nodes.iter().map(|n| i64::from(n.weight)).sum();
        if total == 0 {
            return self.select_round_robin(nodes);
        }

        let mut state = lock_ignore_poison(&self.smooth_weights);
        let same_set = state
            .nodes
            .as_ref()
            .map_or(false, |known| Arc::ptr_eq(known, nodes));
        if !same_set {
            state.nodes = Some(nodes.clone());
            state.current = vec![0; nodes.len()];
        }

        let mut best = 0;
        for (i, node) in nodes.iter().enumerate() {
            state.current[i] += i64::from(node.weight);
            if state.current[i] > state.current[best] {
                best = i;
            }
        }
        state.current[best] -= total;

        nodes.get(best).cloned()
    }
}

/// Handle to a background refresh task; aborts the task on drop
pub struct RefreshHandle {
    task: JoinHandle<()>,
}

impl RefreshHandle {
    pub fn stop(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
