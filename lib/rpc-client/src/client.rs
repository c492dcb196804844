//! RPC service client.
//!
//! [`RpcServiceClient`] wires a consumer record into a working client once,
//! at construction: nodes are resolved, a load balancer is built over them
//! and bound to the transport. Each call then runs the same short cycle:
//! build the request, send it, read responses until one matches the
//! request's correlation id (or the re-read budget runs out), and return
//! its `result` or `error` payload.
//!
//! # Concurrency
//!
//! The transport sits behind an async mutex held for a whole
//! send/receive cycle, so at most one request is in flight per client.
//! Callers needing parallelism should use several clients or a pooling
//! transport.

use rpc_balancer::{LoadBalancer, RefreshHandle};
use rpc_core::{ConsumerConfig, ConsumerOptions, NodeResolver, Result, RpcError, ServicesConfig};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::id::{IdGenerator, UuidIdGenerator};
use crate::metrics::ClientMetrics;
use crate::protocol::{
    rpc_path, CallOutcome, JsonPacker, JsonRpcFormatter, Packer, RequestFormatter, RpcResponse,
};
use crate::transport::Transport;

/// How responses are matched to the request that was sent
enum Correlation {
    /// Only a response carrying this id is accepted
    ById(String),
    /// No id was sent; the first response read is accepted
    Unordered,
}

impl Correlation {
    fn id(&self) -> Option<&str> {
        match self {
            Correlation::ById(id) => Some(id),
            Correlation::Unordered => None,
        }
    }
}

/// Client for one remote service
pub struct RpcServiceClient {
    service: String,
    options: ConsumerOptions,
    balancer: Arc<LoadBalancer>,
    transport: Mutex<Box<dyn Transport>>,
    formatter: Arc<dyn RequestFormatter>,
    packer: Arc<dyn Packer>,
    id_generator: Option<Arc<dyn IdGenerator>>,
    metrics: Option<ClientMetrics>,
    _refresh: Option<RefreshHandle>,
}

impl RpcServiceClient {
    pub fn builder(
        config: ConsumerConfig,
        transport: impl Transport + 'static,
    ) -> RpcServiceClientBuilder {
        RpcServiceClientBuilder {
            config,
            transport: Box::new(transport),
            resolver: NodeResolver::default(),
            formatter: Arc::new(JsonRpcFormatter),
            packer: Arc::new(JsonPacker),
            id_generator: Some(Arc::new(UuidIdGenerator)),
            metrics: None,
        }
    }

    /// Builder for the consumer named `name` in a services list
    pub fn builder_for(
        services: &ServicesConfig,
        name: &str,
        transport: impl Transport + 'static,
    ) -> Result<RpcServiceClientBuilder> {
        let config = services.require_consumer(name)?.clone();
        Ok(Self::builder(config, transport))
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    /// Re-fetch the node set now, e.g. after `NoAvailableNode`.
    ///
    /// Returns `Ok(false)` for a static topology.
    pub async fn refresh_nodes(&self) -> Result<bool> {
        self.balancer.refresh().await
    }

    /// Call `method` with a generated correlation id
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<CallOutcome> {
        self.call_with_id(method, params, None).await
    }

    /// Call `method`, using `id` as correlation id when given.
    ///
    /// An application-level `error` in the response is returned as
    /// [`CallOutcome::Error`]; only failures of the call itself are `Err`.
    pub async fn call_with_id(
        &self,
        method: &str,
        params: Vec<Value>,
        id: Option<String>,
    ) -> Result<CallOutcome> {
        let started = Instant::now();
        let result = self.dispatch(method, &params, id).await;

        if let Some(metrics) = &self.metrics {
            metrics.record_call(&self.service, method, outcome_label(&result), started.elapsed());
        }
        result
    }

    async fn dispatch(
        &self,
        method: &str,
        params: &[Value],
        id: Option<String>,
    ) -> Result<CallOutcome> {
        let id = id.or_else(|| self.id_generator.as_ref().map(|ids| ids.generate()));
        let correlation = match id {
            Some(id) => Correlation::ById(id),
            None => Correlation::Unordered,
        };

        let path = rpc_path(&self.service, method, &self.options.path_separator)?;
        let envelope = self.formatter.format_request(&path, params, correlation.id());
        let frame = self.packer.pack(&envelope)?;

        let mut transport = self.transport.lock().await;
        debug!("Calling {} (id: {:?})", path, correlation.id());
        transport.send(frame).await?;

        let mut retries_left = self.options.recv_retries;
        let response = loop {
            let response = self.read_response(&mut **transport, method).await?;

            let Correlation::ById(expected) = &correlation else {
                break response;
            };
            if response.id.as_deref() == Some(expected.as_str()) {
                break response;
            }

            if let Some(metrics) = &self.metrics {
                metrics.record_id_mismatch(&self.service);
            }
            if retries_left == 0 {
                return Err(RpcError::RequestIdMismatch {
                    service: self.service.clone(),
                    method: method.to_string(),
                    expected: expected.clone(),
                    got: response.id,
                });
            }
            retries_left -= 1;
            warn!(
                "Discarding response with id {:?} while waiting for {} on {}",
                response.id, expected, path
            );
        };
        drop(transport);

        response
            .into_outcome()
            .ok_or_else(|| self.invalid_response(method, "response has neither result nor error"))
    }

    async fn read_response(
        &self,
        transport: &mut dyn Transport,
        method: &str,
    ) -> Result<RpcResponse> {
        let frame = transport.recv().await?;
        let value = self
            .packer
            .unpack(&frame)
            .map_err(|e| self.invalid_response(method, &format!("undecodable response: {}", e)))?;

        RpcResponse::from_value(value)
            .ok_or_else(|| self.invalid_response(method, "response is not an object"))
    }

    fn invalid_response(&self, method: &str, reason: &str) -> RpcError {
        RpcError::InvalidResponse {
            service: self.service.clone(),
            method: method.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn outcome_label(result: &Result<CallOutcome>) -> &'static str {
    match result {
        Ok(CallOutcome::Result(_)) => "result",
        Ok(CallOutcome::Error(_)) => "application_error",
        Err(RpcError::NoAvailableNode { .. }) => "no_available_node",
        Err(RpcError::Transport(_)) => "transport_error",
        Err(RpcError::RequestIdMismatch { .. }) => "id_mismatch",
        Err(RpcError::InvalidResponse { .. }) => "invalid_response",
        Err(_) => "failed",
    }
}

/// Assembles an [`RpcServiceClient`]; nothing is resolved until [`build`](Self::build)
pub struct RpcServiceClientBuilder {
    config: ConsumerConfig,
    transport: Box<dyn Transport>,
    resolver: NodeResolver,
    formatter: Arc<dyn RequestFormatter>,
    packer: Arc<dyn Packer>,
    id_generator: Option<Arc<dyn IdGenerator>>,
    metrics: Option<ClientMetrics>,
}

impl RpcServiceClientBuilder {
    /// Resolver holding the registry drivers available to this client
    pub fn resolver(mut self, resolver: NodeResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn formatter(mut self, formatter: Arc<dyn RequestFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn packer(mut self, packer: Arc<dyn Packer>) -> Self {
        self.packer = packer;
        self
    }

    /// `None` sends requests without an id and accepts the first response read
    pub fn id_generator(mut self, id_generator: Option<Arc<dyn IdGenerator>>) -> Self {
        self.id_generator = id_generator;
        self
    }

    pub fn metrics(mut self, metrics: ClientMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Resolve nodes, build the load balancer and bind it to the transport.
    ///
    /// Any failure here, including a registry that cannot be reached, fails
    /// construction as a whole.
    pub async fn build(self) -> Result<RpcServiceClient> {
        let config = self.config;
        let resolved = self.resolver.resolve(&config).await?;

        let mut balancer = LoadBalancer::new(config.name.clone(), config.load_balancer)
            .with_nodes(resolved.nodes);
        if let Some(refresher) = resolved.refresher {
            balancer = balancer.with_refresher(refresher);
        }
        let balancer = Arc::new(balancer);

        let refresh = config
            .options
            .refresh_interval_ms
            .and_then(|ms| balancer.spawn_refresh(Duration::from_millis(ms)));

        let mut transport = self.transport;
        transport.set_load_balancer(balancer.clone());

        info!(
            "Client for {} ready with {} nodes ({:?}, {})",
            config.name,
            balancer.nodes().len(),
            config.load_balancer,
            if balancer.is_static() { "static" } else { "registry" }
        );

        Ok(RpcServiceClient {
            service: config.name,
            options: config.options,
            balancer,
            transport: Mutex::new(transport),
            formatter: self.formatter,
            packer: self.packer,
            id_generator: self.id_generator,
            metrics: self.metrics,
            _refresh: refresh,
        })
    }
}
