//! Prometheus metrics for client calls

use anyhow::Result;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;

/// Prometheus metrics collector for RPC calls
#[derive(Clone)]
pub struct ClientMetrics {
    /// Calls by service, method and outcome
    pub calls_total: CounterVec,
    /// Call latency in seconds
    pub call_duration_seconds: HistogramVec,
    /// Responses skipped because they carried another request's id
    pub id_mismatch_reads_total: CounterVec,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl ClientMetrics {
    /// Create a collector with its own registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Create a collector registering into an existing registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let calls_total = CounterVec::new(
            Opts::new("rpc_client_calls_total", "Total RPC calls by outcome"),
            &["service", "method", "outcome"],
        )?;

        let call_duration_seconds = HistogramVec::new(
            HistogramOpts::new("rpc_client_call_duration_seconds", "RPC call latency in seconds"),
            &["service", "method"],
        )?;

        let id_mismatch_reads_total = CounterVec::new(
            Opts::new(
                "rpc_client_id_mismatch_reads_total",
                "Responses read with a request id other than the expected one",
            ),
            &["service"],
        )?;

        registry.register(Box::new(calls_total.clone()))?;
        registry.register(Box::new(call_duration_seconds.clone()))?;
        registry.register(Box::new(id_mismatch_reads_total.clone()))?;

        Ok(Self {
            calls_total,
            call_duration_seconds,
            id_mismatch_reads_total,
            registry,
        })
    }

    pub fn record_call(&self, service: &str, method: &str, outcome: &str, elapsed: Duration) {
        self.calls_total
            .with_label_values(&[service, method, outcome])
            .inc();
        self.call_duration_seconds
            .with_label_values(&[service, method])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_id_mismatch(&self, service: &str) {
        self.id_mismatch_reads_total
            .with_label_values(&[service])
            .inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_gather() {
        let metrics = ClientMetrics::new().unwrap();
        metrics.record_call("Calc", "add", "result", Duration::from_millis(3));
        metrics.record_id_mismatch("Calc");

        let text = metrics.gather().unwrap();
        assert!(text.contains("rpc_client_calls_total"));
        assert!(text.contains("outcome=\"result\""));
        assert!(text.contains("rpc_client_id_mismatch_reads_total{service=\"Calc\"} 1"));
    }

    #[test]
    fn test_shared_registry_rejects_duplicates() {
        let registry = Arc::new(Registry::new());
        ClientMetrics::with_registry(registry.clone()).unwrap();
        assert!(ClientMetrics::with_registry(registry).is_err());
    }
}
