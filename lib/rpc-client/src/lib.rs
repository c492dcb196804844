//! Client-side request dispatch for RPC services
//!
//! This library provides:
//! - [`RpcServiceClient`], which resolves a service's nodes once, picks one
//!   per call through a load balancer and matches responses to requests by
//!   correlation id
//! - The protocol seam: rpc paths, request formatting, packing and response
//!   parsing
//! - Transports: in-memory for tests, newline-delimited TCP
//! - Correlation id generators and Prometheus call metrics

pub mod client;
pub mod id;
pub mod metrics;
pub mod protocol;
pub mod transport;

pub use client::{RpcServiceClient, RpcServiceClientBuilder};
pub use id::{IdGenerator, SequenceIdGenerator, UuidIdGenerator};
pub use metrics::ClientMetrics;
pub use protocol::{
    rpc_path, CallOutcome, JsonPacker, JsonRpcFormatter, Packer, RequestFormatter, RpcResponse,
};
pub use transport::{MemoryHandle, MemoryTransport, SentFrame, TcpTransport, Transport};
