//! Transport abstraction.
//!
//! A transport delivers one packed request to a node chosen by its load
//! balancer and reads packed responses back. It knows nothing about
//! correlation ids or response shapes; reconciliation happens in the client.
//!
//! Both operations take `&mut self`: the client holds the transport behind a
//! lock for a whole send/receive cycle, so a transport never sees two
//! requests interleaved on one connection. A transport that multiplexes or
//! pools connections is just another implementation of [`Transport`].

use async_trait::async_trait;
use bytes::Bytes;
use rpc_balancer::LoadBalancer;
use rpc_core::Result;
use std::sync::Arc;

pub mod memory;
pub mod tcp;

pub use memory::{MemoryHandle, MemoryTransport, SentFrame};
pub use tcp::TcpTransport;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind the balancer used to pick a node for each request
    fn set_load_balancer(&mut self, balancer: Arc<LoadBalancer>);

    fn load_balancer(&self) -> Option<&Arc<LoadBalancer>>;

    /// Deliver one request frame
    async fn send(&mut self, data: Bytes) -> Result<()>;

    /// Read one response frame
    async fn recv(&mut self) -> Result<Bytes>;
}
