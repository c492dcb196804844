//! In-memory transport implementation.
//!
//! Simulates a remote peer entirely within the process. Responses are
//! scripted through a [`MemoryHandle`], either queued up front or produced
//! by a responder closure for every request sent. It is intended for
//! testing the client without network or timing variability.

use async_trait::async_trait;
use bytes::Bytes;
use rpc_balancer::LoadBalancer;
use rpc_core::{Node, Result, TransportError};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::Transport;

type Responder = Arc<dyn Fn(&Node, &[u8]) -> Option<Bytes> + Send + Sync>;

/// A request frame as it left the transport
#[derive(Clone, Debug)]
pub struct SentFrame {
    pub node: Node,
    pub data: Bytes,
}

impl SentFrame {
    /// Decode the frame as JSON
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.data).ok()
    }
}

#[derive(Default)]
struct MemoryState {
    sent: Vec<SentFrame>,
    responses: VecDeque<Bytes>,
    reads: usize,
    fail_sends: bool,
    responder: Option<Responder>,
}

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Shared control over a [`MemoryTransport`]. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryHandle {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryHandle {
    /// Queue a response to be read by a later `recv`
    pub fn push_response(&self, response: &Value) {
        self.push_raw(Bytes::from(response.to_string()));
    }

    pub fn push_raw(&self, frame: impl Into<Bytes>) {
        lock_ignore_poison(&self.state).responses.push_back(frame.into());
    }

    /// Produce responses from each sent request
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&Node, &[u8]) -> Option<Bytes> + Send + Sync + 'static,
    {
        lock_ignore_poison(&self.state).responder = Some(Arc::new(responder));
    }

    /// Make every subsequent `send` fail as if the peer went away
    pub fn fail_sends(&self, fail: bool) {
        lock_ignore_poison(&self.state).fail_sends = fail;
    }

    pub fn sent(&self) -> Vec<SentFrame> {
        lock_ignore_poison(&self.state).sent.clone()
    }

    /// Number of `recv` calls made, successful or not
    pub fn reads(&self) -> usize {
        lock_ignore_poison(&self.state).reads
    }

    pub fn pending_responses(&self) -> usize {
        lock_ignore_poison(&self.state).responses.len()
    }
}

/// In-memory transport
#[derive(Default)]
pub struct MemoryTransport {
    balancer: Option<Arc<LoadBalancer>>,
    handle: MemoryHandle,
    last_node: Option<Node>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> MemoryHandle {
        self.handle.clone()
    }

    fn peer(&self) -> String {
        self.last_node
            .as_ref()
            .map(Node::address)
            .unwrap_or_else(|| "memory".to_string())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn set_load_balancer(&mut self, balancer: Arc<LoadBalancer>) {
        self.balancer = Some(balancer);
    }

    fn load_balancer(&self) -> Option<&Arc<LoadBalancer>> {
        self.balancer.as_ref()
    }

    async fn send(&mut self, data: Bytes) -> Result<()> {
        let balancer = self.balancer.as_ref().ok_or(TransportError::Unbound)?;
        let node = balancer.next()?;
        debug!("memory transport sending {} bytes to {}", data.len(), node);

        let mut state = lock_ignore_poison(&self.handle.state);
        if state.fail_sends {
            return Err(TransportError::Closed {
                node: node.address(),
            }
            .into());
        }

        state.sent.push(SentFrame {
            node: node.clone(),
            data: data.clone(),
        });
        let responder = state.responder.clone();
        drop(state);

        // Called unlocked so a responder may use the handle
        if let Some(response) = responder.and_then(|respond| respond(&node, &data)) {
            lock_ignore_poison(&self.handle.state)
                .responses
                .push_back(response);
        }

        self.last_node = Some(node);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Bytes> {
        let peer = self.peer();
        let mut state = lock_ignore_poison(&self.handle.state);
        state.reads += 1;

        // An exhausted script behaves like a peer that hung up
        state
            .responses
            .pop_front()
            .ok_or_else(|| TransportError::Closed { node: peer }.into())
    }
}
