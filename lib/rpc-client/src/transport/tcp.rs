//! Newline-delimited frames over TCP

use async_trait::async_trait;
use bytes::Bytes;
use rpc_balancer::LoadBalancer;
use rpc_core::{ConsumerOptions, Node, Result, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::Transport;

const FRAME_DELIMITER: u8 = b'\n';

struct Connection {
    node: Node,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// TCP transport keeping one open connection at a time.
///
/// Each request goes to the node the balancer picks; the current connection
/// is reused when the pick is the node it is already connected to and the
/// previous reply has been read. Any I/O failure or timeout, or a send while
/// a reply is still outstanding (the earlier call was abandoned), drops the
/// connection so a stale response can never be read by a later request.
pub struct TcpTransport {
    balancer: Option<Arc<LoadBalancer>>,
    connection: Option<Connection>,
    /// A request went out on `connection` and its reply has not been read
    awaiting_response: bool,
    connect_timeout: Duration,
    recv_timeout: Duration,
    max_frame_bytes: usize,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::from_options(&ConsumerOptions::default())
    }

    pub fn from_options(options: &ConsumerOptions) -> Self {
        Self::with_timeouts(
            Duration::from_millis(options.connect_timeout_ms),
            Duration::from_millis(options.recv_timeout_ms),
        )
        .with_max_frame_bytes(options.max_frame_bytes)
    }

    pub fn with_timeouts(connect_timeout: Duration, recv_timeout: Duration) -> Self {
        Self {
            balancer: None,
            connection: None,
            awaiting_response: false,
            connect_timeout,
            recv_timeout,
            max_frame_bytes: ConsumerOptions::default().max_frame_bytes,
        }
    }

    /// Longest response frame accepted, delimiter excluded
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Node of the currently open connection
    pub fn connected_node(&self) -> Option<&Node> {
        self.connection.as_ref().map(|c| &c.node)
    }

    async fn connect(&self, node: &Node) -> Result<Connection> {
        let address = node.address();
        debug!("Connecting to {} with {}ms timeout", address, self.connect_timeout.as_millis());

        let stream = match timeout(self.connect_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TransportError::Io {
                    node: address,
                    source,
                }
                .into())
            }
            Err(_) => {
                return Err(TransportError::Timeout {
                    node: address,
                    after: self.connect_timeout,
                }
                .into())
            }
        };
        stream.set_nodelay(true).map_err(|source| TransportError::Io {
            node: address.clone(),
            source,
        })?;

        let (read_half, write_half) = stream.into_split();
        Ok(Connection {
            node: node.clone(),
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn set_load_balancer(&mut self, balancer: Arc<LoadBalancer>) {
        self.balancer = Some(balancer);
    }

    fn load_balancer(&self) -> Option<&Arc<LoadBalancer>> {
        self.balancer.as_ref()
    }

    async fn send(&mut self, data: Bytes) -> Result<()> {
        let balancer = self.balancer.as_ref().ok_or(TransportError::Unbound)?;
        let node = balancer.next()?;

        if self.awaiting_response && self.connection.is_some() {
            debug!("Dropping connection with an unread reply before sending to {}", node);
            self.connection = None;
        }
        let reuse = matches!(&self.connection, Some(c) if c.node == node);
        if !reuse {
            self.connection = None;
            self.awaiting_response = false;
            let connection = self.connect(&node).await?;
            self.connection = Some(connection);
        }
        let Some(connection) = self.connection.as_mut() else {
            return Err(TransportError::NotConnected.into());
        };

        let mut frame = Vec::with_capacity(data.len() + 1);
        frame.extend_from_slice(&data);
        frame.push(FRAME_DELIMITER);

        debug!("Sending {} bytes to {}", data.len(), node);
        // Set before writing so a send cancelled mid-frame also forces a reconnect
        self.awaiting_response = true;
        let written = connection.writer.write_all(&frame).await;
        if let Err(source) = written {
            self.connection = None;
            return Err(TransportError::Io {
                node: node.address(),
                source,
            }
            .into());
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Bytes> {
        let Some(connection) = self.connection.as_mut() else {
            return Err(TransportError::NotConnected.into());
        };
        let node = connection.node.address();
        let limit = self.max_frame_bytes;

        // One byte past the limit is enough to tell an oversized frame apart
        let mut frame = Vec::new();
        let mut bounded = (&mut connection.reader).take((limit as u64).saturating_add(1));
        let read = timeout(
            self.recv_timeout,
            bounded.read_until(FRAME_DELIMITER, &mut frame),
        )
        .await;

        let error = match read {
            Ok(Ok(0)) => TransportError::Closed { node },
            Ok(Ok(_)) if frame.last() != Some(&FRAME_DELIMITER) && frame.len() > limit => {
                TransportError::FrameTooLarge { node, limit }
            }
            Ok(Ok(_)) => {
                while matches!(frame.last(), Some(b'\n' | b'\r')) {
                    frame.pop();
                }
                debug!("Received {} bytes from {}", frame.len(), node);
                self.awaiting_response = false;
                return Ok(Bytes::from(frame));
            }
            Ok(Err(source)) => TransportError::Io { node, source },
            Err(_) => TransportError::Timeout {
                node,
                after: self.recv_timeout,
            },
        };

        self.connection = None;
        Err(error.into())
    }
}
