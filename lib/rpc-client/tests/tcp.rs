use bytes::Bytes;
use rpc_balancer::LoadBalancer;
use rpc_client::{RpcServiceClient, TcpTransport, Transport};
use rpc_core::{
    ConsumerConfig, ConsumerOptions, LoadBalancingStrategy, Node, NodeEntry, RpcError,
    TransportError,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// How the server treats the first connection it accepts; later ones always answer
#[derive(Clone, Copy)]
enum FirstConnection {
    Answer,
    /// Read requests, never reply
    Silent,
    /// Read one request, then close
    HangUp,
    /// Hold back the first reply
    Delay(Duration),
    /// Reply with bytes that never end in a newline
    Oversized,
}

/// Line-oriented JSON-RPC server that sums its params.
///
/// Returns its port and a counter of accepted connections.
async fn spawn_sum_server(first: FirstConnection) -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connections = Arc::new(AtomicUsize::new(0));

    let accepted = connections.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let index = accepted.fetch_add(1, Ordering::SeqCst);
            let mode = if index == 0 { first } else { FirstConnection::Answer };
            tokio::spawn(serve(stream, mode));
        }
    });

    (port, connections)
}

async fn serve(stream: TcpStream, mode: FirstConnection) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut answered = 0;

    while let Ok(Some(line)) = lines.next_line().await {
        match mode {
            FirstConnection::Silent => continue,
            FirstConnection::HangUp => return,
            FirstConnection::Oversized => {
                let _ = write_half.write_all(&[b'x'; 1024]).await;
                continue;
            }
            FirstConnection::Delay(delay) if answered == 0 => tokio::time::sleep(delay).await,
            _ => {}
        }

        let request: Value = serde_json::from_str(&line).unwrap();
        let sum: i64 = request["params"]
            .as_array()
            .map(|params| params.iter().filter_map(Value::as_i64).sum())
            .unwrap_or(0);
        let response = json!({"jsonrpc": "2.0", "id": request["id"], "result": sum});
        let frame = format!("{}\r\n", response);
        if write_half.write_all(frame.as_bytes()).await.is_err() {
            return;
        }
        answered += 1;
    }
}

fn consumer(ports: &[u16], options: ConsumerOptions) -> ConsumerConfig {
    let nodes = ports
        .iter()
        .map(|port| NodeEntry::new("127.0.0.1", *port))
        .collect();
    ConsumerConfig::new("Calc")
        .with_nodes(nodes)
        .with_load_balancer(LoadBalancingStrategy::RoundRobin)
        .with_options(options)
}

async fn tcp_client(config: ConsumerConfig) -> RpcServiceClient {
    let transport = TcpTransport::from_options(&config.options);
    RpcServiceClient::builder(config, transport)
        .build()
        .await
        .unwrap()
}

async fn sum(client: &RpcServiceClient, a: i64, b: i64) -> Option<Value> {
    let outcome = client.call("add", vec![json!(a), json!(b)]).await.unwrap();
    outcome.result().cloned()
}

#[tokio::test]
async fn test_call_over_tcp() {
    let (port, connections) = spawn_sum_server(FirstConnection::Answer).await;
    let client = tcp_client(consumer(&[port], ConsumerOptions::default())).await;

    let outcome = client
        .call_with_id("add", vec![json!(1), json!(2)], Some("abc".to_string()))
        .await
        .unwrap();
    assert_eq!(outcome.result(), Some(&json!(3)));
    assert_eq!(sum(&client, 40, 2).await, Some(json!(42)));

    // Both calls went to the same node over one connection
    assert_eq!(connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_transport_frames_and_tracks_node() {
    let (port, _) = spawn_sum_server(FirstConnection::Answer).await;
    let node = Node::new("127.0.0.1", port);
    let balancer = LoadBalancer::new("Calc", LoadBalancingStrategy::RoundRobin)
        .with_nodes(vec![node.clone()]);

    let mut transport = TcpTransport::new();
    assert!(transport.load_balancer().is_none());
    assert!(matches!(
        transport.recv().await,
        Err(RpcError::Transport(TransportError::NotConnected))
    ));

    transport.set_load_balancer(Arc::new(balancer));
    assert_eq!(transport.load_balancer().unwrap().service(), "Calc");

    let request = json!({"jsonrpc": "2.0", "method": "Calc.add", "params": [2, 2], "id": "x"});
    transport
        .send(Bytes::from(request.to_string()))
        .await
        .unwrap();
    assert_eq!(transport.connected_node(), Some(&node));

    // Delimiter and carriage return are stripped
    let frame = transport.recv().await.unwrap();
    assert!(!frame.ends_with(b"\r") && !frame.ends_with(b"\n"));
    let response: Value = serde_json::from_slice(&frame).unwrap();
    assert_eq!(response["result"], 4);
}

#[tokio::test]
async fn test_abandoned_call_does_not_leak_its_reply() {
    let (port, connections) =
        spawn_sum_server(FirstConnection::Delay(Duration::from_millis(200))).await;
    let config = consumer(&[port], ConsumerOptions::default());
    let client = RpcServiceClient::builder(config, TcpTransport::new())
        .id_generator(None)
        .build()
        .await
        .unwrap();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        client.call("add", vec![json!(1), json!(2)]),
    )
    .await;
    assert!(abandoned.is_err());

    // The late reply to 1 + 2 stays on the old connection
    assert_eq!(sum(&client, 40, 2).await, Some(json!(42)));
    assert_eq!(connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_connection_refused() {
    // Bind then drop to get a port nothing listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = tcp_client(consumer(&[port], ConsumerOptions::default())).await;

    let err = client.call("add", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Transport(TransportError::Io { .. })));
}

#[tokio::test]
async fn test_recv_timeout_drops_connection() {
    let (port, connections) = spawn_sum_server(FirstConnection::Silent).await;
    let options = ConsumerOptions {
        recv_timeout_ms: 50,
        ..ConsumerOptions::default()
    };
    let client = tcp_client(consumer(&[port], options)).await;

    let err = client.call("add", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Transport(TransportError::Timeout { .. })));

    assert_eq!(sum(&client, 1, 2).await, Some(json!(3)));
    assert_eq!(connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_peer_hangup_drops_connection() {
    let (port, connections) = spawn_sum_server(FirstConnection::HangUp).await;
    let client = tcp_client(consumer(&[port], ConsumerOptions::default())).await;

    let err = client.call("add", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Transport(TransportError::Closed { .. })));

    assert_eq!(sum(&client, 1, 2).await, Some(json!(3)));
    assert_eq!(connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_oversized_frame_is_rejected() {
    let (port, connections) = spawn_sum_server(FirstConnection::Oversized).await;
    let options = ConsumerOptions {
        max_frame_bytes: 128,
        ..ConsumerOptions::default()
    };
    let client = tcp_client(consumer(&[port], options)).await;

    let err = client.call("add", vec![]).await.unwrap_err();
    assert!(matches!(
        err,
        RpcError::Transport(TransportError::FrameTooLarge { limit: 128, .. })
    ));

    // Short replies still fit
    assert_eq!(sum(&client, 1, 2).await, Some(json!(3)));
    assert_eq!(connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_switching_nodes_replaces_connection() {
    let (first_port, first) = spawn_sum_server(FirstConnection::Answer).await;
    let (second_port, second) = spawn_sum_server(FirstConnection::Answer).await;
    let config = consumer(&[first_port, second_port], ConsumerOptions::default());
    let client = tcp_client(config).await;

    for i in 0..4 {
        assert_eq!(sum(&client, i, 1).await, Some(json!(i + 1)));
    }

    // Every pick alternates, so every call opens a fresh connection
    assert_eq!(first.load(Ordering::SeqCst), 2);
    assert_eq!(second.load(Ordering::SeqCst), 2);
}
