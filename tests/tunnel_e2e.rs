//! End-to-end tests for the tunnel multiplexer.
//!
//! Each test spins up a real server and client over loopback TCP and drives
//! virtual connections through the WebSocket session.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use backhaul::client::allow_all_connections;
use backhaul::{
    Authorizer, BoxedConn, ClientConfig, Dialer, HandshakeRequest, Message, Server, ServerConfig,
    TokenGetter, TokenSource, TunnelClient,
};

const ID_HEADER: &str = "x-tunnel-id";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Authorizer that reads the client key from the `x-tunnel-id` header
fn header_authorizer() -> Authorizer {
    Arc::new(|request: &HandshakeRequest| {
        let key = request
            .headers()
            .get(ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let authed = !key.is_empty();
        Ok((key, authed))
    })
}

/// Make session logs visible when running with `RUST_LOG` set
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Bind an ephemeral port and serve the given server on it
async fn start_server(server: &Arc<Server>) -> SocketAddr {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = Arc::clone(server);
    tokio::spawn(async move {
        let _ = serving.serve_listener(listener).await;
    });
    addr
}

/// TCP echo server on an ephemeral port
async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// Run a tunnel client for `client_key` against `server_addr` in the
/// background
fn start_client(server_addr: SocketAddr, client_key: &str) -> JoinHandle<()> {
    let config =
        ClientConfig::new(format!("ws://{server_addr}")).with_header(ID_HEADER, client_key);
    let client = TunnelClient::new(config).with_connect_authorizer(allow_all_connections());
    tokio::spawn(async move {
        let _ = client.run_once().await;
    })
}

/// Poll `cond` until it holds or a generous deadline expires
async fn eventually(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..250 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_for_session(server: &Arc<Server>, client_key: &str) {
    let server = Arc::clone(server);
    let key = client_key.to_string();
    eventually(
        move || server.has_session(&key),
        &format!("session for {client_key}"),
    )
    .await;
}

fn getter(value: &str) -> TokenGetter {
    let value = value.to_string();
    Arc::new(move || Ok(value.clone()))
}

// ---------------------------------------------------------------------------
// 1. Echo through the tunnel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_echo_roundtrip() {
    let server = Arc::new(Server::new(ServerConfig::default(), header_authorizer()));
    let server_addr = start_server(&server).await;
    let echo_addr = start_echo().await;

    let _client = start_client(server_addr, "cluster-b");
    wait_for_session(&server, "cluster-b").await;

    let mut stream = server
        .dial(
            "cluster-b",
            Duration::from_secs(2),
            "tcp",
            &echo_addr.to_string(),
        )
        .await
        .expect("dial through the tunnel must succeed");

    stream.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello", "echo must return the same bytes");

    stream.shutdown().await.unwrap();

    // Close releases the connection id on the caller side
    let counting = Arc::clone(&server);
    eventually(
        move || counting.active_virtual_connections("cluster-b") == 0,
        "virtual connection teardown",
    )
    .await;
}

#[tokio::test]
async fn test_echo_large_transfer_preserves_order() {
    let server = Arc::new(Server::new(ServerConfig::default(), header_authorizer()));
    let server_addr = start_server(&server).await;
    let echo_addr = start_echo().await;

    let _client = start_client(server_addr, "cluster-b");
    wait_for_session(&server, "cluster-b").await;

    let mut stream = server
        .dial(
            "cluster-b",
            Duration::from_secs(2),
            "tcp",
            &echo_addr.to_string(),
        )
        .await
        .unwrap();

    // Big enough to span many Data frames in both directions
    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let writer = tokio::spawn(async move {
        write_half.write_all(&payload).await.unwrap();
        write_half
    });

    let mut received = vec![0u8; expected.len()];
    read_half.read_exact(&mut received).await.unwrap();
    assert_eq!(received, expected, "bytes must arrive intact and in order");

    let write_half = writer.await.unwrap();
    stream = read_half.unsplit(write_half);
    stream.shutdown().await.unwrap();
}

// ---------------------------------------------------------------------------
// 2. Dial failure surfaces the dialer's error
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_dial_failure_propagates_cause() {
    let server = Arc::new(Server::new(ServerConfig::default(), header_authorizer()));
    let server_addr = start_server(&server).await;

    let failing: Dialer = Arc::new(|_proto, _address| {
        Box::pin(async {
            Err::<BoxedConn, io::Error>(io::Error::other("synthetic dial failure"))
        })
    });
    let config =
        ClientConfig::new(format!("ws://{server_addr}")).with_header(ID_HEADER, "cluster-b");
    let client = TunnelClient::new(config)
        .with_connect_authorizer(allow_all_connections())
        .with_dialer(failing);
    tokio::spawn(async move {
        let _ = client.run_once().await;
    });
    wait_for_session(&server, "cluster-b").await;

    let mut stream = server
        .dial(
            "cluster-b",
            Duration::from_secs(1),
            "tcp",
            "unreachable:1",
        )
        .await
        .expect("the Connect frame itself is accepted");

    let mut buf = [0u8; 8];
    let err = stream.read(&mut buf).await.unwrap_err();
    assert!(
        err.to_string().contains("synthetic dial failure"),
        "the dialer's cause must reach the caller, got: {err}"
    );

    let counting = Arc::clone(&server);
    eventually(
        move || counting.active_virtual_connections("cluster-b") == 0,
        "failed connection cleanup",
    )
    .await;

    // The session survives the failed dial
    assert!(server.has_session("cluster-b"));
}

// ---------------------------------------------------------------------------
// 3. Token round-trip and cache
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cluster_token_roundtrip_and_cache() {
    let server = Arc::new(Server::new(ServerConfig::default(), header_authorizer()));
    let server_addr = start_server(&server).await;

    let config =
        ClientConfig::new(format!("ws://{server_addr}")).with_header(ID_HEADER, "cluster-b");
    let client = TunnelClient::new(config)
        .with_connect_authorizer(allow_all_connections())
        .with_token_source(TokenSource::new(getter("tk"), getter("ca")));
    let client_task = tokio::spawn(async move {
        let _ = client.run_once().await;
    });
    wait_for_session(&server, "cluster-b").await;

    let first = server
        .get_cluster_token("cluster-b", Duration::from_secs(2))
        .await
        .expect("token fetch must succeed");
    assert_eq!(first.token, "tk");
    assert_eq!(first.cacert, "ca");

    let second = server
        .get_cluster_token("cluster-b", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(second, first);

    // Kill the client; a cached token must still be served, which proves the
    // second lookup never issued a TokenConnect over the wire
    client_task.abort();
    let checking = Arc::clone(&server);
    eventually(
        move || !checking.has_session("cluster-b"),
        "session teardown",
    )
    .await;

    let cached = server
        .get_cluster_token("cluster-b", Duration::from_secs(2))
        .await
        .expect("cache hit must not require a session");
    assert_eq!(cached, first);
}

#[tokio::test]
async fn test_cluster_token_empty_fields_rejected() {
    let server = Arc::new(Server::new(ServerConfig::default(), header_authorizer()));
    let server_addr = start_server(&server).await;

    let config =
        ClientConfig::new(format!("ws://{server_addr}")).with_header(ID_HEADER, "cluster-b");
    let client = TunnelClient::new(config)
        .with_connect_authorizer(allow_all_connections())
        .with_token_source(TokenSource::new(getter(""), getter("ca")));
    tokio::spawn(async move {
        let _ = client.run_once().await;
    });
    wait_for_session(&server, "cluster-b").await;

    let err = server
        .get_cluster_token("cluster-b", Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("token or cacert not found"),
        "empty fields must be rejected, got: {err}"
    );
}

// ---------------------------------------------------------------------------
// 4. Peer routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_peer_routing_forwards_dials() {
    let s1 = Arc::new(
        Server::new(ServerConfig::default(), header_authorizer())
            .with_peer_identity("s1", "mesh-secret"),
    );
    let s2 = Arc::new(
        Server::new(ServerConfig::default(), header_authorizer())
            .with_peer_identity("s2", "mesh-secret"),
    );
    let s1_addr = start_server(&s1).await;
    let s2_addr = start_server(&s2).await;

    s1.add_peer(&format!("ws://{s2_addr}"), "s2", "mesh-secret");
    s2.add_peer(&format!("ws://{s1_addr}"), "s1", "mesh-secret");

    let echo_addr = start_echo().await;

    // Client C attaches to S2 only
    let _client = start_client(s2_addr, "cluster-c");
    wait_for_session(&s2, "cluster-c").await;

    // S1 learns about C through the mesh announcements
    let watching = Arc::clone(&s1);
    eventually(
        move || watching.has_session("cluster-c"),
        "peer announcement of cluster-c",
    )
    .await;

    let mut stream = s1
        .dial(
            "cluster-c",
            Duration::from_secs(2),
            "tcp",
            &echo_addr.to_string(),
        )
        .await
        .expect("dial through the peer must succeed");

    stream.write_all(b"via peer").await.unwrap();
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"via peer");

    stream.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_peer_routing_forwards_token_requests() {
    let s1 = Arc::new(
        Server::new(ServerConfig::default(), header_authorizer())
            .with_peer_identity("s1", "mesh-secret"),
    );
    let s2 = Arc::new(
        Server::new(ServerConfig::default(), header_authorizer())
            .with_peer_identity("s2", "mesh-secret"),
    );
    let s1_addr = start_server(&s1).await;
    let s2_addr = start_server(&s2).await;

    s1.add_peer(&format!("ws://{s2_addr}"), "s2", "mesh-secret");
    s2.add_peer(&format!("ws://{s1_addr}"), "s1", "mesh-secret");

    // Client C with a token source attaches to S2 only
    let config =
        ClientConfig::new(format!("ws://{s2_addr}")).with_header(ID_HEADER, "cluster-c");
    let client = TunnelClient::new(config)
        .with_connect_authorizer(allow_all_connections())
        .with_token_source(TokenSource::new(getter("peer-tk"), getter("peer-ca")));
    tokio::spawn(async move {
        let _ = client.run_once().await;
    });
    wait_for_session(&s2, "cluster-c").await;

    let watching = Arc::clone(&s1);
    eventually(
        move || watching.has_session("cluster-c"),
        "peer announcement of cluster-c",
    )
    .await;

    // The TokenConnect must keep its frame type across the peer hop; a
    // degraded plain Connect would end in a dial failure on the client
    let token = s1
        .get_cluster_token("cluster-c", Duration::from_secs(2))
        .await
        .expect("token fetch through the peer must succeed");
    assert_eq!(token.token, "peer-tk");
    assert_eq!(token.cacert, "peer-ca");
}

// ---------------------------------------------------------------------------
// 5. Data frame for an unknown connection id
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unknown_conn_id_answered_and_session_survives() {
    let server = Arc::new(Server::new(ServerConfig::default(), header_authorizer()));
    let server_addr = start_server(&server).await;

    // Raw WebSocket client speaking the frame protocol directly
    let mut request = format!("ws://{server_addr}").into_client_request().unwrap();
    request
        .headers_mut()
        .insert(ID_HEADER, HeaderValue::from_static("raw-client"));
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    wait_for_session(&server, "raw-client").await;

    ws.send(WsMessage::Binary(
        Message::Data {
            conn_id: 99_999,
            payload: Bytes::from_static(b"stray"),
        }
        .encode(),
    ))
    .await
    .unwrap();

    let reply = loop {
        match ws.next().await.expect("server closed the transport").unwrap() {
            WsMessage::Binary(data) => break Message::decode(&data).unwrap(),
            WsMessage::Ping(payload) => {
                ws.send(WsMessage::Pong(payload)).await.unwrap();
            }
            other => panic!("unexpected transport message: {other:?}"),
        }
    };
    match reply {
        Message::Error { conn_id, reason } => {
            assert_eq!(conn_id, 99_999);
            assert!(
                reason.contains("connection not found"),
                "expected a connection-not-found reply, got: {reason}"
            );
        }
        other => panic!("expected an Error frame, got {other}"),
    }

    // The stray frame must not kill the session
    assert!(server.has_session("raw-client"));
    ws.close(None).await.unwrap();
}

// ---------------------------------------------------------------------------
// 6. Abrupt transport loss
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_abrupt_transport_loss_tears_down_streams() {
    let server = Arc::new(Server::new(ServerConfig::default(), header_authorizer()));
    let server_addr = start_server(&server).await;
    let echo_addr = start_echo().await;

    let client_task = start_client(server_addr, "cluster-b");
    wait_for_session(&server, "cluster-b").await;

    // Three live virtual connections, each verified working
    let mut streams = Vec::new();
    for i in 0..3u8 {
        let mut stream = server
            .dial(
                "cluster-b",
                Duration::from_secs(2),
                "tcp",
                &echo_addr.to_string(),
            )
            .await
            .unwrap();
        stream.write_all(&[i]).await.unwrap();
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], i);
        streams.push(stream);
    }
    assert_eq!(server.active_virtual_connections("cluster-b"), 3);

    // Kill the client's transport mid-stream
    client_task.abort();

    for mut stream in streams {
        let mut buf = [0u8; 4];
        let result = stream.read(&mut buf).await;
        let err = result.expect_err("reads must fail after transport loss");
        assert!(
            err.to_string().contains("tunnel disconnect"),
            "expected a tunnel-disconnect cause, got: {err}"
        );
    }

    let checking = Arc::clone(&server);
    eventually(
        move || !checking.has_session("cluster-b"),
        "session removal after transport loss",
    )
    .await;
    assert_eq!(server.active_virtual_connections("cluster-b"), 0);
}

// ---------------------------------------------------------------------------
// Connect authorization
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_denied_connect_leaves_session_usable() {
    let server = Arc::new(Server::new(ServerConfig::default(), header_authorizer()));
    let server_addr = start_server(&server).await;
    let echo_addr = start_echo().await;

    // Only the echo address is allowed
    let allowed = echo_addr.to_string();
    let config =
        ClientConfig::new(format!("ws://{server_addr}")).with_header(ID_HEADER, "cluster-b");
    let client = TunnelClient::new(config).with_connect_authorizer(Arc::new(
        move |_proto: &str, address: &str| address == allowed,
    ));
    tokio::spawn(async move {
        let _ = client.run_once().await;
    });
    wait_for_session(&server, "cluster-b").await;

    // Denied target: the stream dies with a connect-not-allowed cause
    let mut stream = server
        .dial(
            "cluster-b",
            Duration::from_secs(1),
            "tcp",
            "10.0.0.1:8080",
        )
        .await
        .unwrap();
    let mut buf = [0u8; 4];
    let err = stream.read(&mut buf).await.unwrap_err();
    assert!(
        err.to_string().contains("connect not allowed"),
        "got: {err}"
    );

    // Allowed target still works on the same session
    let mut stream = server
        .dial(
            "cluster-b",
            Duration::from_secs(2),
            "tcp",
            &echo_addr.to_string(),
        )
        .await
        .unwrap();
    stream.write_all(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ok");
    stream.shutdown().await.unwrap();
}
