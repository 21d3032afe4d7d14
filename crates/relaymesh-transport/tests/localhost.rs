//! Integration tests: WsNode listener and dialer on localhost.

use std::time::Duration;

use relaymesh_transport::{ConnId, Route, TransportConfig, TransportEvent, WsNode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

async fn next(node: &mut WsNode) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(10), node.recv())
        .await
        .expect("recv timed out")
        .expect("node dropped")
}

async fn listening_node() -> (WsNode, std::net::SocketAddr) {
    let mut node = WsNode::bind("127.0.0.1:0".parse().unwrap(), TransportConfig::new())
        .await
        .unwrap();
    let addr = match next(&mut node).await {
        TransportEvent::Listening { addr } => addr,
        other => panic!("expected Listening, got {other:?}"),
    };
    (node, addr)
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

/// Dial A → B on /relay, exchange text both ways, close from B.
#[tokio::test]
async fn dial_accept_and_exchange_text() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();

    let (mut server, addr) = listening_node().await;
    let mut client = WsNode::client(TransportConfig::new());

    let out = ConnId::fresh();
    client.dial(out, format!("ws://{addr}/relay?hash=aa&id=bb"));

    assert_eq!(next(&mut client).await, TransportEvent::Opened { conn: out });
    let inbound = match next(&mut server).await {
        TransportEvent::Accepted { conn, route } => {
            assert_eq!(
                route,
                Route::Relay {
                    hash: Some("aa".into()),
                    id: Some("bb".into()),
                }
            );
            conn
        }
        other => panic!("expected Accepted, got {other:?}"),
    };

    client.send(out, "hello".into()).await.unwrap();
    assert_eq!(
        next(&mut server).await,
        TransportEvent::Message {
            conn: inbound,
            text: "hello".into()
        }
    );

    server.send(inbound, "world".into()).await.unwrap();
    assert_eq!(
        next(&mut client).await,
        TransportEvent::Message {
            conn: out,
            text: "world".into()
        }
    );

    server.close(inbound).await;
    assert_eq!(next(&mut client).await, TransportEvent::Closed { conn: out });
    assert_eq!(next(&mut server).await, TransportEvent::Closed { conn: inbound });

    // The handle is gone on both sides now.
    assert!(client.send(out, "late".into()).await.is_err());
}

#[tokio::test]
async fn health_endpoint_and_bad_path() {
    let (_server, addr) = listening_node().await;

    let ok = http_get(addr, "/").await;
    assert!(ok.starts_with("HTTP/1.1 200"), "{ok}");
    assert!(ok.contains("thanks for testing relaymesh"));

    let bad = http_get(addr, "/stats").await;
    assert!(bad.starts_with("HTTP/1.1 400"), "{bad}");
    assert!(bad.contains("invalid method or path"));
}

#[tokio::test]
async fn dial_to_closed_port_fails() {
    let (mut server, addr) = listening_node().await;
    server.pause_listener().await;
    assert_eq!(next(&mut server).await, TransportEvent::ListenerClosed);
    assert!(!server.is_listening());

    let mut client = WsNode::client(TransportConfig::new());
    let conn = ConnId::fresh();
    client.dial(conn, format!("ws://{addr}/signal?hash=t&id=c"));
    match next(&mut client).await {
        TransportEvent::DialFailed { conn: failed, .. } => assert_eq!(failed, conn),
        other => panic!("expected DialFailed, got {other:?}"),
    }

    server.resume_listener().await.unwrap();
    assert_eq!(
        next(&mut server).await,
        TransportEvent::Listening { addr }
    );
}

#[tokio::test]
async fn oversized_send_is_rejected_locally() {
    let client = WsNode::client(TransportConfig::new().max_message_size(8));
    let err = client
        .send(ConnId::fresh(), "0123456789".into())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("message too large"));
}

/// A peer that never reads fills its queue; the next send fails at once and
/// the connection is dropped instead of blocking the caller.
#[tokio::test]
async fn peer_that_never_reads_is_dropped() {
    let config = TransportConfig::new().max_message_size(1024 * 1024).send_buffer(4);
    let mut server = WsNode::bind("127.0.0.1:0".parse().unwrap(), config)
        .await
        .unwrap();
    let addr = match next(&mut server).await {
        TransportEvent::Listening { addr } => addr,
        other => panic!("expected Listening, got {other:?}"),
    };

    let (_silent, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/relay?hash=aa&id=bb"))
        .await
        .unwrap();
    let inbound = match next(&mut server).await {
        TransportEvent::Accepted { conn, .. } => conn,
        other => panic!("expected Accepted, got {other:?}"),
    };

    let chunk = "x".repeat(256 * 1024);
    let failed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Err(e) = server.send(inbound, chunk.clone()).await {
                break e;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("send kept blocking on a peer that never reads");
    assert!(failed.to_string().contains("not reading"), "{failed}");

    assert_eq!(next(&mut server).await, TransportEvent::Closed { conn: inbound });
    assert!(server.send(inbound, "late".into()).await.is_err());
}
