mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use common::{within, Peer, ScriptedTransport};
use wslink::connection::state::is_valid_transition;
use wslink::{
    CloseInfo, ConnectionManager, ConnectionState, DecodeMode, Inbound, Outbound, TransportError,
};

const ADDRESS: &str = "ws://localhost:8081/ws-match";

fn setup() -> (ConnectionManager, mpsc::UnboundedReceiver<Peer>) {
    let (transport, peers) = ScriptedTransport::new();
    let manager = ConnectionManager::builder(Arc::new(transport))
        .close_timeout(Duration::from_millis(200))
        .build();
    (manager, peers)
}

/// Connect and complete the handshake
async fn open(manager: &ConnectionManager, peers: &mut mpsc::UnboundedReceiver<Peer>) -> Peer {
    let mut status = manager.status();
    manager.connect(ADDRESS);
    let mut peer = within(peers.recv()).await.expect("no connection attempt");
    peer.accept();
    loop {
        if within(status.next()).await == Some(ConnectionState::Open) {
            break;
        }
    }
    peer
}

#[tokio::test]
async fn test_connect_send_receive_close() {
    let (manager, mut peers) = setup();
    let mut status = manager.status();
    let mut raw = manager.raw_messages();
    let mut decoded = manager.decoded_messages();

    assert_eq!(within(status.next()).await, Some(ConnectionState::Closed));

    manager.connect(ADDRESS);
    assert_eq!(within(status.next()).await, Some(ConnectionState::Connecting));

    let mut peer = within(peers.recv()).await.unwrap();
    assert_eq!(peer.address, ADDRESS);
    peer.accept();
    assert_eq!(within(status.next()).await, Some(ConnectionState::Open));

    manager.send(json!({ "idBatch": "12345" }));
    assert_eq!(
        peer.next_outbound().await,
        Some(Outbound::Text(r#"{"idBatch":"12345"}"#.to_string()))
    );

    peer.text(r#"{"event":"done"}"#);
    assert_eq!(within(raw.next()).await.as_deref(), Some(r#"{"event":"done"}"#));
    assert_eq!(within(decoded.next()).await, Some(json!({ "event": "done" })));

    peer.text("not-json");
    assert_eq!(within(raw.next()).await.as_deref(), Some("not-json"));

    peer.text(r#"{"event":"next"}"#);
    assert_eq!(within(raw.next()).await.as_deref(), Some(r#"{"event":"next"}"#));
    // nothing was published for "not-json"
    assert_eq!(within(decoded.next()).await, Some(json!({ "event": "next" })));

    manager.close();
    assert_eq!(status.try_next(), Some(ConnectionState::Closed));
    assert_eq!(
        peer.next_outbound().await,
        Some(Outbound::Close(CloseInfo::normal("Client closing")))
    );

    manager.send(json!({ "idBatch": "12345" }));
    assert_eq!(manager.dropped_sends(), 1);

    peer.hang_up();
    assert_eq!(peer.next_outbound().await, None);
    assert_eq!(manager.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_send_while_connecting_is_dropped() {
    let (manager, mut peers) = setup();
    let mut status = manager.status();

    manager.connect(ADDRESS);
    let mut peer = within(peers.recv()).await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connecting);

    manager.send("too early");
    assert_eq!(manager.dropped_sends(), 1);

    peer.accept();
    while within(status.next()).await != Some(ConnectionState::Open) {}

    manager.send("on time");
    assert_eq!(
        peer.next_outbound().await,
        Some(Outbound::Text("on time".to_string()))
    );
    assert_eq!(manager.dropped_sends(), 1);
}

#[tokio::test]
async fn test_rejected_handshake_returns_to_closed() {
    let (manager, mut peers) = setup();

    manager.connect(ADDRESS);
    let mut status = manager.status();
    assert_eq!(within(status.next()).await, Some(ConnectionState::Connecting));

    let mut peer = within(peers.recv()).await.unwrap();
    peer.reject(TransportError::Connect("connection refused".to_string()));

    assert_eq!(within(status.next()).await, Some(ConnectionState::Closed));
    assert_eq!(manager.connection_attempts(), 1);
}

#[tokio::test]
async fn test_connect_timeout_returns_to_closed() {
    let (transport, mut peers) = ScriptedTransport::new();
    let manager = ConnectionManager::builder(Arc::new(transport))
        .connect_timeout(Duration::from_millis(50))
        .build();

    manager.connect(ADDRESS);
    let mut status = manager.status();
    // keep the peer alive so the handshake hangs
    let _peer = within(peers.recv()).await.unwrap();

    assert_eq!(within(status.next()).await, Some(ConnectionState::Connecting));
    assert_eq!(within(status.next()).await, Some(ConnectionState::Closed));
}

#[tokio::test]
async fn test_peer_close_frame_moves_to_closed() {
    let (manager, mut peers) = setup();
    let peer = open(&manager, &mut peers).await;
    let mut status = manager.status();
    assert_eq!(status.try_next(), Some(ConnectionState::Open));

    peer.inbound
        .send(Ok(Inbound::Close(Some(CloseInfo {
            code: 1001,
            reason: "going away".to_string(),
        }))))
        .unwrap();

    assert_eq!(within(status.next()).await, Some(ConnectionState::Closed));
    let last = &manager.recent_transitions(1)[0];
    assert_eq!(last.to, ConnectionState::Closed);
    assert!(last.reason.as_deref().unwrap_or_default().contains("1001"));

    manager.send("after close");
    assert_eq!(manager.dropped_sends(), 1);
}

#[tokio::test]
async fn test_stream_end_moves_to_closed() {
    let (manager, mut peers) = setup();
    let mut peer = open(&manager, &mut peers).await;
    let mut status = manager.status();
    assert_eq!(status.try_next(), Some(ConnectionState::Open));

    peer.hang_up();
    assert_eq!(within(status.next()).await, Some(ConnectionState::Closed));
}

#[tokio::test]
async fn test_transport_error_leads_to_closed() {
    let (manager, mut peers) = setup();
    let peer = open(&manager, &mut peers).await;
    let mut status = manager.status();
    assert_eq!(status.try_next(), Some(ConnectionState::Open));

    peer.inbound.send(Err(TransportError::Closed)).unwrap();
    assert_eq!(within(status.next()).await, Some(ConnectionState::Closed));
}

#[tokio::test]
async fn test_reconnect_supersedes_previous_connection() {
    let (manager, mut peers) = setup();
    let mut raw = manager.raw_messages();
    let mut first = open(&manager, &mut peers).await;
    let mut status = manager.status();
    assert_eq!(status.try_next(), Some(ConnectionState::Open));

    manager.connect("ws://localhost:8081/ws-transactions");
    assert_eq!(status.try_next(), Some(ConnectionState::Closed));
    assert_eq!(status.try_next(), Some(ConnectionState::Connecting));
    assert_eq!(
        first.next_outbound().await,
        Some(Outbound::Close(CloseInfo::normal("Client closing")))
    );

    let _ = first.inbound.send(Ok(Inbound::Text("stale".to_string())));

    let mut second = within(peers.recv()).await.unwrap();
    assert_eq!(second.address, "ws://localhost:8081/ws-transactions");
    second.accept();
    assert_eq!(within(status.next()).await, Some(ConnectionState::Open));

    second.text("fresh");
    assert_eq!(within(raw.next()).await.as_deref(), Some("fresh"));

    first.hang_up();
    assert_eq!(first.next_outbound().await, None);
    assert_eq!(manager.state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_close_while_connecting_sends_no_close_frame() {
    let (manager, mut peers) = setup();

    manager.connect(ADDRESS);
    let mut peer = within(peers.recv()).await.unwrap();

    manager.close();
    assert_eq!(manager.state(), ConnectionState::Closed);

    // the pending attempt is abandoned without any frame
    assert_eq!(peer.next_outbound().await, None);
    peer.accept();
    tokio::task::yield_now().await;
    assert_eq!(manager.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_binary_frames_are_published_as_text() {
    let (manager, mut peers) = setup();
    let mut raw = manager.raw_messages();
    let mut decoded = manager.decoded_messages();
    let peer = open(&manager, &mut peers).await;

    peer.binary(br#"{"event":"done"}"#);
    assert_eq!(within(raw.next()).await.as_deref(), Some(r#"{"event":"done"}"#));
    assert_eq!(within(decoded.next()).await, Some(json!({ "event": "done" })));
}

#[tokio::test]
async fn test_late_subscriber_sees_only_new_messages() {
    let (manager, mut peers) = setup();
    let mut early = manager.raw_messages();
    let peer = open(&manager, &mut peers).await;

    peer.text("first");
    assert_eq!(within(early.next()).await.as_deref(), Some("first"));

    let mut late = manager.raw_messages();
    peer.text("second");
    assert_eq!(within(late.next()).await.as_deref(), Some("second"));
    assert_eq!(within(early.next()).await.as_deref(), Some("second"));
}

#[tokio::test]
async fn test_status_only_follows_valid_edges() {
    let (manager, mut peers) = setup();
    let mut status = manager.status();

    let _first = open(&manager, &mut peers).await;
    manager.close();
    manager.close();
    manager.connect(ADDRESS);
    let mut second = within(peers.recv()).await.unwrap();
    second.accept();
    within(async {
        while manager.state() != ConnectionState::Open {
            tokio::task::yield_now().await;
        }
    })
    .await;
    manager.connect(ADDRESS);
    manager.close();
    manager.dispose();

    let mut observed = Vec::new();
    while let Some(state) = within(status.next()).await {
        observed.push(state);
    }

    assert_eq!(observed.first(), Some(&ConnectionState::Closed));
    assert_eq!(observed.last(), Some(&ConnectionState::Closed));
    for pair in observed.windows(2) {
        assert!(
            is_valid_transition(pair[0], pair[1]),
            "invalid edge {:?} -> {:?}",
            pair[0],
            pair[1]
        );
    }
}

#[tokio::test]
async fn test_dispose_completes_streams() {
    let (manager, mut peers) = setup();
    let mut status = manager.status();
    let mut raw = manager.raw_messages();
    let mut decoded = manager.decoded_messages();
    let mut peer = open(&manager, &mut peers).await;

    manager.dispose();
    manager.dispose();

    assert_eq!(
        peer.next_outbound().await,
        Some(Outbound::Close(CloseInfo::normal("Client closing")))
    );

    let mut last = None;
    while let Some(state) = within(status.next()).await {
        last = Some(state);
    }
    assert_eq!(last, Some(ConnectionState::Closed));
    assert_eq!(within(raw.next()).await, None);
    assert_eq!(within(decoded.next()).await, None);

    assert_eq!(within(manager.status().next()).await, None);
    assert_eq!(within(manager.raw_messages().next()).await, None);
    assert_eq!(within(manager.decoded_messages().next()).await, None);

    manager.connect(ADDRESS);
    tokio::task::yield_now().await;
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert!(peers.try_recv().is_err());
}

#[tokio::test]
async fn test_strict_mode_skips_loose_json() {
    let (transport, mut peers) = ScriptedTransport::new();
    let manager = ConnectionManager::builder(Arc::new(transport))
        .decode_mode(DecodeMode::Strict)
        .build();
    let mut raw = manager.raw_messages();
    let mut decoded = manager.decoded_messages();
    let peer = open(&manager, &mut peers).await;

    peer.text("{ code : '200' }");
    peer.text(r#"{"code":"200"}"#);

    assert_eq!(within(raw.next()).await.as_deref(), Some("{ code : '200' }"));
    assert_eq!(within(raw.next()).await.as_deref(), Some(r#"{"code":"200"}"#));
    assert_eq!(within(decoded.next()).await, Some(json!({ "code": "200" })));
}

#[tokio::test]
async fn test_lenient_mode_normalizes_fields() {
    let (manager, mut peers) = setup();
    let mut decoded = manager.decoded_messages();
    let peer = open(&manager, &mut peers).await;

    peer.text("{ code : '500', totalMatch: '3', idbatch: '12345' }");
    assert_eq!(
        within(decoded.next()).await,
        Some(json!({ "code": 500, "totalMatch": 3, "idbatch": "12345", "idBatch": "12345" }))
    );
}

#[tokio::test]
async fn test_shutdown_waits_for_closing_handshake() {
    let (manager, mut peers) = setup();
    let mut peer = open(&manager, &mut peers).await;

    let far_end = tokio::spawn(async move {
        let mut received = Vec::new();
        while let Some(frame) = peer.outbound.recv().await {
            let is_close = matches!(frame, Outbound::Close(_));
            received.push(frame);
            if is_close {
                peer.inbound
                    .send(Ok(Inbound::Close(Some(CloseInfo::normal("ack")))))
                    .ok();
            }
        }
        received
    });

    manager.send("bye");
    within(manager.shutdown()).await;
    assert!(manager.is_disposed());

    let received = within(far_end).await.unwrap();
    assert_eq!(
        received,
        vec![
            Outbound::Text("bye".to_string()),
            Outbound::Close(CloseInfo::normal("Client closing")),
        ]
    );
}

#[tokio::test]
async fn test_transition_history() {
    let (manager, mut peers) = setup();
    let _peer = open(&manager, &mut peers).await;
    manager.close();

    let history = manager.recent_transitions(10);
    let edges: Vec<_> = history.iter().map(|t| (t.from, t.to)).collect();
    assert_eq!(
        edges,
        vec![
            (ConnectionState::Open, ConnectionState::Closed),
            (ConnectionState::Connecting, ConnectionState::Open),
            (ConnectionState::Closed, ConnectionState::Connecting),
        ]
    );
    assert_eq!(manager.connection_attempts(), 0);
}
