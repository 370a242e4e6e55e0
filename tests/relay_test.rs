// Relay tests over a real socket.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use proctor_session::config::SignalingConfig;
use proctor_session::model::Role;
use proctor_session::peer::{
    CallControl, CallEvent, CallMetadata, IdentityEvent, SignalingBackend, SignalingIdentity,
    WebRtcSignaling,
};
use proctor_session::relay::{self, RelayHub};
use proctor_session::testing::test_stream;
use proctor_session::{Config, ProctorError};
use serde_json::{json, Value};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn start_relay() -> SocketAddr {
    let hub = Arc::new(RelayHub::new());
    let routes = relay::routes(hub, &Config::default());
    let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

async fn connect(addr: SocketAddr, id: &str) -> WsStream {
    let url = format!("ws://{}/signal/{}", addr, id);
    let (ws, _) = connect_async(&url).await.expect("relay should accept connections");
    ws
}

async fn next_json(ws: &mut WsStream) -> Value {
    loop {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for relay")
            .expect("relay closed the connection")
            .expect("websocket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("relay sends JSON");
        }
    }
}

fn signaling(addr: SocketAddr) -> WebRtcSignaling {
    let config = SignalingConfig {
        url: format!("ws://{}/signal", addr),
        stun_servers: vec![],
        turn_servers: vec![],
    };
    WebRtcSignaling::new(&config).unwrap()
}

#[tokio::test]
async fn test_identity_open_and_duplicate_rejected() {
    let addr = start_relay().await;

    let mut first = connect(addr, "s1").await;
    let opened = next_json(&mut first).await;
    assert_eq!(opened["type"], "Open");
    assert_eq!(opened["id"], "s1");

    let mut second = connect(addr, "s1").await;
    let refused = next_json(&mut second).await;
    assert_eq!(refused["type"], "IdTaken");
}

#[tokio::test]
async fn test_messages_routed_and_sender_stamped() {
    let addr = start_relay().await;
    let mut student = connect(addr, "s1").await;
    let mut proctor = connect(addr, "p1").await;
    next_json(&mut student).await;
    next_json(&mut proctor).await;

    let hangup = json!({ "type": "Hangup", "from": "spoofed", "to": "p1", "call_id": "mc_1" });
    student
        .send(Message::Text(hangup.to_string()))
        .await
        .unwrap();

    let routed = next_json(&mut proctor).await;
    assert_eq!(routed["type"], "Hangup");
    assert_eq!(routed["from"], "s1");
    assert_eq!(routed["call_id"], "mc_1");
}

#[tokio::test]
async fn test_offline_peer_reported_to_sender() {
    let addr = start_relay().await;
    let mut student = connect(addr, "s1").await;
    next_json(&mut student).await;

    let hangup = json!({ "type": "Hangup", "to": "nobody", "call_id": "mc_2" });
    student
        .send(Message::Text(hangup.to_string()))
        .await
        .unwrap();

    let reply = next_json(&mut student).await;
    assert_eq!(reply["type"], "PeerUnavailable");
    assert_eq!(reply["peer_id"], "nobody");
    assert_eq!(reply["call_id"], "mc_2");
}

#[tokio::test]
async fn test_health_counts_identities() {
    let addr = start_relay().await;
    let mut student = connect(addr, "s1").await;
    next_json(&mut student).await;

    let body: Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["identities"], 1);
}

#[tokio::test]
async fn test_webrtc_identity_rejects_duplicate_id() {
    let addr = start_relay().await;
    let backend = signaling(addr);

    let (identity, mut events) = backend.open_identity("s1").await.unwrap();
    assert_eq!(identity.id(), "s1");
    assert!(matches!(events.recv().await, Some(IdentityEvent::Open)));

    let err = backend.open_identity("s1").await.err().unwrap();
    assert!(matches!(err, ProctorError::IdentityTaken(id) if id == "s1"));

    identity.destroy().await;
}

#[tokio::test]
async fn test_webrtc_offer_reaches_callee_and_hangup_closes() {
    let addr = start_relay().await;
    let backend = signaling(addr);

    let (student, mut student_events) = backend.open_identity("s1").await.unwrap();
    let (proctor, mut proctor_events) = backend.open_identity("p1").await.unwrap();
    assert!(matches!(student_events.recv().await, Some(IdentityEvent::Open)));
    assert!(matches!(proctor_events.recv().await, Some(IdentityEvent::Open)));

    let metadata = CallMetadata {
        id: "s1".to_string(),
        role: Role::Student,
        course_id: "c1".to_string(),
    };
    let outbound = student
        .call("p1", &test_stream("s1"), metadata.clone())
        .await
        .unwrap();

    let inbound = loop {
        match timeout(WAIT, proctor_events.recv()).await.unwrap() {
            Some(IdentityEvent::Call(call)) => break call,
            Some(_) => continue,
            None => panic!("proctor identity closed"),
        }
    };
    assert_eq!(inbound.peer_id, "s1");
    assert_eq!(inbound.call_id, outbound.call_id);
    assert_eq!(inbound.metadata, Some(metadata));

    inbound.control.answer(&test_stream("p1")).await.unwrap();
    outbound.control.close().await;

    let mut inbound_events = inbound.events;
    let closed = loop {
        match timeout(WAIT, inbound_events.recv()).await.unwrap() {
            Some(CallEvent::Close) => break true,
            Some(_) => continue,
            None => break false,
        }
    };
    assert!(closed);

    student.destroy().await;
    proctor.destroy().await;
}
