//! Tests for the Client against a raw transport peer.

use std::time::Duration;

use mitrorpc::CallFrame;
use mitrorpc::FailureReason;
use mitrorpc::ReplyFrame;
use mitrorpc::RpcFrame;
use rand::seq::SliceRandom;
use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;

use crate::client::Client;
use crate::client::ClientOptions;
use crate::client::Error;
use crate::registry;
use crate::transport;
use crate::transport::DuplexChannelTransport;
use crate::transport::Transport;

/// A client named "extension" plus the raw other end of its channel.
fn client_and_peer(options: ClientOptions) -> (Client, DuplexChannelTransport) {
    let (page_side, peer) = DuplexChannelTransport::pair();
    let client = Client::with_options("extension", Box::new(page_side), options);
    (client, peer)
}

async fn next_call(peer: &DuplexChannelTransport) -> CallFrame {
    let bytes = tokio::time::timeout(Duration::from_secs(1), peer.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("recv failed")
        .expect("channel closed");
    match RpcFrame::decode(&bytes).expect("decode") {
        RpcFrame::Call(call) => call,
        RpcFrame::Reply(reply) => panic!("expected a call, got reply {}", reply.seq),
    }
}

async fn assert_silent(peer: &DuplexChannelTransport) {
    let res = tokio::time::timeout(Duration::from_millis(50), peer.recv()).await;
    assert!(res.is_err(), "expected no outbound frame");
}

async fn reply(peer: &DuplexChannelTransport, reply: ReplyFrame) {
    let bytes = RpcFrame::from(reply).encode().expect("encode");
    peer.send(&bytes).await.expect("send");
}

// --- registration ---

#[tokio::test]
async fn test_registered_call_sends_one_frame_to_target() {
    let (client, peer) = client_and_peer(ClientOptions::default());
    client.init_remote_calls("background", ["addSecret"]).unwrap();

    let pending = client.call("addSecret", vec![json!({}), json!({"title": "bank"})]).unwrap();
    let call = next_call(&peer).await;

    assert_eq!(call.seq, pending.seq());
    assert_eq!(call.client, "extension");
    assert_eq!(call.target, "background");
    assert_eq!(call.method, "addSecret");
    assert_eq!(call.args[1]["title"], "bank");
    assert!(call.reply);
    assert_silent(&peer).await;
}

#[tokio::test]
async fn test_unregistered_call_fails_locally() {
    let (client, peer) = client_and_peer(ClientOptions::default());
    client.init_remote_calls("background", ["addSecret"]).unwrap();

    assert!(matches!(client.call("deleteSecret", vec![]), Err(Error::Unregistered(name)) if name == "deleteSecret"));
    assert!(matches!(client.emit("deleteSecret", vec![]), Err(Error::Unregistered(_))));
    assert!(client.remote("deleteSecret").is_err());
    assert_eq!(client.pending_count(), 0);
    assert_silent(&peer).await;
}

#[tokio::test]
async fn test_conflicting_registration_is_configuration_error() {
    let (client, _peer) = client_and_peer(ClientOptions::default());
    client.init_remote_calls("background", ["addSecret"]).unwrap();
    client.init_remote_calls("background", ["addSecret"]).unwrap();

    let err = client.init_remote_calls("popup", ["addSecret"]).unwrap_err();
    assert!(matches!(err, Error::Configuration(registry::Error::Conflict { .. })));
    assert!(err.to_string().starts_with("Configuration error"));
}

#[tokio::test]
async fn test_set_location_reports_in_order() {
    let (client, peer) = client_and_peer(ClientOptions::default());
    client
        .init_remote_calls("background", ["reportSetLocationSuccess", "reportExtensionFinished"])
        .unwrap();

    let first = client.emit("reportSetLocationSuccess", vec![]).unwrap();
    let second = client.emit("reportExtensionFinished", vec![]).unwrap();
    assert_ne!(first, second);

    let a = next_call(&peer).await;
    let b = next_call(&peer).await;
    assert_eq!((a.method.as_str(), a.seq), ("reportSetLocationSuccess", first));
    assert_eq!((b.method.as_str(), b.seq), ("reportExtensionFinished", second));
    for call in [&a, &b] {
        assert_eq!(call.client, "extension");
        assert_eq!(call.target, "background");
        assert!(!call.reply);
    }
    assert_eq!(client.pending_count(), 0, "one-way calls are not tracked");
}

// --- replies ---

#[tokio::test]
async fn test_concurrent_calls_get_their_own_results() {
    let (client, peer) = client_and_peer(ClientOptions::default());
    client.init_remote_calls("background", ["addSecret"]).unwrap();

    let one = client.call("addSecret", vec![json!("one")]).unwrap();
    let two = client.call("addSecret", vec![json!("two")]).unwrap();
    assert_ne!(one.seq(), two.seq());

    let call_one = next_call(&peer).await;
    let call_two = next_call(&peer).await;

    // answer in reverse order
    reply(&peer, ReplyFrame::ok(call_two.seq, "extension", json!("secret-2"))).await;
    reply(&peer, ReplyFrame::ok(call_one.seq, "extension", json!("secret-1"))).await;

    assert_eq!(one.wait().await.unwrap(), json!("secret-1"));
    assert_eq!(two.wait().await.unwrap(), json!("secret-2"));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_shuffled_replies_match_their_calls() {
    let (client, peer) = client_and_peer(ClientOptions::default());
    client.init_remote_calls("background", ["echo"]).unwrap();

    let pending: Vec<_> = (0..32)
        .map(|i| client.call("echo", vec![json!(i)]).unwrap())
        .collect();

    let mut calls = Vec::new();
    for _ in 0..pending.len() {
        calls.push(next_call(&peer).await);
    }
    calls.shuffle(&mut rand::thread_rng());
    for call in calls {
        reply(&peer, ReplyFrame::ok(call.seq, "extension", call.args[0].clone())).await;
    }

    for (i, call) in pending.into_iter().enumerate() {
        assert_eq!(call.wait().await.unwrap(), json!(i));
    }
}

#[tokio::test]
async fn test_remote_failure_is_surfaced() {
    let (client, peer) = client_and_peer(ClientOptions::default());
    client.init_remote_calls("background", ["editSiteShares"]).unwrap();

    let pending = client.remote("editSiteShares").unwrap().call(vec![]).unwrap();
    let call = next_call(&peer).await;
    reply(&peer, ReplyFrame::err(call.seq, "extension", FailureReason::Failed("no such org".into()))).await;

    let err = pending.wait().await.unwrap_err();
    assert!(matches!(err, Error::Remote(FailureReason::Failed(msg)) if msg == "no such org"));
}

#[tokio::test]
async fn test_call_with_runs_callbacks() {
    let (client, peer) = client_and_peer(ClientOptions::default());
    client.init_remote_calls("background", ["loadOrganizationInfo"]).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let ok_tx = tx.clone();
    client
        .call_with(
            "loadOrganizationInfo",
            vec![],
            move |value| { let _ = ok_tx.send(Ok(value)); },
            move |err| { let _ = tx.send(Err(err.to_string())); },
        )
        .unwrap();
    let call = next_call(&peer).await;
    reply(&peer, ReplyFrame::ok(call.seq, "extension", json!({"organizations": []}))).await;

    let outcome = rx.recv().await.expect("callback");
    assert_eq!(outcome, Ok(json!({"organizations": []})));
}

#[tokio::test]
async fn test_reply_for_other_client_is_ignored() {
    let options = ClientOptions { call_timeout: Duration::from_millis(100) };
    let (client, peer) = client_and_peer(options);
    client.init_remote_calls("background", ["addSecret"]).unwrap();

    let pending = client.call("addSecret", vec![]).unwrap();
    let call = next_call(&peer).await;
    reply(&peer, ReplyFrame::ok(call.seq, "popup", json!("stolen"))).await;

    assert!(matches!(pending.wait().await, Err(Error::Timeout)));
}

// --- abandonment ---

#[tokio::test]
async fn test_timeout_abandons_pending_call() {
    let options = ClientOptions { call_timeout: Duration::from_millis(50) };
    let (client, peer) = client_and_peer(options);
    client.init_remote_calls("background", ["addSecret"]).unwrap();

    let pending = client.call("addSecret", vec![]).unwrap();
    assert_eq!(client.pending_count(), 1);
    let call = next_call(&peer).await;

    assert!(matches!(pending.wait().await, Err(Error::Timeout)));
    assert_eq!(client.pending_count(), 0);

    // a late reply finds nothing to complete and the client keeps working
    reply(&peer, ReplyFrame::ok(call.seq, "extension", json!("late"))).await;
    let next = client.call("addSecret", vec![]).unwrap();
    let call = next_call(&peer).await;
    reply(&peer, ReplyFrame::ok(call.seq, "extension", json!("fresh"))).await;
    assert_eq!(next.wait().await.unwrap(), json!("fresh"));
}

#[tokio::test]
async fn test_dropping_handle_abandons_call() {
    let (client, _peer) = client_and_peer(ClientOptions::default());
    client.init_remote_calls("background", ["addSecret"]).unwrap();

    let pending = client.call("addSecret", vec![]).unwrap();
    assert_eq!(client.pending_count(), 1);
    drop(pending);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_teardown_fails_pending_calls() {
    let (client, peer) = client_and_peer(ClientOptions::default());
    client.init_remote_calls("background", ["addSecret", "reportExtensionFinished"]).unwrap();

    let first = client.call("addSecret", vec![]).unwrap();
    let second = client.call("addSecret", vec![]).unwrap();
    drop(peer);

    for pending in [first, second] {
        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, Error::Transport(transport::Error::ConnectionLost(_))), "got {}", err);
    }

    while !client.is_closed() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(matches!(client.call("addSecret", vec![]), Err(Error::ChannelClosed)));
    assert!(matches!(client.emit("reportExtensionFinished", vec![]), Err(Error::ChannelClosed)));
}

#[tokio::test]
async fn test_deadline_runs_from_issue() {
    let options = ClientOptions { call_timeout: Duration::from_millis(50) };
    let (client, peer) = client_and_peer(options);
    client.init_remote_calls("background", ["addSecret"]).unwrap();

    let pending = client.call("addSecret", vec![]).unwrap();
    next_call(&peer).await;
    tokio::time::sleep(Duration::from_millis(80)).await;

    // the deadline already passed while the handle sat unawaited
    let res = tokio::time::timeout(Duration::from_millis(20), pending.wait()).await;
    assert!(matches!(res, Ok(Err(Error::Timeout))));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_close_ends_channel_and_fails_pending() {
    let (client, peer) = client_and_peer(ClientOptions::default());
    client.init_remote_calls("background", ["addSecret"]).unwrap();

    let pending = client.call("addSecret", vec![]).unwrap();
    next_call(&peer).await;
    client.close();

    assert!(client.is_closed());
    assert!(matches!(client.call("addSecret", vec![]), Err(Error::ChannelClosed)));
    let err = pending.wait().await.unwrap_err();
    assert!(matches!(err, Error::Transport(transport::Error::ConnectionLost(_))), "got {}", err);

    let end = tokio::time::timeout(Duration::from_secs(1), peer.recv()).await.unwrap().unwrap();
    assert_eq!(end, None);
}

#[tokio::test]
async fn test_dropping_last_client_releases_channel() {
    let (client, peer) = client_and_peer(ClientOptions::default());
    client.init_remote_calls("background", ["addSecret", "reportExtensionFinished"]).unwrap();

    let pending = client.call("addSecret", vec![]).unwrap();
    client.emit("reportExtensionFinished", vec![]).unwrap();
    let other = client.clone();
    drop(client);
    assert!(!other.is_closed(), "a clone keeps the client alive");
    drop(other);

    assert!(matches!(pending.wait().await, Err(Error::ChannelClosed)));

    // queued frames still go out before the peer sees the end
    assert_eq!(next_call(&peer).await.method, "addSecret");
    assert_eq!(next_call(&peer).await.method, "reportExtensionFinished");
    let end = tokio::time::timeout(Duration::from_secs(1), peer.recv()).await.unwrap().unwrap();
    assert_eq!(end, None);
}

/// Transport whose sends always fail.
struct BrokenTransport;

#[async_trait::async_trait]
impl Transport for BrokenTransport {
    async fn send(&self, _payload: &[u8]) -> transport::Result<()> {
        Err(transport::Error::Io("pipe broke".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_send_failure_fails_that_call() {
    let client = Client::new("extension", Box::new(BrokenTransport));
    client.init_remote_calls("background", ["addSecret"]).unwrap();

    let err = client.call("addSecret", vec![]).unwrap().wait().await.unwrap_err();
    assert!(matches!(err, Error::Transport(transport::Error::Io(_))));
    assert_eq!(client.pending_count(), 0);
}

// --- events ---

#[tokio::test]
async fn test_events_reach_handlers() {
    let (client, peer) = client_and_peer(ClientOptions::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on("secretsChanged", move |args: Vec<Value>| {
        let _ = tx.send(args);
    });

    let unknown = CallFrame::new(1, "background", "extension", "somethingElse", vec![]).one_way();
    let misaddressed = CallFrame::new(2, "background", "popup", "secretsChanged", vec![json!("nope")]).one_way();
    let event = CallFrame::new(3, "background", "extension", "secretsChanged", vec![json!(41)]).one_way();
    for frame in [unknown, misaddressed, event] {
        peer.send(&RpcFrame::from(frame).encode().unwrap()).await.unwrap();
    }
    peer.send(b"not a frame").await.unwrap();

    let args = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(args, vec![json!(41)]);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_panicking_handler_keeps_pump_alive() {
    let (client, peer) = client_and_peer(ClientOptions::default());
    client.init_remote_calls("background", ["addSecret"]).unwrap();
    client.on("secretsChanged", |_args| panic!("handler bug"));

    let event = CallFrame::new(1, "background", "extension", "secretsChanged", vec![]).one_way();
    peer.send(&RpcFrame::from(event).encode().unwrap()).await.unwrap();

    let pending = client.call("addSecret", vec![]).unwrap();
    let call = next_call(&peer).await;
    reply(&peer, ReplyFrame::ok(call.seq, "extension", json!("still here"))).await;

    assert_eq!(pending.wait().await.unwrap(), json!("still here"));
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_clients_share_state() {
    let (client, peer) = client_and_peer(ClientOptions::default());
    let other = client.clone();
    other.init_remote_calls("background", ["addSecret"]).unwrap();

    let seqs: Vec<u64> = vec![
        client.emit("addSecret", vec![]).unwrap(),
        other.emit("addSecret", vec![]).unwrap(),
    ];
    assert_eq!(seqs, vec![1, 2]);
    assert_eq!(next_call(&peer).await.seq, 1);
    assert_eq!(next_call(&peer).await.seq, 2);
}
