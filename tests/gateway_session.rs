//! GatewaySession against an in-process mock gateway

use flate2::{Compress, Compression, FlushCompress};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use shardwire::config::{HttpConfig, ReconnectPolicy, SessionConfig};
use shardwire::events::{DispatchEvent, EventFilter};
use shardwire::gateway::session::{GatewaySession, ShardInfo};
use shardwire::gateway::{ConnectionState, IdentifyQueue, PresenceUpdate, ShardState};
use shardwire::metrics::GatewayMetrics;
use shardwire::{Context, GatewayError};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);

type ServerSocket = WebSocketStream<TcpStream>;

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    accept_async(stream).await.unwrap()
}

async fn send(ws: &mut ServerSocket, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Next JSON frame from the client, skipping heartbeats
async fn recv_json(ws: &mut ServerSocket) -> Value {
    loop {
        let frame = timeout(WAIT, ws.next()).await.unwrap();
        match frame {
            Some(Ok(Message::Text(text))) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value["op"] != 1 {
                    return value;
                }
            }
            Some(Ok(_)) => continue,
            other => panic!("client frame expected, got {other:?}"),
        }
    }
}

async fn next_event(events: &mut UnboundedReceiver<Arc<DispatchEvent>>) -> Arc<DispatchEvent> {
    timeout(WAIT, events.recv()).await.unwrap().unwrap()
}

fn hello() -> Value {
    json!({ "op": 10, "d": { "heartbeat_interval": 45000 } })
}

fn ready(seq: u64) -> Value {
    json!({
        "op": 0, "t": "READY", "s": seq,
        "d": { "session_id": "abc", "user": { "id": "42" }, "guilds": [{ "id": "1" }, { "id": "2" }] }
    })
}

fn message_create(seq: u64) -> Value {
    json!({ "op": 0, "t": "MESSAGE_CREATE", "s": seq, "d": { "id": "9", "content": "hi" } })
}

fn config() -> SessionConfig {
    SessionConfig {
        token: "token".to_string(),
        api_version: 10,
        compress: false,
        large_threshold: 250,
        reconnect: ReconnectPolicy {
            connect_retry_pause: Duration::from_millis(10),
            initial_backoff: Duration::from_millis(10),
            invalid_session_jitter: false,
            ..ReconnectPolicy::default()
        },
    }
}

fn context() -> Context {
    Context::new(HttpConfig::new("token"), Arc::new(GatewayMetrics::disabled())).unwrap()
}

fn identify() -> Arc<IdentifyQueue> {
    Arc::new(IdentifyQueue::default())
}

/// One message on a shared zlib stream, ending in a sync flush
fn compress_message(compressor: &mut Compress, value: Value) -> Vec<u8> {
    let text = value.to_string();
    let mut out = Vec::with_capacity(text.len() * 2 + 128);
    compressor
        .compress_vec(text.as_bytes(), &mut out, FlushCompress::Sync)
        .unwrap();
    out
}

/// Close code the client ends this connection with
async fn recv_close_code(ws: &mut ServerSocket) -> Option<u16> {
    loop {
        match timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            other => panic!("close frame expected, got {other:?}"),
        }
    }
}

fn shard_zero() -> ShardInfo {
    ShardInfo { id: 0, total: 1 }
}

#[tokio::test]
async fn identifies_and_forwards_dispatches() {
    let (listener, url) = bind().await;
    let ctx = context();
    let mut events = ctx.events.subscribe_channel(EventFilter::All);
    let state = ShardState::new([0].into_iter(), 1);
    let (session, handle) = GatewaySession::new(
        shard_zero(),
        url,
        &config(),
        &ctx,
        state.clone(),
        identify(),
    );
    let task = tokio::spawn(session.run());

    let mut ws = accept(&listener).await;
    send(&mut ws, hello()).await;

    let identify = recv_json(&mut ws).await;
    assert_eq!(identify["op"], 2);
    assert_eq!(identify["d"]["token"], "token");
    assert_eq!(identify["d"]["shard"], json!([0, 1]));
    assert_eq!(identify["d"]["large_threshold"], 250);

    send(&mut ws, ready(1)).await;
    send(&mut ws, message_create(2)).await;

    let first = next_event(&mut events).await;
    assert_eq!(first.name, "READY");
    let second = next_event(&mut events).await;
    assert_eq!(second.name, "MESSAGE_CREATE");
    assert_eq!(second.sequence, Some(2));
    assert_eq!(second.payload["content"], "hi");

    assert_eq!(state.get_state(0), Some(ConnectionState::Ready));
    assert_eq!(state.total_guilds(), 2);
    assert_eq!(state.total_events_received(), 2);

    assert!(handle.update_presence(&PresenceUpdate {
        since: None,
        activities: vec![],
        status: "idle".to_string(),
        afk: true,
    }));
    let presence = recv_json(&mut ws).await;
    assert_eq!(presence["op"], 3);
    assert_eq!(presence["d"]["status"], "idle");

    task.abort();
}

#[tokio::test]
async fn authentication_failure_is_fatal_and_never_reconnects() {
    let (listener, url) = bind().await;
    let ctx = context();
    let state = ShardState::new([0].into_iter(), 1);
    let (session, _handle) = GatewaySession::new(
        shard_zero(),
        url,
        &config(),
        &ctx,
        state.clone(),
        identify(),
    );
    let task = tokio::spawn(session.run());

    let mut ws = accept(&listener).await;
    send(&mut ws, hello()).await;
    assert_eq!(recv_json(&mut ws).await["op"], 2);
    ws.close(Some(CloseFrame {
        code: CloseCode::from(4004),
        reason: "Authentication failed.".into(),
    }))
    .await
    .unwrap();

    let result = timeout(WAIT, task).await.unwrap().unwrap();
    let err = result.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Authentication {
            shard_id: 0,
            code: 4004
        }
    ));
    assert!(err.to_string().contains("shard 0"));
    assert_eq!(state.get_state(0), Some(ConnectionState::Closed));
    assert_eq!(state.reconnects(0), 0);
    assert!(state.last_error(0).unwrap().contains("4004"));

    // No second connection attempt
    assert!(timeout(Duration::from_millis(300), listener.accept()).await.is_err());
}

#[tokio::test]
async fn reconnect_request_resumes_the_session() {
    let (listener, url) = bind().await;
    let ctx = context();
    let mut events = ctx.events.subscribe_channel(EventFilter::named("RESUMED"));
    let state = ShardState::new([0].into_iter(), 1);
    let (session, _handle) = GatewaySession::new(
        shard_zero(),
        url,
        &config(),
        &ctx,
        state.clone(),
        identify(),
    );
    let task = tokio::spawn(session.run());

    let mut first = accept(&listener).await;
    send(&mut first, hello()).await;
    assert_eq!(recv_json(&mut first).await["op"], 2);
    send(&mut first, ready(1)).await;
    send(&mut first, message_create(5)).await;
    send(&mut first, json!({ "op": 7, "d": null })).await;

    let mut second = accept(&listener).await;
    send(&mut second, hello()).await;
    let resume = recv_json(&mut second).await;
    assert_eq!(resume["op"], 6);
    assert_eq!(resume["d"]["session_id"], "abc");
    assert_eq!(resume["d"]["seq"], 5);
    assert_eq!(resume["d"]["token"], "token");

    send(&mut second, json!({ "op": 0, "t": "RESUMED", "s": 6, "d": null })).await;
    assert_eq!(next_event(&mut events).await.name, "RESUMED");
    assert_eq!(state.get_state(0), Some(ConnectionState::Ready));
    assert_eq!(state.reconnects(0), 1);

    task.abort();
}

#[tokio::test]
async fn invalid_session_reidentifies() {
    let (listener, url) = bind().await;
    let ctx = context();
    let state = ShardState::new([0].into_iter(), 1);
    let (session, _handle) = GatewaySession::new(
        shard_zero(),
        url,
        &config(),
        &ctx,
        state,
        identify(),
    );
    let task = tokio::spawn(session.run());

    let mut first = accept(&listener).await;
    send(&mut first, hello()).await;
    assert_eq!(recv_json(&mut first).await["op"], 2);
    send(&mut first, ready(1)).await;
    send(&mut first, json!({ "op": 9, "d": false })).await;

    let mut second = accept(&listener).await;
    send(&mut second, hello()).await;
    assert_eq!(recv_json(&mut second).await["op"], 2);

    task.abort();
}

#[tokio::test]
async fn decodes_zlib_stream_across_frames() {
    let (listener, url) = bind().await;
    let ctx = context();
    let mut events = ctx.events.subscribe_channel(EventFilter::named("MESSAGE_CREATE"));
    let state = ShardState::new([0].into_iter(), 1);
    let (session, _handle) = GatewaySession::new(
        shard_zero(),
        url,
        &config(),
        &ctx,
        state,
        identify(),
    );
    let task = tokio::spawn(session.run());

    let mut ws = accept(&listener).await;
    let mut compressor = Compress::new(Compression::default(), true);

    // Hello split over two frames
    let hello_bytes = compress_message(&mut compressor, hello());
    let (head, tail) = hello_bytes.split_at(hello_bytes.len() / 2);
    ws.send(Message::Binary(head.to_vec())).await.unwrap();
    ws.send(Message::Binary(tail.to_vec())).await.unwrap();
    let identify = recv_json(&mut ws).await;
    assert_eq!(identify["op"], 2);
    // Payload compression would nest a second zlib stream inside this one
    assert_eq!(identify["d"]["compress"], false);

    let ready_bytes = compress_message(&mut compressor, ready(1));
    let message_bytes = compress_message(&mut compressor, message_create(2));
    ws.send(Message::Binary(ready_bytes)).await.unwrap();
    ws.send(Message::Binary(message_bytes)).await.unwrap();

    let event = next_event(&mut events).await;
    assert_eq!(event.sequence, Some(2));
    assert_eq!(event.payload["content"], "hi");

    task.abort();
}

#[tokio::test]
async fn corrupt_frame_reconnects_and_resumes_on_a_fresh_stream() {
    let (listener, url) = bind().await;
    let ctx = context();
    let mut events = ctx.events.subscribe_channel(EventFilter::named("MESSAGE_CREATE"));
    let state = ShardState::new([0].into_iter(), 1);
    let (session, _handle) = GatewaySession::new(
        shard_zero(),
        url,
        &config(),
        &ctx,
        state.clone(),
        identify(),
    );
    let task = tokio::spawn(session.run());

    let mut first = accept(&listener).await;
    let mut compressor = Compress::new(Compression::default(), true);
    first
        .send(Message::Binary(compress_message(&mut compressor, hello())))
        .await
        .unwrap();
    assert_eq!(recv_json(&mut first).await["op"], 2);
    first
        .send(Message::Binary(compress_message(&mut compressor, ready(3))))
        .await
        .unwrap();

    // Invalid deflate block, terminated like a complete message
    first
        .send(Message::Binary(vec![0xFF, 0xFF, 0x00, 0x00, 0xFF, 0xFF]))
        .await
        .unwrap();
    assert_eq!(recv_close_code(&mut first).await, Some(4900));

    // The new connection starts a new zlib stream
    let mut second = accept(&listener).await;
    let mut compressor = Compress::new(Compression::default(), true);
    second
        .send(Message::Binary(compress_message(&mut compressor, hello())))
        .await
        .unwrap();
    let resume = recv_json(&mut second).await;
    assert_eq!(resume["op"], 6);
    assert_eq!(resume["d"]["session_id"], "abc");
    assert_eq!(resume["d"]["seq"], 3);

    let resumed = json!({ "op": 0, "t": "RESUMED", "s": 4, "d": null });
    second
        .send(Message::Binary(compress_message(&mut compressor, resumed)))
        .await
        .unwrap();
    second
        .send(Message::Binary(compress_message(&mut compressor, message_create(5))))
        .await
        .unwrap();

    let event = next_event(&mut events).await;
    assert_eq!(event.sequence, Some(5));
    assert_eq!(state.get_state(0), Some(ConnectionState::Ready));
    assert_eq!(state.reconnects(0), 1);
    assert!(!task.is_finished());

    task.abort();
}

#[tokio::test]
async fn shards_sharing_a_rate_limit_key_identify_apart() {
    let (listener, url) = bind().await;
    let ctx = context();
    let pacing = Duration::from_millis(300);
    let queue = Arc::new(IdentifyQueue::with_interval(1, pacing));

    let mut tasks = Vec::new();
    for id in 0..2 {
        let state = ShardState::new([id].into_iter(), 2);
        let (session, _handle) = GatewaySession::new(
            ShardInfo { id, total: 2 },
            url.clone(),
            &config(),
            &ctx,
            state,
            Arc::clone(&queue),
        );
        tasks.push(tokio::spawn(session.run()));
    }

    let mut identified = Vec::new();
    let mut sockets = Vec::new();
    for _ in 0..2 {
        let mut ws = accept(&listener).await;
        send(&mut ws, hello()).await;
        let identify = recv_json(&mut ws).await;
        assert_eq!(identify["op"], 2);
        identified.push((identify["d"]["shard"][0].as_u64().unwrap(), Instant::now()));
        sockets.push(ws);
    }

    let mut shards: Vec<u64> = identified.iter().map(|(id, _)| *id).collect();
    shards.sort_unstable();
    assert_eq!(shards, vec![0, 1]);
    let gap = identified[1].1 - identified[0].1;
    // Both sides of the gap include one connect and handshake
    assert!(gap >= pacing - Duration::from_millis(50), "identifies {gap:?} apart");

    for task in tasks {
        task.abort();
    }
}
