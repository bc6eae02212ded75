//! RequestDispatcher against an in-process mock REST API

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use reqwest::Method;
use shardwire::config::HttpConfig;
use shardwire::http::{RequestDispatcher, RouteKey};
use shardwire::metrics::GatewayMetrics;
use shardwire::HttpError;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

const CHANNEL: &str = "123456789012345678";

async fn spawn_api(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn dispatcher(base: &str, max_retries: u32) -> RequestDispatcher {
    let config = HttpConfig {
        api_base: base.to_string(),
        max_rate_limit_retries: max_retries,
        ..HttpConfig::new("test-token")
    };
    RequestDispatcher::new(config, Arc::new(GatewayMetrics::disabled())).unwrap()
}

fn rate_limited(global: bool) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("retry-after", "1".parse().unwrap());
    if global {
        headers.insert("x-ratelimit-global", "true".parse().unwrap());
    }
    (
        StatusCode::TOO_MANY_REQUESTS,
        headers,
        Json(json!({ "message": "You are being rate limited.", "retry_after": 0.05, "global": global })),
    )
        .into_response()
}

#[tokio::test]
async fn sends_bot_authorization_and_user_agent() {
    let router = Router::new().route(
        "/v10/users/@me",
        get(|headers: HeaderMap| async move {
            let header = |name: &str| {
                headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            };
            Json(json!({ "authorization": header("authorization"), "user_agent": header("user-agent") }))
        }),
    );
    let base = spawn_api(router).await;

    let user = dispatcher(&base, 5).get_current_user().await.unwrap();
    assert_eq!(user["authorization"], "Bot test-token");
    assert!(user["user_agent"].as_str().unwrap().starts_with("DiscordBot ("));
}

#[tokio::test]
async fn retries_429_transparently() {
    let calls = Arc::new(AtomicU32::new(0));
    let router = Router::new()
        .route(
            "/v10/channels/{channel_id}/messages",
            post(|State(calls): State<Arc<AtomicU32>>| async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    rate_limited(false)
                } else {
                    Json(json!({ "id": "1", "content": "hello" })).into_response()
                }
            }),
        )
        .with_state(Arc::clone(&calls));
    let base = spawn_api(router).await;
    let http = dispatcher(&base, 5);

    let message = http.create_message(CHANNEL, "hello").await.unwrap();
    assert_eq!(message["content"], "hello");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    // The 429 created a bucket for the route
    assert_eq!(http.limiter().bucket_count(), 1);
}

#[tokio::test]
async fn surfaces_rate_limit_after_retry_cap() {
    let calls = Arc::new(AtomicU32::new(0));
    let router = Router::new()
        .route(
            "/v10/channels/{channel_id}/messages",
            post(|State(calls): State<Arc<AtomicU32>>| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                rate_limited(false)
            }),
        )
        .with_state(Arc::clone(&calls));
    let base = spawn_api(router).await;

    let err = dispatcher(&base, 2)
        .create_message(CHANNEL, "hello")
        .await
        .unwrap_err();
    match err {
        HttpError::RateLimited { retries, route, .. } => {
            assert_eq!(retries, 2);
            assert_eq!(route, format!("POST /channels/{CHANNEL}/messages"));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn global_429_sets_global_throttle() {
    let calls = Arc::new(AtomicU32::new(0));
    let router = Router::new()
        .route(
            "/v10/channels/{channel_id}",
            get(|State(calls): State<Arc<AtomicU32>>| async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    rate_limited(true)
                } else {
                    Json(json!({ "id": CHANNEL })).into_response()
                }
            }),
        )
        .with_state(Arc::clone(&calls));
    let base = spawn_api(router).await;
    let http = dispatcher(&base, 5);

    let channel = http.get_channel(CHANNEL).await.unwrap();
    assert_eq!(channel["id"], CHANNEL);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    // A global limit does not create a route bucket
    assert_eq!(http.limiter().bucket_count(), 0);
}

#[tokio::test]
async fn server_error_is_recoverable() {
    let router = Router::new().route(
        "/v10/gateway/bot",
        get(|| async { (StatusCode::BAD_GATEWAY, "upstream unavailable") }),
    );
    let base = spawn_api(router).await;

    let err = dispatcher(&base, 5).get_gateway_bot().await.unwrap_err();
    assert!(matches!(err, HttpError::Server { status: 502, .. }));
    assert!(err.is_recoverable());
}

#[tokio::test]
async fn client_error_carries_structured_body() {
    let router = Router::new().route(
        "/v10/channels/{channel_id}/messages",
        post(|| async {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "code": 50035,
                    "message": "Invalid Form Body",
                    "errors": { "content": { "_errors": [{ "code": "BASE_TYPE_MAX_LENGTH" }] } }
                })),
            )
        }),
    );
    let base = spawn_api(router).await;

    let err = dispatcher(&base, 5)
        .create_message(CHANNEL, "x")
        .await
        .unwrap_err();
    assert!(!err.is_recoverable());
    match err {
        HttpError::Client { status, error, .. } => {
            assert_eq!(status, 400);
            assert_eq!(error.code, 50035);
            assert_eq!(error.message, "Invalid Form Body");
            assert!(error.errors.unwrap()["content"].is_object());
        }
        other => panic!("expected Client error, got {other:?}"),
    }
}

#[tokio::test]
async fn rate_limit_headers_create_bucket_and_no_content_is_null() {
    let router = Router::new().route(
        "/v10/channels/{channel_id}/messages/{message_id}",
        delete(|| async {
            let mut headers = HeaderMap::new();
            headers.insert("x-ratelimit-limit", "5".parse().unwrap());
            headers.insert("x-ratelimit-remaining", "4".parse().unwrap());
            headers.insert("x-ratelimit-reset-after", "1.0".parse().unwrap());
            (StatusCode::NO_CONTENT, headers)
        }),
    );
    let base = spawn_api(router).await;
    let http = dispatcher(&base, 5);

    http.delete_message(CHANNEL, "999999999999999999").await.unwrap();
    http.delete_message(CHANNEL, "888888888888888888").await.unwrap();

    // Both message ids share one bucket
    assert_eq!(http.limiter().bucket_count(), 1);
    let route = RouteKey::new(
        &Method::DELETE,
        &format!("/channels/{CHANNEL}/messages/777777777777777777"),
    );
    let snapshot = http.limiter().bucket(&route).unwrap().snapshot();
    assert_eq!(snapshot.limit, 5);
    assert!(snapshot.authoritative);

    let value = http
        .request(Method::DELETE, &format!("/channels/{CHANNEL}/messages/777777777777777777"), None)
        .await
        .unwrap();
    assert_eq!(value, Value::Null);
}

#[tokio::test]
async fn gateway_bot_is_decoded() {
    let router = Router::new().route(
        "/v10/gateway/bot",
        get(|| async {
            Json(json!({
                "url": "wss://gateway.example",
                "shards": 4,
                "session_start_limit": { "total": 1000, "remaining": 998, "reset_after": 1000, "max_concurrency": 1 }
            }))
        }),
    );
    let base = spawn_api(router).await;

    let info = dispatcher(&base, 5).get_gateway_bot().await.unwrap();
    assert_eq!(info.url, "wss://gateway.example");
    assert_eq!(info.shards, 4);
    assert_eq!(info.session_start_limit.remaining, 998);
}
