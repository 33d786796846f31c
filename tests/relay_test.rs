//! HTTP surface of the relay, driven through the router without a socket.

mod common;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use common::{FakePollApi, Stack, poll, stack};
use futures::StreamExt;
use plico_realtime::feed::{ChannelStatus, EventSpec};
use plico_realtime::realtime::SubscribeConfig;
use plico_realtime::results::ResultsConfig;
use plico_realtime::startup::{AppState, router};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

fn app(stack: &Stack, api: &Arc<FakePollApi>) -> axum::Router {
    router(AppState::new(
        stack.manager.clone(),
        api.clone(),
        ResultsConfig::default(),
    ))
}

async fn json_body(body: Body) -> Value {
    let bytes = to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_status_reports_connection_state() {
    let stack = stack();
    let api = FakePollApi::new(poll("p1", &[1, 2]));

    let response = app(&stack, &api)
        .oneshot(Request::get("/api/realtime/status").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response.into_body()).await;
    assert_eq!(body["isConnected"], false);
    assert_eq!(body["retryCount"], 0);
    assert_eq!(body["connectionError"], Value::Null);
}

#[tokio::test]
async fn test_reconnect_resubscribes_tracked_channels() {
    let stack = stack();
    let api = FakePollApi::new(poll("p1", &[1, 2]));
    let _sub = stack
        .manager
        .subscribe(SubscribeConfig::new("poll-p1", EventSpec::new("Option"), |_| {}));
    stack.feed.emit_status("poll-p1", ChannelStatus::ChannelError);

    let response = app(&stack, &api)
        .oneshot(
            Request::post("/api/realtime/reconnect")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(stack.feed.subscribe_calls(), 2);
    let body = json_body(response.into_body()).await;
    assert_eq!(body["connectionError"], Value::Null);
}

#[tokio::test]
async fn test_snapshot_passthrough() {
    let stack = stack();
    let api = FakePollApi::new(poll("p1", &[1, 2]));

    let response = app(&stack, &api)
        .oneshot(Request::get("/api/plico/p1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response.into_body()).await;
    assert_eq!(body["id"], "p1");
    assert_eq!(body["totalVotes"], 3);
    assert_eq!(body["options"][1]["voteCount"], 2);
}

#[tokio::test]
async fn test_unknown_poll_is_not_found() {
    let stack = stack();
    let api = FakePollApi::new(poll("p1", &[1, 2]));

    let response = app(&stack, &api)
        .oneshot(Request::get("/api/plico/missing").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response.into_body()).await;
    assert_eq!(body["error"], "Poll not found");
}

#[tokio::test]
async fn test_live_stream_starts_with_init_and_unmounts_on_disconnect() {
    let stack = stack();
    let api = FakePollApi::new(poll("p1", &[1, 2]));

    let response = app(&stack, &api)
        .oneshot(Request::get("/api/plico/p1/live").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");

    let mut stream = response.into_body().into_data_stream();
    let first = stream.next().await.unwrap().unwrap();
    let frame = String::from_utf8(first.to_vec()).unwrap();
    assert!(frame.contains("event: init"));
    assert!(frame.contains("\"totalVotes\":3"));
    assert_eq!(stack.feed.live_channels("poll-p1"), 1);

    drop(stream);
    assert_eq!(stack.feed.live_channels("poll-p1"), 0);
    assert!(stack.manager.tracked_channels().is_empty());
}

#[tokio::test]
async fn test_live_stream_reports_missing_poll() {
    let stack = stack();
    let api = FakePollApi::new(poll("p1", &[1, 2]));

    let response = app(&stack, &api)
        .oneshot(Request::get("/api/plico/missing/live").body(Body::empty()).unwrap())
        .await
        .unwrap();

    let mut stream = response.into_body().into_data_stream();
    let first = stream.next().await.unwrap().unwrap();
    let frame = String::from_utf8(first.to_vec()).unwrap();
    assert!(frame.contains("event: error"));
    assert_eq!(stack.feed.subscribe_calls(), 0);
}
