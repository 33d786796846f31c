//! Handle lifecycle of the change-feed client: subscribe timeout and close.

mod common;

use common::settle;
use parking_lot::Mutex;
use plico_realtime::feed::{
    ChangeEvent, ChangeFeedClient, ChannelStatus, EventSpec, LocalChangeFeed, PayloadHandler, StatusHandler,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn spec() -> EventSpec {
    EventSpec::new("Option")
        .event(ChangeEvent::Update)
        .filter("plicoId=eq.p1")
}

fn recorder() -> (StatusHandler, Arc<Mutex<Vec<ChannelStatus>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (Arc::new(move |status| sink.lock().push(status)), seen)
}

fn counter() -> (PayloadHandler, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let sink = count.clone();
    (
        Arc::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }),
        count,
    )
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_subscribe_times_out() {
    let feed = LocalChangeFeed::manual();
    let client = ChangeFeedClient::new(Arc::new(feed.clone()));
    let (on_message, _) = counter();
    let (on_status, seen) = recorder();

    let handle = client.open("poll-p1", &spec(), on_message, on_status);
    assert!(client.is_open(&handle));

    tokio::time::advance(Duration::from_millis(9_999)).await;
    settle().await;
    assert!(seen.lock().is_empty());

    tokio::time::advance(Duration::from_millis(1)).await;
    settle().await;
    assert_eq!(*seen.lock(), vec![ChannelStatus::TimedOut]);
    assert!(!client.is_open(&handle));
    assert_eq!(feed.live_channels("poll-p1"), 0);

    // Closing a timed-out handle is a no-op.
    client.close(&handle);
    assert_eq!(feed.remove_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_subscribed_disarms_timeout() {
    let feed = LocalChangeFeed::manual();
    let client = ChangeFeedClient::new(Arc::new(feed.clone()));
    let (on_message, _) = counter();
    let (on_status, seen) = recorder();

    let handle = client.open("poll-p1", &spec(), on_message, on_status);
    feed.emit_status("poll-p1", ChannelStatus::Subscribed);

    tokio::time::advance(Duration::from_secs(30)).await;
    settle().await;
    assert_eq!(*seen.lock(), vec![ChannelStatus::Subscribed]);
    assert!(client.is_open(&handle));
}

#[tokio::test(start_paused = true)]
async fn test_channel_error_disarms_timeout() {
    let feed = LocalChangeFeed::manual();
    let client = ChangeFeedClient::new(Arc::new(feed.clone()));
    let (on_message, _) = counter();
    let (on_status, seen) = recorder();

    let handle = client.open("poll-p1", &spec(), on_message, on_status);
    tokio::time::advance(Duration::from_secs(3)).await;
    feed.emit_status("poll-p1", ChannelStatus::ChannelError);

    tokio::time::advance(Duration::from_secs(30)).await;
    settle().await;
    assert_eq!(*seen.lock(), vec![ChannelStatus::ChannelError]);
    assert!(client.is_open(&handle));
    assert_eq!(feed.remove_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_auto_subscribe_feed_acknowledges() {
    let feed = LocalChangeFeed::new();
    let client = ChangeFeedClient::new(Arc::new(feed.clone()));
    let (on_message, _) = counter();
    let (on_status, seen) = recorder();

    let _handle = client.open("poll-p1", &spec(), on_message, on_status);
    settle().await;
    assert_eq!(*seen.lock(), vec![ChannelStatus::Subscribed]);
}

#[tokio::test(start_paused = true)]
async fn test_close_is_idempotent_and_silences_handle() {
    let feed = LocalChangeFeed::manual();
    let client = ChangeFeedClient::new(Arc::new(feed.clone()));
    let (on_message, delivered) = counter();
    let (on_status, seen) = recorder();

    let handle = client.open("poll-p1", &spec(), on_message, on_status);
    assert_eq!(feed.publish(common::option_update("p1", "opt-1", 1)), 1);
    assert_eq!(delivered.load(Ordering::SeqCst), 1);

    client.close(&handle);
    client.close(&handle);
    assert_eq!(feed.remove_calls(), 1);
    assert_eq!(client.open_count(), 0);

    assert_eq!(feed.publish(common::option_update("p1", "opt-1", 2)), 0);
    assert_eq!(delivered.load(Ordering::SeqCst), 1);

    // The timeout was disarmed with the close.
    tokio::time::advance(Duration::from_secs(20)).await;
    settle().await;
    assert!(seen.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_filter_limits_delivery() {
    let feed = LocalChangeFeed::manual();
    let client = ChangeFeedClient::new(Arc::new(feed.clone()));
    let (on_message, delivered) = counter();
    let (on_status, _) = recorder();

    let _handle = client.open("poll-p1", &spec(), on_message, on_status);
    assert_eq!(feed.publish(common::option_update("p2", "opt-1", 1)), 0);
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
}
