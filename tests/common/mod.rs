//! Shared fixtures: an in-process feed wired through the full realtime stack,
//! and a scripted poll backend.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use plico_realtime::error::ApiError;
use plico_realtime::feed::{ChangeFeedClient, ChangePayload, LocalChangeFeed};
use plico_realtime::realtime::{RealtimeManager, RetryPolicy, SubscriptionRegistry};
use plico_realtime::results::{PollApi, PollOption, PollSnapshot, VoteReceipt};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

pub struct Stack {
    pub feed: LocalChangeFeed,
    pub client: ChangeFeedClient,
    pub registry: SubscriptionRegistry,
    pub manager: RealtimeManager,
}

/// Manual feed (statuses are emitted by the test) with an immediate teardown.
/// The subscribe timeout is pushed out of the way; use [`stack_timed`] to
/// exercise it.
pub fn stack() -> Stack {
    stack_with(Duration::ZERO, RetryPolicy::default())
}

pub fn stack_with(teardown_delay: Duration, policy: RetryPolicy) -> Stack {
    stack_timed(teardown_delay, policy, Duration::from_secs(3600))
}

/// Like [`stack_with`], with an explicit subscribe handshake timeout.
pub fn stack_timed(teardown_delay: Duration, policy: RetryPolicy, subscribe_timeout: Duration) -> Stack {
    let feed = LocalChangeFeed::manual();
    let client = ChangeFeedClient::new(Arc::new(feed.clone())).with_subscribe_timeout(subscribe_timeout);
    let registry = SubscriptionRegistry::new(client.clone(), teardown_delay);
    let manager = RealtimeManager::new(registry.clone(), policy);
    Stack {
        feed,
        client,
        registry,
        manager,
    }
}

/// Retry policy without jitter, so delays are exact.
pub fn exact_policy() -> RetryPolicy {
    RetryPolicy {
        jitter: 0.0,
        ..RetryPolicy::default()
    }
}

/// Lets spawned tasks run without moving the paused clock.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

pub async fn advance(duration: Duration) {
    tokio::time::advance(duration).await;
    settle().await;
}

pub fn poll(id: &str, counts: &[u64]) -> PollSnapshot {
    let options = counts
        .iter()
        .enumerate()
        .map(|(i, count)| PollOption::new(format!("opt-{}", i + 1), format!("Option {}", i + 1), *count))
        .collect();
    PollSnapshot::new(id, "Best editor?", options)
}

pub fn option_update(poll_id: &str, option_id: &str, vote_count: u64) -> ChangePayload {
    ChangePayload::update(
        "Option",
        json!({"id": option_id, "plicoId": poll_id, "text": "x", "voteCount": vote_count}),
    )
}

pub enum VoteScript {
    Count(u64),
    Reject,
}

/// Poll backend double. Fetches return the current server-side snapshot.
pub struct FakePollApi {
    snapshot: Mutex<PollSnapshot>,
    fetches: AtomicUsize,
    votes: AtomicUsize,
    fail_fetches: AtomicBool,
    vote_script: Mutex<VoteScript>,
    vote_gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl FakePollApi {
    pub fn new(snapshot: PollSnapshot) -> Arc<Self> {
        Arc::new(Self {
            snapshot: Mutex::new(snapshot),
            fetches: AtomicUsize::new(0),
            votes: AtomicUsize::new(0),
            fail_fetches: AtomicBool::new(false),
            vote_script: Mutex::new(VoteScript::Reject),
            vote_gate: Mutex::new(None),
        })
    }

    pub fn set_snapshot(&self, snapshot: PollSnapshot) {
        *self.snapshot.lock() = snapshot;
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    pub fn script_vote(&self, script: VoteScript) {
        *self.vote_script.lock() = script;
    }

    /// The next vote waits until the returned sender fires.
    pub fn hold_next_vote(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.vote_gate.lock() = Some(rx);
        tx
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn votes(&self) -> usize {
        self.votes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PollApi for FakePollApi {
    async fn fetch_poll(&self, poll_id: &str) -> Result<PollSnapshot, ApiError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(ApiError::Rejected {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        let snapshot = self.snapshot.lock().clone();
        if snapshot.id != poll_id {
            return Err(ApiError::NotFound(poll_id.to_string()));
        }
        Ok(snapshot)
    }

    async fn cast_vote(&self, _poll_id: &str, _option_id: &str) -> Result<VoteReceipt, ApiError> {
        self.votes.fetch_add(1, Ordering::SeqCst);
        let gate = self.vote_gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        match *self.vote_script.lock() {
            VoteScript::Count(vote_count) => Ok(VoteReceipt {
                success: true,
                vote_count,
            }),
            VoteScript::Reject => Err(ApiError::Rejected {
                status: 409,
                message: "already voted".to_string(),
            }),
        }
    }
}
