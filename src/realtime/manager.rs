use super::registry::{Callback, Detach, Listener, SubscriptionRegistry};
use super::retry::RetryPolicy;
use super::state::{ChannelPhase, ConnectionState};
use crate::error::RealtimeError;
use crate::feed::{ChangePayload, ChannelStatus, EventSpec, PayloadHandler};
use crate::timer::{self, TimerHandle};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub type ErrorHandler = Arc<dyn Fn(&RealtimeError) + Send + Sync>;

/// Everything a consumer passes to [`RealtimeManager::subscribe`].
#[derive(Clone)]
pub struct SubscribeConfig {
    pub channel_name: String,
    pub spec: EventSpec,
    pub on_message: PayloadHandler,
    pub on_error: Option<ErrorHandler>,
    pub on_connect: Option<Callback>,
    pub on_disconnect: Option<Callback>,
}

impl SubscribeConfig {
    pub fn new(
        channel_name: impl Into<String>,
        spec: EventSpec,
        on_message: impl Fn(ChangePayload) + Send + Sync + 'static,
    ) -> Self {
        Self {
            channel_name: channel_name.into(),
            spec,
            on_message: Arc::new(on_message),
            on_error: None,
            on_connect: None,
            on_disconnect: None,
        }
    }

    pub fn on_error(mut self, f: impl Fn(&RealtimeError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    pub fn on_disconnect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }
}

struct ChannelState {
    phase: ChannelPhase,
    attempts: u32,
    retry: Option<TimerHandle>,
    subscribers: usize,
}

enum FailureOutcome {
    Scheduled,
    AlreadyPending,
    Exhausted(u32),
    Untracked,
}

struct ManagerInner {
    registry: SubscriptionRegistry,
    policy: RetryPolicy,
    channels: Mutex<HashMap<String, ChannelState>>,
    state: watch::Sender<ConnectionState>,
}

impl ManagerInner {
    fn channel_connected(&self, channel_name: &str) {
        {
            let mut channels = self.channels.lock();
            let Some(channel) = channels.get_mut(channel_name) else {
                return;
            };
            if let Some(retry) = channel.retry.take() {
                retry.cancel();
            }
            channel.attempts = 0;
            channel.phase = ChannelPhase::Subscribed;
        }
        info!(channel = %channel_name, "channel subscribed");
        self.state.send_modify(|state| {
            state.is_connected = true;
            state.connection_error = None;
            state.retry_count = 0;
        });
    }

    fn channel_delivered(&self, channel_name: &str) {
        let (reset, recovered) = {
            let mut channels = self.channels.lock();
            match channels.get_mut(channel_name) {
                Some(channel) if channel.phase == ChannelPhase::Failed => {
                    channel.attempts = 0;
                    channel.phase = ChannelPhase::Subscribed;
                    (true, true)
                }
                Some(channel) if channel.attempts > 0 => {
                    channel.attempts = 0;
                    (true, false)
                }
                _ => (false, false),
            }
        };
        if recovered {
            info!(channel = %channel_name, "failed channel delivered a message, recovered");
            self.state.send_modify(|state| {
                state.is_connected = true;
                state.connection_error = None;
                state.retry_count = 0;
            });
        } else if reset {
            self.state.send_modify(|state| state.retry_count = 0);
        }
    }

    fn channel_closed(&self, channel_name: &str) {
        if self.channels.lock().contains_key(channel_name) {
            self.state.send_modify(|state| state.is_connected = false);
        }
    }

    fn channel_failed(self: &Arc<Self>, channel_name: &str, status: ChannelStatus) -> FailureOutcome {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.get_mut(channel_name) else {
            return FailureOutcome::Untracked;
        };

        match channel.phase {
            ChannelPhase::Failed => return FailureOutcome::Exhausted(channel.attempts),
            ChannelPhase::Retrying if channel.retry.is_some() => {
                return FailureOutcome::AlreadyPending;
            }
            _ => {}
        }

        channel.attempts += 1;
        let attempts = channel.attempts;

        if attempts >= self.policy.max_attempts {
            channel.phase = ChannelPhase::Failed;
            drop(channels);
            warn!(channel = %channel_name, attempts, "retries exhausted, reconnect required");
            self.state.send_modify(|state| {
                state.is_connected = false;
                state.connection_error = Some(format!(
                    "Channel {channel_name} failed after {attempts} attempts, reconnect required"
                ));
                state.retry_count = attempts;
                state.last_error_at = Some(Utc::now());
            });
            return FailureOutcome::Exhausted(attempts);
        }

        let delay = self.policy.delay_for(attempts - 1);
        let weak = Arc::downgrade(self);
        let name = channel_name.to_string();
        channel.retry = Some(timer::schedule(delay, move || {
            if let Some(inner) = weak.upgrade() {
                inner.run_retry(&name);
            }
        }));
        channel.phase = ChannelPhase::Retrying;
        drop(channels);

        warn!(channel = %channel_name, %status, attempt = attempts, ?delay, "channel failed, retry scheduled");
        self.state.send_modify(|state| {
            state.is_connected = false;
            state.connection_error = Some(format!("Channel {channel_name} reported {status}"));
            state.retry_count = attempts;
            state.last_error_at = Some(Utc::now());
        });
        FailureOutcome::Scheduled
    }

    fn run_retry(&self, channel_name: &str) {
        {
            let mut channels = self.channels.lock();
            let Some(channel) = channels.get_mut(channel_name) else {
                return;
            };
            // Dropping our own handle is fine: the closure is already running.
            channel.retry = None;
            channel.phase = ChannelPhase::Connecting;
        }
        debug!(channel = %channel_name, "retrying channel");
        self.registry.resubscribe(channel_name);
    }

    fn release(&self, channel_name: &str) {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.get_mut(channel_name) else {
            return;
        };
        channel.subscribers = channel.subscribers.saturating_sub(1);
        if channel.subscribers == 0 {
            if let Some(removed) = channels.remove(channel_name) {
                if let Some(retry) = removed.retry {
                    retry.cancel();
                }
            }
            debug!(channel = %channel_name, "channel no longer tracked");
        }
    }
}

/// Connection-state machine over the [`SubscriptionRegistry`]: per-channel
/// retry with exponential backoff, a terminal failed phase, and an
/// observable [`ConnectionState`].
#[derive(Clone)]
pub struct RealtimeManager {
    inner: Arc<ManagerInner>,
}

impl RealtimeManager {
    pub fn new(registry: SubscriptionRegistry, policy: RetryPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::default());
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                policy,
                channels: Mutex::new(HashMap::new()),
                state,
            }),
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    pub fn subscribe(&self, config: SubscribeConfig) -> Subscription {
        let SubscribeConfig {
            channel_name,
            spec,
            on_message,
            on_error,
            on_connect,
            on_disconnect,
        } = config;

        let fresh = {
            let mut channels = self.inner.channels.lock();
            let channel = channels
                .entry(channel_name.clone())
                .or_insert_with(|| ChannelState {
                    phase: ChannelPhase::Idle,
                    attempts: 0,
                    retry: None,
                    subscribers: 0,
                });
            channel.subscribers += 1;
            let fresh = channel.phase == ChannelPhase::Idle;
            if fresh {
                channel.phase = ChannelPhase::Connecting;
            }
            fresh
        };
        // A channel still lingering in the registry from a previous consumer
        // keeps its old upstream, whose state we no longer know.
        let lingering = fresh && self.inner.registry.is_lingering(&channel_name);

        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let name = channel_name.clone();
        let mut listener = Listener::new({
            let weak = weak.clone();
            let name = name.clone();
            move |payload| {
                if let Some(inner) = weak.upgrade() {
                    inner.channel_delivered(&name);
                }
                on_message(payload);
            }
        });

        listener = listener.on_connect({
            let weak = weak.clone();
            let name = name.clone();
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.channel_connected(&name);
                }
                if let Some(on_connect) = &on_connect {
                    on_connect();
                }
            }
        });

        listener = listener.on_disconnect({
            let weak = weak.clone();
            let name = name.clone();
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.channel_closed(&name);
                }
                if let Some(on_disconnect) = &on_disconnect {
                    on_disconnect();
                }
            }
        });

        listener = listener.on_error(move |status| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let error = match inner.channel_failed(&name, status) {
                FailureOutcome::Untracked => return,
                FailureOutcome::Exhausted(attempts) => RealtimeError::RetriesExhausted {
                    channel: name.clone(),
                    attempts,
                },
                FailureOutcome::Scheduled | FailureOutcome::AlreadyPending => {
                    RealtimeError::Transport {
                        channel: name.clone(),
                        status,
                    }
                }
            };
            if let Some(on_error) = &on_error {
                on_error(&error);
            }
        });

        let detach = self.inner.registry.attach(&channel_name, &spec, listener);
        if lingering {
            debug!(channel = %channel_name, "reattached during teardown, reopening upstream");
            self.inner.registry.resubscribe(&channel_name);
        }

        Subscription {
            detach,
            manager: Arc::downgrade(&self.inner),
            channel_name,
            released: AtomicBool::new(false),
        }
    }

    /// Cancels every pending retry and recreates every tracked channel's
    /// upstream subscription now, whatever its phase.
    pub fn force_reconnect(&self) {
        let names: Vec<String> = {
            let mut channels = self.inner.channels.lock();
            for channel in channels.values_mut() {
                if let Some(retry) = channel.retry.take() {
                    retry.cancel();
                }
                channel.attempts = 0;
                channel.phase = ChannelPhase::Connecting;
            }
            channels.keys().cloned().collect()
        };

        info!(channels = names.len(), "forcing reconnect");
        self.inner.state.send_modify(|state| {
            state.is_connected = false;
            state.connection_error = None;
            state.retry_count = 0;
        });

        for name in names {
            self.inner.registry.resubscribe(&name);
        }
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn channel_phase(&self, channel_name: &str) -> Option<ChannelPhase> {
        self.inner
            .channels
            .lock()
            .get(channel_name)
            .map(|channel| channel.phase)
    }

    pub fn retry_attempts(&self, channel_name: &str) -> u32 {
        self.inner
            .channels
            .lock()
            .get(channel_name)
            .map_or(0, |channel| channel.attempts)
    }

    pub fn has_pending_retry(&self, channel_name: &str) -> bool {
        self.inner
            .channels
            .lock()
            .get(channel_name)
            .is_some_and(|channel| channel.retry.is_some())
    }

    pub fn tracked_channels(&self) -> Vec<String> {
        self.inner.channels.lock().keys().cloned().collect()
    }

    /// Delay before the next retry of `attempt` (0-indexed), jitter included.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.inner.policy.delay_for(attempt)
    }
}

/// Handle returned by [`RealtimeManager::subscribe`]. Unsubscribing is
/// idempotent; dropping the handle unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    detach: Detach,
    manager: Weak<ManagerInner>,
    channel_name: String,
    released: AtomicBool,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.detach.detach();
        if let Some(inner) = self.manager.upgrade() {
            inner.release(&self.channel_name);
        }
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
