use crate::feed::{
    ChangeFeedClient, ChangePayload, ChannelStatus, EventSpec, FeedHandle, PayloadHandler,
    StatusHandler,
};
use crate::timer::{self, TimerHandle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// The callbacks one local consumer attaches to a channel.
#[derive(Clone)]
pub struct Listener {
    pub on_message: PayloadHandler,
    pub on_error: Option<StatusHandler>,
    pub on_connect: Option<Callback>,
    pub on_disconnect: Option<Callback>,
}

impl Listener {
    pub fn new(on_message: impl Fn(ChangePayload) + Send + Sync + 'static) -> Self {
        Self {
            on_message: Arc::new(on_message),
            on_error: None,
            on_connect: None,
            on_disconnect: None,
        }
    }

    pub fn on_error(mut self, f: impl Fn(ChannelStatus) + Send + Sync + 'static) -> Self {
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

type ListenerId = Uuid;

struct ChannelEntry {
    spec: EventSpec,
    handle: Option<FeedHandle>,
    listeners: Vec<(ListenerId, Arc<Listener>)>,
    teardown: Option<TimerHandle>,
    generation: u64,
}

struct RegistryInner {
    client: ChangeFeedClient,
    teardown_delay: Duration,
    channels: Mutex<HashMap<String, ChannelEntry>>,
}

/// Runs one listener callback, containing any panic to that listener.
fn isolate(channel: &str, listener: &ListenerId, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(channel = %channel, listener = %listener, "listener panicked, continuing dispatch");
    }
}

impl RegistryInner {
    fn open_upstream(self: &Arc<Self>, channel_name: &str, generation: u64) {
        let spec = match self.channels.lock().get(channel_name) {
            Some(entry) => entry.spec.clone(),
            None => return,
        };

        let weak: Weak<RegistryInner> = Arc::downgrade(self);
        let on_message: PayloadHandler = {
            let weak = weak.clone();
            let name = channel_name.to_string();
            Arc::new(move |payload| {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch_message(&name, payload);
                }
            })
        };
        let on_status: StatusHandler = {
            let name = channel_name.to_string();
            Arc::new(move |status| {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch_status(&name, status);
                }
            })
        };

        let handle = self.client.open(channel_name, &spec, on_message, on_status);

        let stale = {
            let mut channels = self.channels.lock();
            match channels.get_mut(channel_name) {
                Some(entry) if entry.generation == generation && entry.handle.is_none() => {
                    entry.handle = Some(handle);
                    None
                }
                _ => Some(handle),
            }
        };
        if let Some(handle) = stale {
            self.client.close(&handle);
        }
    }

    fn listeners_of(&self, channel_name: &str) -> Vec<(ListenerId, Arc<Listener>)> {
        self.channels
            .lock()
            .get(channel_name)
            .map(|entry| entry.listeners.clone())
            .unwrap_or_default()
    }

    fn is_attached(&self, channel_name: &str, id: &ListenerId) -> bool {
        self.channels
            .lock()
            .get(channel_name)
            .is_some_and(|entry| entry.listeners.iter().any(|(lid, _)| lid == id))
    }

    fn dispatch_message(&self, channel_name: &str, payload: ChangePayload) {
        for (id, listener) in self.listeners_of(channel_name) {
            // A listener detached by an earlier callback in this loop is skipped.
            if !self.is_attached(channel_name, &id) {
                continue;
            }
            let payload = payload.clone();
            isolate(channel_name, &id, || (listener.on_message)(payload));
        }
    }

    fn dispatch_status(&self, channel_name: &str, status: ChannelStatus) {
        debug!(channel = %channel_name, %status, "channel status");
        for (id, listener) in self.listeners_of(channel_name) {
            if !self.is_attached(channel_name, &id) {
                continue;
            }
            match status {
                ChannelStatus::Subscribed => {
                    if let Some(on_connect) = &listener.on_connect {
                        isolate(channel_name, &id, || on_connect());
                    }
                }
                ChannelStatus::ChannelError | ChannelStatus::TimedOut => {
                    if let Some(on_disconnect) = &listener.on_disconnect {
                        isolate(channel_name, &id, || on_disconnect());
                    }
                    if let Some(on_error) = &listener.on_error {
                        isolate(channel_name, &id, || on_error(status));
                    }
                }
                ChannelStatus::Closed => {
                    if let Some(on_disconnect) = &listener.on_disconnect {
                        isolate(channel_name, &id, || on_disconnect());
                    }
                }
            }
        }
    }

    fn detach(self: &Arc<Self>, channel_name: &str, id: &ListenerId) {
        let handle = {
            let mut channels = self.channels.lock();
            let Some(entry) = channels.get_mut(channel_name) else {
                return;
            };
            let before = entry.listeners.len();
            entry.listeners.retain(|(lid, _)| lid != id);
            if entry.listeners.len() == before || !entry.listeners.is_empty() {
                return;
            }

            if self.teardown_delay.is_zero() {
                channels.remove(channel_name).and_then(|entry| entry.handle)
            } else {
                let weak = Arc::downgrade(self);
                let name = channel_name.to_string();
                entry.teardown = Some(timer::schedule(self.teardown_delay, move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.finish_teardown(&name);
                    }
                }));
                debug!(channel = %channel_name, delay = ?self.teardown_delay, "teardown scheduled");
                return;
            }
        };

        info!(channel = %channel_name, "channel torn down");
        if let Some(handle) = handle {
            self.client.close(&handle);
        }
    }

    fn finish_teardown(&self, channel_name: &str) {
        let removed = {
            let mut channels = self.channels.lock();
            match channels.get(channel_name) {
                Some(entry) if entry.listeners.is_empty() => channels.remove(channel_name),
                _ => None,
            }
        };
        if let Some(entry) = removed {
            info!(channel = %channel_name, "channel torn down");
            if let Some(handle) = entry.handle {
                self.client.close(&handle);
            }
        }
    }

    fn resubscribe(self: &Arc<Self>, channel_name: &str) -> bool {
        let (old, generation) = {
            let mut channels = self.channels.lock();
            let Some(entry) = channels.get_mut(channel_name) else {
                return false;
            };
            entry.generation += 1;
            (entry.handle.take(), entry.generation)
        };
        if let Some(old) = old {
            self.client.close(&old);
        }
        self.open_upstream(channel_name, generation);
        true
    }
}

/// Reference-counted map from channel name to one upstream feed subscription
/// plus the local listeners sharing it.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    /// `teardown_delay` of zero closes a channel as soon as its last listener
    /// leaves; otherwise the close waits that long and is cancelled by any
    /// attach in between.
    pub fn new(client: ChangeFeedClient, teardown_delay: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                client,
                teardown_delay,
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn client(&self) -> &ChangeFeedClient {
        &self.inner.client
    }

    /// Adds a listener to `channel_name`, opening the upstream subscription
    /// only if the channel is not tracked yet.
    pub fn attach(&self, channel_name: &str, spec: &EventSpec, listener: Listener) -> Detach {
        let id = Uuid::new_v4();
        let listener = Arc::new(listener);

        let created = {
            let mut channels = self.inner.channels.lock();
            match channels.get_mut(channel_name) {
                Some(entry) => {
                    if let Some(teardown) = entry.teardown.take() {
                        teardown.cancel();
                        debug!(channel = %channel_name, "pending teardown cancelled");
                    }
                    if entry.spec != *spec {
                        warn!(channel = %channel_name, "attach with a different spec, keeping the first");
                    }
                    entry.listeners.push((id, listener));
                    None
                }
                None => {
                    channels.insert(
                        channel_name.to_string(),
                        ChannelEntry {
                            spec: spec.clone(),
                            handle: None,
                            listeners: vec![(id, listener)],
                            teardown: None,
                            generation: 0,
                        },
                    );
                    Some(0)
                }
            }
        };

        if let Some(generation) = created {
            info!(channel = %channel_name, table = %spec.table, "opening channel");
            self.inner.open_upstream(channel_name, generation);
        }

        Detach {
            registry: Arc::downgrade(&self.inner),
            channel_name: channel_name.to_string(),
            listener_id: id,
            detached: AtomicBool::new(false),
        }
    }

    /// Closes and reopens the upstream subscription of a tracked channel,
    /// keeping its listeners. Returns false for unknown channels.
    pub fn resubscribe(&self, channel_name: &str) -> bool {
        self.inner.resubscribe(channel_name)
    }

    pub fn ref_count(&self, channel_name: &str) -> usize {
        self.inner
            .channels
            .lock()
            .get(channel_name)
            .map_or(0, |entry| entry.listeners.len())
    }

    pub fn is_tracked(&self, channel_name: &str) -> bool {
        self.inner.channels.lock().contains_key(channel_name)
    }

    /// True while a channel has no listeners and waits for its debounced
    /// teardown.
    pub fn is_lingering(&self, channel_name: &str) -> bool {
        self.inner
            .channels
            .lock()
            .get(channel_name)
            .is_some_and(|entry| entry.listeners.is_empty() && entry.teardown.is_some())
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.inner.channels.lock().keys().cloned().collect()
    }
}

/// Releases one listener. Calling [`Detach::detach`] again, or dropping after
/// an explicit detach, does nothing.
#[must_use = "dropping a Detach releases the listener immediately"]
pub struct Detach {
    registry: Weak<RegistryInner>,
    channel_name: String,
    listener_id: ListenerId,
    detached: AtomicBool,
}

impl Detach {
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.registry.upgrade() {
            inner.detach(&self.channel_name, &self.listener_id);
        }
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }
}

impl Drop for Detach {
    fn drop(&mut self) {
        self.detach();
    }
}
