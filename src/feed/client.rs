use super::models::{ChannelStatus, EventSpec};
use super::transport::{ChangeFeedTransport, PayloadHandler, StatusHandler, TransportHandle};
use crate::timer::{self, TimerHandle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// A subscribe attempt that has not reached SUBSCRIBED by then is timed out.
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-side reference to one upstream channel subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedHandle {
    id: Uuid,
    channel_name: String,
}

impl FeedHandle {
    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }
}

struct HandleState {
    closed: AtomicBool,
    /// Set by the first status the feed reports; the handshake is over.
    settled: AtomicBool,
    timeout: Mutex<Option<TimerHandle>>,
}

impl HandleState {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            settled: AtomicBool::new(false),
            timeout: Mutex::new(None),
        }
    }

    fn disarm_timeout(&self) {
        if let Some(timer) = self.timeout.lock().take() {
            timer.cancel();
        }
    }
}

struct OpenChannel {
    transport_handle: TransportHandle,
    state: Arc<HandleState>,
}

struct ClientInner {
    transport: Arc<dyn ChangeFeedTransport>,
    open: Mutex<HashMap<Uuid, OpenChannel>>,
}

impl ClientInner {
    /// Removes the handle and releases it upstream. Returns false when it was
    /// already gone.
    fn release(&self, id: &Uuid) -> bool {
        let Some(channel) = self.open.lock().remove(id) else {
            return false;
        };
        channel.state.closed.store(true, Ordering::SeqCst);
        channel.state.disarm_timeout();
        self.transport.remove_channel(channel.transport_handle);
        true
    }
}

/// Wraps the change-feed transport: one upstream subscription per `open`,
/// with a bounded subscribe handshake and idempotent close.
#[derive(Clone)]
pub struct ChangeFeedClient {
    inner: Arc<ClientInner>,
    subscribe_timeout: Duration,
}

impl ChangeFeedClient {
    pub fn new(transport: Arc<dyn ChangeFeedTransport>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport,
                open: Mutex::new(HashMap::new()),
            }),
            subscribe_timeout: SUBSCRIBE_TIMEOUT,
        }
    }

    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    /// Opens a subscription. Never fails synchronously; the outcome arrives on
    /// `on_status`. Must be called from within a Tokio runtime.
    pub fn open(
        &self,
        channel_name: &str,
        spec: &EventSpec,
        on_message: PayloadHandler,
        on_status: StatusHandler,
    ) -> FeedHandle {
        let id = Uuid::new_v4();
        let state = Arc::new(HandleState::new());

        let change_state = state.clone();
        let on_change: PayloadHandler = Arc::new(move |payload| {
            if !change_state.closed.load(Ordering::SeqCst) {
                on_message(payload);
            }
        });

        let status_state = state.clone();
        let forward_status = on_status.clone();
        let status: StatusHandler = Arc::new(move |status| {
            if status_state.closed.load(Ordering::SeqCst) {
                return;
            }
            // Any reported status ends the handshake, failures included.
            status_state.settled.store(true, Ordering::SeqCst);
            status_state.disarm_timeout();
            forward_status(status);
        });

        let transport_handle =
            self.inner
                .transport
                .subscribe(channel_name, spec, on_change, status);

        self.inner.open.lock().insert(
            id,
            OpenChannel {
                transport_handle,
                state: state.clone(),
            },
        );

        if !state.settled.load(Ordering::SeqCst) && !state.closed.load(Ordering::SeqCst) {
            let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
            let timed_state = state.clone();
            let name = channel_name.to_string();
            let timeout = self.subscribe_timeout;
            let timer = timer::schedule(timeout, move || {
                if timed_state.settled.load(Ordering::SeqCst) {
                    return;
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.release(&id) {
                    warn!(channel = %name, ?timeout, "subscribe handshake timed out");
                    on_status(ChannelStatus::TimedOut);
                }
            });
            *state.timeout.lock() = Some(timer);
        }

        debug!(channel = %channel_name, "opened feed subscription");
        FeedHandle {
            id,
            channel_name: channel_name.to_string(),
        }
    }

    /// Releases a subscription. Unknown or already closed handles are ignored.
    pub fn close(&self, handle: &FeedHandle) {
        if self.inner.release(&handle.id) {
            debug!(channel = %handle.channel_name, "closed feed subscription");
        }
    }

    pub fn is_open(&self, handle: &FeedHandle) -> bool {
        self.inner.open.lock().contains_key(&handle.id)
    }

    pub fn open_count(&self) -> usize {
        self.inner.open.lock().len()
    }
}
