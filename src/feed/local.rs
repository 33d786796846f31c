use super::models::{ChangePayload, ChannelStatus, EventSpec};
use super::transport::{ChangeFeedTransport, PayloadHandler, StatusHandler, TransportHandle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

struct LocalChannel {
    name: String,
    spec: EventSpec,
    on_change: PayloadHandler,
    on_status: StatusHandler,
}

#[derive(Default)]
struct LocalState {
    next_handle: u64,
    channels: HashMap<TransportHandle, LocalChannel>,
    subscribe_calls: usize,
    remove_calls: usize,
}

/// In-process change feed. Writers call [`LocalChangeFeed::publish`]; every live
/// channel whose spec matches gets the payload synchronously.
///
/// With `auto_subscribe` the feed acknowledges each subscription with
/// SUBSCRIBED on the next scheduler turn. Without it, callers drive statuses
/// through [`LocalChangeFeed::emit_status`], which is what tests use.
#[derive(Clone)]
pub struct LocalChangeFeed {
    state: Arc<Mutex<LocalState>>,
    auto_subscribe: bool,
}

impl LocalChangeFeed {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LocalState::default())),
            auto_subscribe: true,
        }
    }

    pub fn manual() -> Self {
        Self {
            auto_subscribe: false,
            ..Self::new()
        }
    }

    /// Delivers a change to every matching channel. Returns the number of
    /// channels it reached.
    pub fn publish(&self, payload: ChangePayload) -> usize {
        let targets: Vec<PayloadHandler> = {
            let state = self.state.lock();
            state
                .channels
                .values()
                .filter(|channel| channel.spec.matches(&payload))
                .map(|channel| channel.on_change.clone())
                .collect()
        };
        for handler in &targets {
            handler(payload.clone());
        }
        targets.len()
    }

    /// Delivers a change to the live channels with this name, skipping spec
    /// matching.
    pub fn publish_to(&self, channel_name: &str, payload: ChangePayload) -> usize {
        let targets: Vec<PayloadHandler> = {
            let state = self.state.lock();
            state
                .channels
                .values()
                .filter(|channel| channel.name == channel_name)
                .map(|channel| channel.on_change.clone())
                .collect()
        };
        for handler in &targets {
            handler(payload.clone());
        }
        targets.len()
    }

    /// Reports a status to the live channels with this name.
    pub fn emit_status(&self, channel_name: &str, status: ChannelStatus) -> usize {
        let targets: Vec<StatusHandler> = {
            let state = self.state.lock();
            state
                .channels
                .values()
                .filter(|channel| channel.name == channel_name)
                .map(|channel| channel.on_status.clone())
                .collect()
        };
        for handler in &targets {
            handler(status);
        }
        targets.len()
    }

    /// Fails every live channel with CHANNEL_ERROR, as a dropped socket would.
    pub fn interrupt(&self) -> usize {
        let targets: Vec<StatusHandler> = {
            let state = self.state.lock();
            state
                .channels
                .values()
                .map(|channel| channel.on_status.clone())
                .collect()
        };
        for handler in &targets {
            handler(ChannelStatus::ChannelError);
        }
        targets.len()
    }

    /// Total `subscribe` calls seen, including ones since removed.
    pub fn subscribe_calls(&self) -> usize {
        self.state.lock().subscribe_calls
    }

    pub fn remove_calls(&self) -> usize {
        self.state.lock().remove_calls
    }

    /// Live channels registered under `channel_name`.
    pub fn live_channels(&self, channel_name: &str) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .filter(|channel| channel.name == channel_name)
            .count()
    }
}

impl Default for LocalChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeedTransport for LocalChangeFeed {
    fn subscribe(
        &self,
        channel_name: &str,
        spec: &EventSpec,
        on_change: PayloadHandler,
        on_status: StatusHandler,
    ) -> TransportHandle {
        let handle = {
            let mut state = self.state.lock();
            state.next_handle += 1;
            state.subscribe_calls += 1;
            let handle = TransportHandle(state.next_handle);
            state.channels.insert(
                handle,
                LocalChannel {
                    name: channel_name.to_string(),
                    spec: spec.clone(),
                    on_change,
                    on_status,
                },
            );
            handle
        };

        if self.auto_subscribe {
            let state = self.state.clone();
            tokio::spawn(async move {
                let status = state
                    .lock()
                    .channels
                    .get(&handle)
                    .map(|channel| channel.on_status.clone());
                if let Some(on_status) = status {
                    on_status(ChannelStatus::Subscribed);
                }
            });
        }

        handle
    }

    fn remove_channel(&self, handle: TransportHandle) {
        let mut state = self.state.lock();
        if state.channels.remove(&handle).is_some() {
            state.remove_calls += 1;
        }
    }
}
