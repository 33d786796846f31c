use chrono::{DateTime, Utc};
use serde::Serialize;

/// Observable connection status of a [`RealtimeManager`](super::RealtimeManager).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub is_connected: bool,
    pub connection_error: Option<String>,
    pub retry_count: u32,
    pub last_error_at: Option<DateTime<Utc>>,
}

/// Lifecycle of one tracked channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPhase {
    Idle,
    Connecting,
    Subscribed,
    Retrying,
    /// Retries exhausted; only `force_reconnect` leaves this phase.
    Failed,
}
