use super::models::{ChangePayload, ChannelStatus, EventSpec};
use std::sync::Arc;

pub type PayloadHandler = Arc<dyn Fn(ChangePayload) + Send + Sync>;
pub type StatusHandler = Arc<dyn Fn(ChannelStatus) + Send + Sync>;

/// Opaque id a transport hands out for one channel subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportHandle(pub u64);

/// Boundary to the external change-notification service.
///
/// `subscribe` never fails synchronously: problems are reported through
/// `on_status`. `remove_channel` must tolerate unknown or already removed
/// handles.
pub trait ChangeFeedTransport: Send + Sync {
    fn subscribe(
        &self,
        channel_name: &str,
        spec: &EventSpec,
        on_change: PayloadHandler,
        on_status: StatusHandler,
    ) -> TransportHandle;

    fn remove_channel(&self, handle: TransportHandle);
}
