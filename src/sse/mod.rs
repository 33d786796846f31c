pub mod models;
pub use models::*;

mod poll_results_sse;
mod realtime_status;

pub use poll_results_sse::poll_results_sse;
pub use realtime_status::{poll_snapshot, realtime_reconnect, realtime_status};
