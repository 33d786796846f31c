use crate::realtime::ConnectionState;
use crate::results::{PollSnapshot, ResultsEvent, ResultsMode};
use axum::response::sse::Event;
use serde_json::{Value, json};

/// One frame of the per-poll live stream.
#[derive(Debug, Clone)]
pub enum LiveEvent {
    Init {
        poll: PollSnapshot,
        mode: ResultsMode,
    },
    VoteUpdate(PollSnapshot),
    Results {
        poll_id: String,
        event: ResultsEvent,
    },
    Status(ConnectionState),
    Error(String),
}

impl LiveEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LiveEvent::Init { .. } => "init",
            LiveEvent::VoteUpdate(_) => "vote_update",
            LiveEvent::Results { event, .. } => match event {
                ResultsEvent::Milestone { .. } => "milestone",
                ResultsEvent::ModeChanged(_) => "mode",
                ResultsEvent::TransportError(_) | ResultsEvent::ReconnectRequired => "status",
                ResultsEvent::PollClosed => "poll_closed",
            },
            LiveEvent::Status(_) => "status",
            LiveEvent::Error(_) => "error",
        }
    }

    pub fn data(&self) -> Value {
        match self {
            LiveEvent::Init { poll, mode } => json!({
                "poll": poll,
                "mode": mode,
            }),
            LiveEvent::VoteUpdate(poll) => json!({
                "poll": poll,
                "total_votes": poll.total_votes,
            }),
            LiveEvent::Results { poll_id, event } => match event {
                ResultsEvent::Milestone {
                    option_id,
                    vote_count,
                } => json!({
                    "poll_id": poll_id,
                    "option_id": option_id,
                    "vote_count": vote_count,
                }),
                ResultsEvent::ModeChanged(mode) => json!({"poll_id": poll_id, "mode": mode}),
                ResultsEvent::TransportError(message) => json!({"error": message}),
                ResultsEvent::ReconnectRequired => json!({"reconnect_required": true}),
                ResultsEvent::PollClosed => json!({"poll_id": poll_id}),
            },
            LiveEvent::Status(state) => json!(state),
            LiveEvent::Error(message) => json!({"error": message}),
        }
    }

    pub fn into_event(self) -> Event {
        Event::default().event(self.name()).data(self.data().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let closed = LiveEvent::Results {
            poll_id: "p1".to_string(),
            event: ResultsEvent::PollClosed,
        };
        assert_eq!(closed.name(), "poll_closed");
        assert_eq!(closed.data(), json!({"poll_id": "p1"}));

        let mode = LiveEvent::Results {
            poll_id: "p1".to_string(),
            event: ResultsEvent::ModeChanged(ResultsMode::Polling),
        };
        assert_eq!(mode.name(), "mode");
        assert_eq!(mode.data()["mode"], "polling");
    }

    #[test]
    fn test_status_is_camel_case() {
        let data = LiveEvent::Status(ConnectionState::default()).data();
        assert_eq!(data["isConnected"], false);
        assert_eq!(data["retryCount"], 0);
    }
}
