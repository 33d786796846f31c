use crate::feed::ChannelStatus;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Failures reported to subscribers through `on_error`. Never returned from
/// `subscribe` itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RealtimeError {
    #[error("Channel {channel} reported {status}")]
    Transport {
        channel: String,
        status: ChannelStatus,
    },
    #[error("Channel {channel} failed after {attempts} attempts, reconnect required")]
    RetriesExhausted { channel: String, attempts: u32 },
}

impl RealtimeError {
    pub fn channel(&self) -> &str {
        match self {
            RealtimeError::Transport { channel, .. } => channel,
            RealtimeError::RetriesExhausted { channel, .. } => channel,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RealtimeError::RetriesExhausted { .. })
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Poll not found: {0}")]
    NotFound(String),
    #[error("Unknown option: {0}")]
    UnknownOption(String),
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Malformed response: {0}")]
    Decode(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing environment variable {0}")]
    Missing(String),
    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "Poll not found"),
            ApiError::UnknownOption(_) => (StatusCode::BAD_REQUEST, "Unknown option"),
            ApiError::Rejected { status, .. } => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
                "Request rejected upstream",
            ),
            ApiError::Http(_) => (StatusCode::BAD_GATEWAY, "Upstream unavailable"),
            ApiError::Decode(_) => (StatusCode::BAD_GATEWAY, "Malformed upstream response"),
        };

        let body = Json(json!({
            "error": error_message,
            "details": self.to_string()
        }));

        (status, body).into_response()
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(error: serde_json::Error) -> Self {
        ApiError::Decode(error.to_string())
    }
}
