use super::models::{PollSnapshot, VoteReceipt};
use crate::error::ApiError;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// REST interface to the poll backend: read a poll, cast a vote.
#[async_trait]
pub trait PollApi: Send + Sync {
    /// `GET /api/plico/{id}`. Idempotent and side-effect free.
    async fn fetch_poll(&self, poll_id: &str) -> Result<PollSnapshot, ApiError>;

    /// `POST /api/plico/{id}/vote` with `{optionId}`.
    async fn cast_vote(&self, poll_id: &str, option_id: &str) -> Result<VoteReceipt, ApiError>;
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct HttpPollApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPollApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn poll_url(&self, poll_id: &str) -> String {
        format!("{}/api/plico/{}", self.base_url, poll_id)
    }

    async fn rejection(response: reqwest::Response) -> ApiError {
        let status = response.status();
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
        };
        ApiError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl PollApi for HttpPollApi {
    async fn fetch_poll(&self, poll_id: &str) -> Result<PollSnapshot, ApiError> {
        let url = self.poll_url(poll_id);
        debug!(%url, "fetching poll");
        let response = self.client.get(&url).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ApiError::NotFound(poll_id.to_string())),
            status if status.is_success() => {
                let mut snapshot: PollSnapshot = response.json().await?;
                snapshot.normalize(Utc::now());
                Ok(snapshot)
            }
            _ => Err(Self::rejection(response).await),
        }
    }

    async fn cast_vote(&self, poll_id: &str, option_id: &str) -> Result<VoteReceipt, ApiError> {
        let url = format!("{}/vote", self.poll_url(poll_id));
        let response = self
            .client
            .post(&url)
            .json(&json!({ "optionId": option_id }))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ApiError::NotFound(poll_id.to_string())),
            status if status.is_success() => Ok(response.json().await?),
            _ => Err(Self::rejection(response).await),
        }
    }
}
