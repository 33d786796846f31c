use crate::config::Config;
use crate::feed::{ChangeFeedClient, PhoenixTransport};
use crate::realtime::{RealtimeManager, RetryPolicy, SubscriptionRegistry};
use crate::results::{HttpPollApi, PollApi, ResultsConfig};
use crate::sse::{poll_results_sse, poll_snapshot, realtime_reconnect, realtime_status};
use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::time::{Duration, interval};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub manager: RealtimeManager,
    pub api: Arc<dyn PollApi>,
    pub results: ResultsConfig,
}

impl AppState {
    pub fn new(manager: RealtimeManager, api: Arc<dyn PollApi>, results: ResultsConfig) -> Self {
        AppState {
            manager,
            api,
            results,
        }
    }

    /// Wires the production stack. Must be called within a Tokio runtime.
    pub fn from_config(config: &Config) -> Self {
        let transport = Arc::new(PhoenixTransport::connect(
            &config.realtime_url,
            &config.realtime_key,
        ));
        let client = ChangeFeedClient::new(transport).with_subscribe_timeout(config.subscribe_timeout);
        let registry = SubscriptionRegistry::new(client, config.environment.teardown_delay());
        let manager = RealtimeManager::new(registry, RetryPolicy::default());

        let api = Arc::new(HttpPollApi::new(config.api_url.as_str()));
        let results = ResultsConfig {
            polling_interval: config.polling_interval,
            ..ResultsConfig::default()
        };

        let state = AppState::new(manager, api, results);
        state.spawn_status_log();
        state
    }

    fn spawn_status_log(&self) {
        let manager = self.manager.clone();
        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let state = manager.current_state();
                let channels = manager.tracked_channels().len();
                if state.is_connected || channels == 0 {
                    info!(channels, "realtime connection healthy");
                } else {
                    warn!(
                        channels,
                        retry_count = state.retry_count,
                        error = state.connection_error.as_deref().unwrap_or("none"),
                        "realtime connection degraded"
                    );
                }
            }
        });
    }
}

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/plico/:id", get(poll_snapshot))
        .route("/api/plico/:id/live", get(poll_results_sse))
        .route("/api/realtime/status", get(realtime_status))
        .route("/api/realtime/reconnect", post(realtime_reconnect))
        .layer(Extension(app_state))
}
