use crate::error::ApiError;
use crate::realtime::ConnectionState;
use crate::results::PollSnapshot;
use crate::startup::AppState;
use axum::{
    Json,
    extract::{Extension, Path},
};
use tracing::info;

pub async fn realtime_status(Extension(app_state): Extension<AppState>) -> Json<ConnectionState> {
    Json(app_state.manager.current_state())
}

pub async fn realtime_reconnect(
    Extension(app_state): Extension<AppState>,
) -> Json<ConnectionState> {
    info!("reconnect requested");
    app_state.manager.force_reconnect();
    Json(app_state.manager.current_state())
}

/// Current poll state, straight from the REST backend.
pub async fn poll_snapshot(
    Extension(app_state): Extension<AppState>,
    Path(poll_id): Path<String>,
) -> Result<Json<PollSnapshot>, ApiError> {
    let snapshot = app_state.api.fetch_poll(&poll_id).await?;
    Ok(Json(snapshot))
}
