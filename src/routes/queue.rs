use std::time::Duration;

use axum::{extract::State, response::IntoResponse, Json};

use crate::{
    dto::notification_dto::{CountResponse, QueueCleanRequest},
    error::Result,
    AppState,
};

const DEFAULT_CLEAN_AGE: Duration = Duration::from_secs(60 * 60);
const DEFAULT_CLEAN_LIMIT: usize = 1_000;

pub async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let metrics = state.queue.metrics().await?;
    Ok(Json(metrics))
}

pub async fn retry_failed(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let count = state.queue.retry_failed().await?;
    tracing::info!(count, "Failed queue jobs moved back to waiting");
    Ok(Json(CountResponse { count }))
}

pub async fn clean(
    State(state): State<AppState>,
    payload: Option<Json<QueueCleanRequest>>,
) -> Result<impl IntoResponse> {
    let Json(req) = payload.unwrap_or_default();
    let older_than = req
        .older_than_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_CLEAN_AGE);
    let count = state
        .queue
        .clean_completed(older_than, req.limit.unwrap_or(DEFAULT_CLEAN_LIMIT))
        .await?;
    Ok(Json(CountResponse { count }))
}
