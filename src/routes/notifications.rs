use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dto::notification_dto::{
        CleanupRequest, DispatchRequest, LogQuery, RetryBulkRequest, StatsQuery,
    },
    error::Result,
    middleware::auth::Claims,
    AppState,
};

const DEFAULT_STATS_DAYS: u32 = 7;

#[axum::debug_handler]
pub async fn dispatch(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<DispatchRequest>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let outcome = state
        .notification_service
        .dispatch(payload.into_command(Some(claims.sub)))
        .await?;

    // partial success is reported, not failed
    let status = if outcome.success {
        StatusCode::ACCEPTED
    } else if outcome.log_ids.is_empty() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::MULTI_STATUS
    };
    Ok((status, Json(outcome)))
}

pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse> {
    let view = state.notification_service.get_status(&job_id).await?;
    Ok(Json(view))
}

pub async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<impl IntoResponse> {
    let filter = query.filter()?;
    let page = state
        .history_service
        .query_logs(&filter, query.page())
        .await?;
    Ok(Json(page))
}

pub async fn get_log(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let log = state.history_service.get_log(id).await?;
    Ok(Json(log))
}

pub async fn delete_log(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    state.history_service.delete(id).await?;
    Ok(Json(json!({ "deleted": true, "id": id })))
}

pub async fn retry_log(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let outcome = state
        .notification_service
        .retry(id, Some(&claims.sub))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

pub async fn cancel_log(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let outcome = state
        .notification_service
        .cancel(id, Some(&claims.sub))
        .await?;
    Ok(Json(outcome))
}

pub async fn retry_bulk(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<RetryBulkRequest>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let cmd = payload.into_command(Some(claims.sub))?;
    let outcome = state.notification_service.retry_bulk(cmd).await?;
    Ok(Json(outcome))
}

pub async fn cleanup(
    State(state): State<AppState>,
    Json(payload): Json<CleanupRequest>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let outcome = state
        .history_service
        .cleanup(payload.into_command()?)
        .await?;
    Ok(Json(outcome))
}

pub async fn stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<impl IntoResponse> {
    let stats = state
        .history_service
        .stats(query.since_days.unwrap_or(DEFAULT_STATS_DAYS))
        .await?;
    Ok(Json(stats))
}
