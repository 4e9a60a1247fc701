use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::AppState;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let queue_available = state.queue.is_available();
    let body = json!({
        "status": if queue_available { "ok" } else { "degraded" },
        "queue": { "available": queue_available },
    });
    (StatusCode::OK, Json(body))
}
