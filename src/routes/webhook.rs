use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};

use crate::{error::Result, AppState};

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Provider delivery callbacks. The body is taken raw so the HMAC covers the exact bytes sent.
pub async fn handle_provider_event(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    let ack = state
        .webhook_service
        .handle(&provider, &body, signature)
        .await?;
    Ok(Json(ack))
}
