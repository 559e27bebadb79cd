use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;

use crate::handlers::{internal_error, HandlerError};
use crate::models::ApiResponse;
use crate::stripe;
use crate::AppState;

/// POST /api/webhooks/stripe
///
/// The body must stay raw bytes: the signature covers the exact payload,
/// so any re-serialisation would break verification. Replays are
/// deduplicated downstream by event id, so a 200 here never implies state
/// changed.
pub async fn stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<serde_json::Value>>, HandlerError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error("Missing Stripe-Signature header")),
            )
        })?;

    let now_ts = chrono::Utc::now().timestamp();
    let (event_id, event) =
        stripe::verify_and_parse(&body, signature, &state.webhook_secret, now_ts).map_err(|e| {
            tracing::warn!("Rejected webhook: {}", e);
            (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error("Invalid webhook signature")),
            )
        })?;

    state
        .guarantees
        .apply_webhook(&event_id, &event)
        .await
        .map_err(|e| internal_error("stripe_webhook", e))?;

    Ok(Json(ApiResponse::success(
        serde_json::json!({ "received": true }),
    )))
}
