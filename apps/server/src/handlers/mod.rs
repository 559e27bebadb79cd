pub mod admin;
pub mod availability;
pub mod gift_cards;
pub mod guest;
pub mod health;
pub mod webhook;

use axum::http::StatusCode;
use axum::Json;

use crate::models::ApiResponse;

/// Error half of every handler's return type.
pub type HandlerError = (StatusCode, Json<ApiResponse<()>>);

pub fn bad_request(msg: impl Into<String>) -> HandlerError {
    (StatusCode::BAD_REQUEST, Json(ApiResponse::error(msg)))
}

pub fn not_found(msg: impl Into<String>) -> HandlerError {
    (StatusCode::NOT_FOUND, Json(ApiResponse::error(msg)))
}

pub fn conflict(msg: impl Into<String>) -> HandlerError {
    (StatusCode::CONFLICT, Json(ApiResponse::error(msg)))
}

pub fn internal_error(context: &str, err: impl std::fmt::Display) -> HandlerError {
    tracing::error!("{}: {}", context, err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::error("Internal server error")),
    )
}
