use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::handlers::{internal_error, not_found, HandlerError};
use crate::models::*;
use crate::{store, AppState};

/// GET /api/gift-cards/{code} — balance check for the checkout form.
pub async fn lookup(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<ApiResponse<GiftCard>>, HandlerError> {
    let card = store::find_gift_card(&state.db, &code)
        .await
        .map_err(|e| internal_error("gift_card_lookup", e))?
        .ok_or_else(|| not_found("Gift card not found"))?;
    Ok(Json(ApiResponse::success(card)))
}
