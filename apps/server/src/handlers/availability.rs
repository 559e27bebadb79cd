use axum::{
    extract::{Query, State},
    Json,
};
use std::sync::Arc;

use crate::handlers::{bad_request, internal_error, HandlerError};
use crate::models::*;
use crate::{clock, slots, store, AppState};

/// GET /api/services — active services for the booking form.
pub async fn list_services(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<Service>>>, HandlerError> {
    let services = store::list_active_services(&state.db)
        .await
        .map_err(|e| internal_error("list_services", e))?;
    Ok(Json(ApiResponse::success(services)))
}

/// GET /api/availability?date=YYYY-MM-DD&barber=X&location=Y
///
/// Returns the full annotated slot grid for the day. Without a barber
/// filter, every barber's bookings block the grid.
pub async fn check_availability(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<ApiResponse<AvailabilityResponse>>, HandlerError> {
    let date = query.date.ok_or_else(|| bad_request("date is required"))?;
    if clock::parse_local(&date, "00:00").is_none() {
        return Err(bad_request("date must be YYYY-MM-DD"));
    }

    let existing = store::occupied_intervals(
        &state.db,
        &date,
        query.barber.as_deref(),
        query.location.as_deref(),
    )
    .await
    .map_err(|e| internal_error("check_availability", e))?;

    let now = clock::business_now();
    let is_today = date == clock::business_today();
    let now_minute = now.format("%H:%M").to_string();
    let now_minute = slots::parse_time(&now_minute).unwrap_or(0);

    let grid = slots::annotate_day(&existing, is_today, now_minute);
    let available_count = grid.iter().filter(|s| s.available).count();

    Ok(Json(ApiResponse::success(AvailabilityResponse {
        date,
        barber: query.barber,
        location: query.location,
        total_slots: grid.len(),
        available_count,
        slots: grid,
    })))
}

/// POST /api/availability/validate — can this exact interval be booked?
///
/// The same check runs server-side on booking creation; this endpoint
/// only exists so the frontend can fail fast.
pub async fn validate_slot(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ValidateSlotRequest>,
) -> Result<Json<ApiResponse<ValidateSlotResponse>>, HandlerError> {
    let date = req.date.ok_or_else(|| bad_request("date is required"))?;
    let time = req.time.ok_or_else(|| bad_request("time is required"))?;
    let duration = req
        .duration
        .ok_or_else(|| bad_request("duration is required"))?;

    let verdict = validate_interval(
        &state,
        &date,
        &time,
        duration,
        req.barber.as_deref(),
        req.location.as_deref(),
    )
    .await?;
    Ok(Json(ApiResponse::success(verdict)))
}

/// Shared interval validation: grid alignment, opening hours, past check
/// and conflict detection. Used by the endpoint above and by booking
/// creation.
pub async fn validate_interval(
    state: &AppState,
    date: &str,
    time: &str,
    duration: i64,
    barber: Option<&str>,
    location: Option<&str>,
) -> Result<ValidateSlotResponse, HandlerError> {
    let refuse = |message: &str| ValidateSlotResponse {
        available: false,
        message: message.into(),
    };

    if clock::parse_local(date, time).is_none() {
        return Err(bad_request("date/time must be YYYY-MM-DD and HH:MM"));
    }
    if duration <= 0 {
        return Err(bad_request("duration must be positive"));
    }

    let Some(start) = slots::parse_time(time) else {
        return Err(bad_request("time must be HH:MM"));
    };
    if start % slots::SLOT_STEP_MIN != 0 {
        return Ok(refuse("Time must align to the 15-minute grid"));
    }
    if start < slots::OPEN_MINUTE || start + duration > slots::CLOSE_MINUTE {
        return Ok(refuse("Outside opening hours"));
    }

    let now = clock::business_now();
    match clock::hours_until(date, time, now) {
        Some(h) if h <= 0.0 => return Ok(refuse("This time is in the past")),
        Some(_) => {}
        None => return Err(bad_request("date/time must be YYYY-MM-DD and HH:MM")),
    }

    let existing = store::occupied_intervals(&state.db, date, barber, location)
        .await
        .map_err(|e| internal_error("validate_interval", e))?;

    if slots::range_conflicts(start, duration, &existing) {
        return Ok(refuse("This time is already booked"));
    }

    Ok(ValidateSlotResponse {
        available: true,
        message: "Slot is available".into(),
    })
}
