use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;

use crate::auth::{extract_staff, require_admin};
use crate::guarantee::{ChargeOutcome, ChargeReason};
use crate::handlers::{bad_request, conflict, internal_error, not_found, HandlerError};
use crate::models::*;
use crate::{store, AppState};

async fn load_detail(
    db: &sqlx::SqlitePool,
    booking: Booking,
) -> Result<BookingDetail, HandlerError> {
    let services = store::booking_services(db, booking.id)
        .await
        .map_err(|e| internal_error("admin_load_detail", e))?;
    Ok(BookingDetail {
        identity: booking.identity(),
        booking,
        services,
    })
}

/// GET /api/admin/bookings?date=&status= — day sheet / filtered list.
pub async fn list_bookings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AdminBookingsQuery>,
) -> Result<Json<ApiResponse<Vec<BookingDetail>>>, HandlerError> {
    extract_staff(&state.staff, &headers)?;

    if let Some(status) = &query.status {
        if BookingStatus::parse(status).is_none() {
            return Err(bad_request("unknown status filter"));
        }
    }

    let bookings = store::list_bookings(&state.db, query.date.as_deref(), query.status.as_deref())
        .await
        .map_err(|e| internal_error("admin_list_bookings", e))?;

    let mut details = Vec::with_capacity(bookings.len());
    for booking in bookings {
        details.push(load_detail(&state.db, booking).await?);
    }
    Ok(Json(ApiResponse::success(details)))
}

/// GET /api/admin/bookings/{id} — full inspection with both trails.
pub async fn booking_detail(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<BookingInspection>>, HandlerError> {
    extract_staff(&state.staff, &headers)?;

    let booking = store::find_booking(&state.db, id)
        .await
        .map_err(|e| internal_error("admin_booking_detail", e))?
        .ok_or_else(|| not_found("Booking not found"))?;
    let detail = load_detail(&state.db, booking).await?;
    let audit_log = store::audit_log(&state.db, id)
        .await
        .map_err(|e| internal_error("admin_booking_detail", e))?;
    let charge_attempts = store::charge_attempts(&state.db, id)
        .await
        .map_err(|e| internal_error("admin_booking_detail", e))?;

    Ok(Json(ApiResponse::success(BookingInspection {
        detail,
        audit_log,
        charge_attempts,
    })))
}

/// PUT /api/admin/bookings/{id}/status — move the lifecycle forward.
/// Illegal transitions are refused; legal ones land in the audit trail.
pub async fn update_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<Json<ApiResponse<BookingDetail>>, HandlerError> {
    let staff = extract_staff(&state.staff, &headers)?;

    let target = BookingStatus::parse(&req.status).ok_or_else(|| bad_request("unknown status"))?;

    let booking = store::find_booking(&state.db, id)
        .await
        .map_err(|e| internal_error("admin_update_status", e))?
        .ok_or_else(|| not_found("Booking not found"))?;

    if !booking.status.can_transition_to(target) {
        return Err(conflict(format!(
            "Cannot move a {} booking to {}",
            booking.status.as_str(),
            target.as_str()
        )));
    }

    if target == BookingStatus::Cancelled {
        store::mark_cancelled(&state.db, id, "cancelled by staff")
            .await
            .map_err(|e| internal_error("admin_update_status", e))?;
    } else {
        store::set_booking_status(&state.db, id, target)
            .await
            .map_err(|e| internal_error("admin_update_status", e))?;
    }

    store::append_audit(
        &state.db,
        id,
        "status_changed",
        &staff.actor(),
        &format!("{} -> {}", booking.status.as_str(), target.as_str()),
    )
    .await
    .map_err(|e| internal_error("admin_update_status", e))?;

    // Staff cancellations run the same late-cancel policy as guest
    // self-service; spawned and awaited so a dropped connection cannot
    // interrupt the charge.
    if target == BookingStatus::Cancelled {
        let manager = state.guarantees.clone();
        let date = booking.date.clone();
        let time = booking.time.clone();
        let actor = staff.actor();
        tokio::spawn(async move {
            manager.handle_cancellation(id, &date, &time, &actor).await
        })
        .await
        .map_err(|e| internal_error("admin_update_status", e))?
        .map_err(|e| internal_error("admin_update_status", e))?;
    }

    let updated = store::find_booking(&state.db, id)
        .await
        .map_err(|e| internal_error("admin_update_status", e))?
        .ok_or_else(|| not_found("Booking not found"))?;
    Ok(Json(ApiResponse::success(
        load_detail(&state.db, updated).await?,
    )))
}

fn charge_response(outcome: ChargeOutcome) -> Result<Json<ApiResponse<ChargeResponse>>, HandlerError> {
    match outcome {
        ChargeOutcome::Charged { amount } => Ok(Json(ApiResponse::success(ChargeResponse {
            charged: true,
            amount,
            message: "Payment charged".into(),
        }))),
        ChargeOutcome::AlreadyPaid => Err(conflict("Booking is already paid")),
        ChargeOutcome::NoGuarantee => Err(bad_request("Booking has no card on file")),
        ChargeOutcome::ZeroAmount => Err(bad_request("Booking total is zero")),
        ChargeOutcome::Failed { error } => Err((
            StatusCode::BAD_GATEWAY,
            Json(ApiResponse::error(format!("Charge failed: {}", error))),
        )),
    }
}

/// POST /api/admin/bookings/{id}/charge-payment
///
/// Post-service charge: settles payment and completes the booking in one
/// step. Receptionists can run this one.
pub async fn charge_payment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<ChargeResponse>>, HandlerError> {
    let staff = extract_staff(&state.staff, &headers)?;

    let outcome = state
        .guarantees
        .charge_booking(id, ChargeReason::ServiceCompleted, &staff.actor())
        .await
        .map_err(|e| internal_error("admin_charge_payment", e))?;
    charge_response(outcome)
}

/// POST /api/admin/bookings/{id}/retry-charge — admin-only retry after a
/// failed policy charge, with an explicit reason.
pub async fn retry_charge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<RetryChargeRequest>,
) -> Result<Json<ApiResponse<ChargeResponse>>, HandlerError> {
    let staff = require_admin(&state.staff, &headers)?;

    let reason = match req.reason.as_deref() {
        Some("no_show") => ChargeReason::NoShow,
        Some("late_cancellation") | None => ChargeReason::LateCancellation,
        Some(_) => return Err(bad_request("reason must be no_show or late_cancellation")),
    };

    let outcome = state
        .guarantees
        .charge_booking(id, reason, &staff.actor())
        .await
        .map_err(|e| internal_error("admin_retry_charge", e))?;
    charge_response(outcome)
}

/// POST /api/admin/bookings/{id}/mark-no-show
///
/// Intentionally disabled: automatic no-show charging caused too many
/// disputes. The route stays so old dashboard builds get a clear error
/// instead of a 404.
pub async fn mark_no_show(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(_id): Path<i64>,
) -> Result<Json<ApiResponse<()>>, HandlerError> {
    extract_staff(&state.staff, &headers)?;
    Err((
        StatusCode::FORBIDDEN,
        Json(ApiResponse::error(
            "No-show feature has been disabled. Use retry-charge for manual charges.",
        )),
    ))
}

/// GET /api/admin/guest-customers/{email}/{phone} — profile, history and
/// aggregate stats for one guest.
pub async fn guest_customer_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((email, phone)): Path<(String, String)>,
) -> Result<Json<ApiResponse<GuestCustomerHistory>>, HandlerError> {
    extract_staff(&state.staff, &headers)?;

    let customer = store::find_guest(&state.db, &email, &phone)
        .await
        .map_err(|e| internal_error("guest_customer_history", e))?;

    let mut details = Vec::new();
    if let Some(customer) = &customer {
        let bookings = store::bookings_for_guest(&state.db, customer.id)
            .await
            .map_err(|e| internal_error("guest_customer_history", e))?;
        for booking in bookings {
            details.push(load_detail(&state.db, booking).await?);
        }
    }

    let stats = GuestCustomerStats {
        total_bookings: details.len(),
        no_show_count: customer.as_ref().map(|c| c.no_show_count).unwrap_or(0),
        late_cancellation_count: customer
            .as_ref()
            .map(|c| c.late_cancellation_count)
            .unwrap_or(0),
        completed_bookings: details
            .iter()
            .filter(|d| d.booking.status == BookingStatus::Completed)
            .count(),
        cancelled_bookings: details
            .iter()
            .filter(|d| d.booking.status == BookingStatus::Cancelled)
            .count(),
        total_spent: details
            .iter()
            .filter(|d| d.booking.is_paid)
            .map(|d| d.booking.total_price)
            .sum(),
    };

    Ok(Json(ApiResponse::success(GuestCustomerHistory {
        customer,
        bookings: details,
        stats,
    })))
}

/// PUT /api/admin/guest-customers/{id}/notes — free-form staff notes.
pub async fn update_guest_notes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<UpdateNotesRequest>,
) -> Result<Json<ApiResponse<GuestCustomer>>, HandlerError> {
    extract_staff(&state.staff, &headers)?;

    let updated = store::update_guest_notes(&state.db, id, &req.notes)
        .await
        .map_err(|e| internal_error("update_guest_notes", e))?;
    if !updated {
        return Err(not_found("Guest customer not found"));
    }
    let customer = store::find_guest_by_id(&state.db, id)
        .await
        .map_err(|e| internal_error("update_guest_notes", e))?
        .ok_or_else(|| not_found("Guest customer not found"))?;
    Ok(Json(ApiResponse::success(customer)))
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guarantee::tests::{insert_guaranteed_booking, test_pool, MockGateway};
    use crate::clock;
    use crate::handlers::tests::test_state;
    use axum::http::{header, HeaderValue};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn admin_headers() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer tok_admin"),
        );
        h
    }

    #[tokio::test]
    async fn test_staff_cancel_inside_window_charges() {
        let db = test_pool().await;
        let gateway = Arc::new(MockGateway::new());
        let state = test_state(db.clone(), gateway.clone());

        // Appointment ten hours out: inside the late-cancel window.
        let at = clock::business_now() + chrono::Duration::hours(10);
        let date = at.format("%Y-%m-%d").to_string();
        let time = at.format("%H:%M").to_string();
        let id = insert_guaranteed_booking(&db, None, &date, &time, 2500).await;

        update_status(
            State(state),
            admin_headers(),
            Path(id),
            Json(UpdateStatusRequest {
                status: "cancelled".into(),
            }),
        )
        .await
        .unwrap();

        let booking = store::find_booking(&db, id).await.unwrap().unwrap();
        assert_eq!(booking.status, BookingStatus::Cancelled);
        assert!(booking.is_paid);
        assert_eq!(booking.payment_status, PaymentStatus::ChargedLateCancel);
        assert_eq!(gateway.charges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_staff_cancel_outside_window_is_free() {
        let db = test_pool().await;
        let gateway = Arc::new(MockGateway::new());
        let state = test_state(db.clone(), gateway.clone());
        let id = insert_guaranteed_booking(&db, None, "2030-01-10", "10:00", 2500).await;

        update_status(
            State(state),
            admin_headers(),
            Path(id),
            Json(UpdateStatusRequest {
                status: "cancelled".into(),
            }),
        )
        .await
        .unwrap();

        let booking = store::find_booking(&db, id).await.unwrap().unwrap();
        assert_eq!(booking.status, BookingStatus::Cancelled);
        assert!(!booking.is_paid);
        assert_eq!(gateway.charges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_update_status_rejects_illegal_transition() {
        let db = test_pool().await;
        let state = test_state(db.clone(), Arc::new(MockGateway::new()));
        let id = insert_guaranteed_booking(&db, None, "2030-01-10", "10:00", 2500).await;
        store::set_booking_status(&db, id, BookingStatus::Completed)
            .await
            .unwrap();

        let err = update_status(
            State(state),
            admin_headers(),
            Path(id),
            Json(UpdateStatusRequest {
                status: "pending".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::CONFLICT);
    }
}
