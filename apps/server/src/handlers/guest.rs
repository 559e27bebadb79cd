use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::guarantee::{ChargeOutcome, ChargeReason, GuaranteeManager};
use crate::handlers::availability::validate_interval;
use crate::handlers::{bad_request, conflict, internal_error, not_found, HandlerError};
use crate::models::*;
use crate::{store, AppState};

fn payment_required(msg: impl Into<String>) -> HandlerError {
    (StatusCode::PAYMENT_REQUIRED, Json(ApiResponse::error(msg)))
}

fn validate_customer(info: &CustomerInfo) -> Result<(), HandlerError> {
    if info.name.trim().is_empty() || info.phone.trim().is_empty() {
        return Err(bad_request("name and phone are required"));
    }
    if !info.email.contains('@') {
        return Err(bad_request("a valid email is required"));
    }
    Ok(())
}

fn guest_actor(info: &CustomerInfo) -> String {
    format!("Guest: {}", info.email.to_lowercase())
}

async fn load_detail(
    db: &sqlx::SqlitePool,
    booking: Booking,
) -> Result<BookingDetail, HandlerError> {
    let services = store::booking_services(db, booking.id)
        .await
        .map_err(|e| internal_error("load_detail", e))?;
    Ok(BookingDetail {
        identity: booking.identity(),
        booking,
        services,
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(
        e.as_database_error().map(|d| d.kind()),
        Some(sqlx::error::ErrorKind::UniqueViolation)
    )
}

/// POST /api/guest-bookings/check-payment-eligibility
///
/// First-time customers and customers with a clean no-show record may pay
/// at the venue; everyone else must put a card on file first.
pub async fn check_payment_eligibility(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EmailPhoneRequest>,
) -> Result<Json<ApiResponse<EligibilityResponse>>, HandlerError> {
    let guest = store::find_guest(&state.db, &req.email, &req.phone)
        .await
        .map_err(|e| internal_error("check_payment_eligibility", e))?;

    let no_show_count = guest.as_ref().map(|g| g.no_show_count).unwrap_or(0);
    let can_pay_at_venue = GuaranteeManager::pay_at_venue_allowed(guest.as_ref());
    let message = if can_pay_at_venue {
        "You can pay at the venue".into()
    } else {
        "A card payment guarantee is required due to previous no-shows".into()
    };

    Ok(Json(ApiResponse::success(EligibilityResponse {
        can_pay_at_venue,
        no_show_count,
        message,
    })))
}

/// POST /api/guest-bookings/create-setup-intent — start card-on-file setup.
pub async fn create_setup_intent(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSetupIntentRequest>,
) -> Result<Json<ApiResponse<CreateSetupIntentResponse>>, HandlerError> {
    validate_customer(&req.customer_info)?;

    let (intent, guest_customer_id) = state
        .guarantees
        .establish(&req.customer_info)
        .await
        .map_err(|e| internal_error("create_setup_intent", e))?;

    Ok(Json(ApiResponse::success(CreateSetupIntentResponse {
        client_secret: intent.client_secret,
        setup_intent_id: intent.id,
        guest_customer_id,
    })))
}

/// POST /api/guest-bookings/create — create a booking.
///
/// Validation order: input shape, policy acceptance, eligibility, card
/// setup verification, slot availability, then the insert. The partial
/// unique index backs up the availability check, so a lost race surfaces
/// as a 409 here rather than a double booking.
pub async fn create_booking(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateGuestBookingRequest>,
) -> Result<Json<ApiResponse<CreateGuestBookingResponse>>, HandlerError> {
    validate_customer(&req.customer_info)?;
    let date = req.date.ok_or_else(|| bad_request("date is required"))?;
    let time = req.time.ok_or_else(|| bad_request("time is required"))?;
    if req.services.is_empty() {
        return Err(bad_request("at least one service is required"));
    }
    if !req.cancellation_policy_accepted {
        return Err(bad_request("cancellation policy must be accepted"));
    }

    // Resolve line items against the live catalogue; totals are computed
    // server-side, never taken from the client.
    let mut items: Vec<(i64, String, i64, i64)> = Vec::new();
    let mut total_price = 0;
    let mut total_duration = 0;
    for selection in &req.services {
        let service = store::find_service(&state.db, selection.service_id)
            .await
            .map_err(|e| internal_error("create_booking", e))?
            .ok_or_else(|| bad_request("unknown or inactive service"))?;
        total_price += service.price;
        total_duration += service.duration_min;
        items.push((service.id, service.name, service.price, service.duration_min));
    }

    let guest = store::find_guest(&state.db, &req.customer_info.email, &req.customer_info.phone)
        .await
        .map_err(|e| internal_error("create_booking", e))?;

    let wants_card = req.payment_type.as_deref() == Some("card") || req.setup_intent_id.is_some();
    let must_use_card = !GuaranteeManager::pay_at_venue_allowed(guest.as_ref());
    if must_use_card && !wants_card {
        return Err(payment_required(
            "A card payment guarantee is required due to previous no-shows",
        ));
    }

    // Card claims are verified against the gateway, not trusted.
    let confirmed = match (wants_card, &req.setup_intent_id) {
        (true, Some(setup_intent_id)) => {
            let confirmed = state
                .guarantees
                .confirm(setup_intent_id)
                .await
                .map_err(|e| internal_error("create_booking", e))?
                .ok_or_else(|| bad_request("card setup has not completed"))?;
            Some(confirmed)
        }
        (true, None) => return Err(bad_request("setupIntentId is required for card bookings")),
        (false, _) => None,
    };

    let verdict = validate_interval(
        &state,
        &date,
        &time,
        total_duration,
        req.barber.as_deref(),
        req.location.as_deref(),
    )
    .await?;
    if !verdict.available {
        return Err(conflict(verdict.message));
    }

    let guest_id = match &guest {
        Some(g) => {
            store::update_guest_payment_profile(
                &state.db,
                g.id,
                &req.customer_info.name,
                confirmed.as_ref().map(|c| c.customer_id.as_str()),
                confirmed.as_ref().map(|c| c.payment_method_id.as_str()),
            )
            .await
            .map_err(|e| internal_error("create_booking", e))?;
            g.id
        }
        None => store::insert_guest(
            &state.db,
            &req.customer_info,
            confirmed.as_ref().map(|c| c.customer_id.as_str()),
            confirmed.as_ref().map(|c| c.payment_method_id.as_str()),
        )
        .await
        .map_err(|e| internal_error("create_booking", e))?,
    };

    let payment_mode = if confirmed.is_some() {
        PaymentMode::CardOnFile
    } else {
        PaymentMode::PayAtVenue
    };
    let new = store::NewBooking {
        guest_customer_id: Some(guest_id),
        customer: &req.customer_info,
        barber: req.barber.as_deref(),
        location: req.location.as_deref(),
        date: &date,
        time: &time,
        total_price,
        total_duration,
        payment_mode,
        stripe_customer_id: confirmed.as_ref().map(|c| c.customer_id.as_str()),
        stripe_setup_intent_id: confirmed.as_ref().map(|c| c.setup_intent_id.as_str()),
        stripe_payment_method_id: confirmed.as_ref().map(|c| c.payment_method_id.as_str()),
        card_setup_complete: confirmed.is_some(),
        notes: req.notes.as_deref(),
    };
    // Booking row, line items and the creation audit entry commit as one
    // transaction; a lost slot race rolls the whole thing back.
    let actor = guest_actor(&req.customer_info);
    let details = format!("{} {} total={}", date, time, total_price);
    let booking_id = match store::create_booking(&state.db, &new, &items, &actor, &details).await {
        Ok(id) => id,
        Err(e) if is_unique_violation(&e) => {
            return Err(conflict("This time was just booked by someone else"));
        }
        Err(e) => return Err(internal_error("create_booking", e)),
    };

    // Customers with a no-show history prepay the full amount up front.
    // Spawned and awaited so a client disconnect cannot abandon the charge
    // halfway.
    let mut charged = false;
    let prepay = guest.as_ref().map(|g| g.no_show_count > 0).unwrap_or(false);
    if prepay && confirmed.is_some() {
        let manager = state.guarantees.clone();
        let actor = actor.clone();
        let outcome = tokio::spawn(async move {
            manager
                .charge_booking(booking_id, ChargeReason::Prepayment, &actor)
                .await
        })
        .await
        .map_err(|e| internal_error("create_booking", e))?
        .map_err(|e| internal_error("create_booking", e))?;
        charged = matches!(outcome, ChargeOutcome::Charged { .. });
    }

    let booking = store::find_booking(&state.db, booking_id)
        .await
        .map_err(|e| internal_error("create_booking", e))?
        .ok_or_else(|| internal_error("create_booking", "booking vanished after insert"))?;
    let detail = load_detail(&state.db, booking).await?;

    let (payment_type, message) = if confirmed.is_some() {
        (
            "card".to_string(),
            if charged {
                "Booking confirmed and prepaid".to_string()
            } else {
                "Booking confirmed with card guarantee".to_string()
            },
        )
    } else {
        ("pay_at_venue".to_string(), "Booking confirmed".to_string())
    };

    Ok(Json(ApiResponse::success(CreateGuestBookingResponse {
        booking: detail,
        payment_required: prepay,
        charged,
        payment_type,
        message,
    })))
}

/// POST /api/guest-bookings/by-email-phone — a guest's booking history.
pub async fn bookings_by_email_phone(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EmailPhoneRequest>,
) -> Result<Json<ApiResponse<GuestBookingsResponse>>, HandlerError> {
    let guest = store::find_guest(&state.db, &req.email, &req.phone)
        .await
        .map_err(|e| internal_error("bookings_by_email_phone", e))?;

    let mut details = Vec::new();
    if let Some(guest) = &guest {
        let bookings = store::bookings_for_guest(&state.db, guest.id)
            .await
            .map_err(|e| internal_error("bookings_by_email_phone", e))?;
        for booking in bookings {
            details.push(load_detail(&state.db, booking).await?);
        }
    }

    Ok(Json(ApiResponse::success(GuestBookingsResponse {
        bookings: details,
        customer: guest,
    })))
}

/// DELETE /api/guest-bookings/{id}/cancel
///
/// The caller must prove ownership with the booking's email and phone.
/// Cancellations under 24 hours out charge the full price against the
/// stored guarantee; the cancellation itself goes through regardless of
/// whether that charge succeeds.
pub async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<CancelGuestBookingRequest>,
) -> Result<Json<ApiResponse<CancelBookingResponse>>, HandlerError> {
    let booking = store::find_booking(&state.db, id)
        .await
        .map_err(|e| internal_error("cancel_booking", e))?
        .ok_or_else(|| not_found("Booking not found"))?;

    let owns = booking.customer_email.eq_ignore_ascii_case(&req.email)
        && booking.customer_phone == req.phone;
    if !owns {
        return Err(not_found("Booking not found"));
    }

    if !booking.status.can_transition_to(BookingStatus::Cancelled) {
        return Err(conflict(format!(
            "Cannot cancel a {} booking",
            booking.status.as_str()
        )));
    }

    let reason = req.reason.as_deref().unwrap_or("cancelled by customer");
    store::mark_cancelled(&state.db, id, reason)
        .await
        .map_err(|e| internal_error("cancel_booking", e))?;

    let actor = format!("Guest: {}", req.email.to_lowercase());
    store::append_audit(&state.db, id, "booking_cancelled", &actor, reason)
        .await
        .map_err(|e| internal_error("cancel_booking", e))?;

    // Late-cancel policy runs after the cancellation is durable; spawned
    // and awaited so a dropped connection cannot interrupt the charge.
    let manager = state.guarantees.clone();
    let date = booking.date.clone();
    let time = booking.time.clone();
    let policy_actor = actor.clone();
    let (charged, amount) = tokio::spawn(async move {
        manager
            .handle_cancellation(id, &date, &time, &policy_actor)
            .await
    })
    .await
    .map_err(|e| internal_error("cancel_booking", e))?
    .map_err(|e| internal_error("cancel_booking", e))?;

    let message = if charged {
        "Booking cancelled. The late cancellation fee was charged to your card".into()
    } else {
        "Booking cancelled".into()
    };
    Ok(Json(ApiResponse::success(CancelBookingResponse {
        message,
        charged,
        amount,
    })))
}

// ── Tests ──
