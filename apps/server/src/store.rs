//! Typed queries over the document store.
//!
//! Every persistence touchpoint in the crate goes through this closed set
//! of predicates; handlers never build ad-hoc filters. The audit log and
//! charge-attempt tables only ever see INSERTs.

use sqlx::{SqliteConnection, SqlitePool};

use crate::clock;
use crate::models::*;
use crate::slots::{BookedInterval, DEFAULT_DURATION_MIN};

// ── Services ──

pub async fn list_active_services(db: &SqlitePool) -> sqlx::Result<Vec<Service>> {
    sqlx::query_as::<_, Service>(
        "SELECT id, name, description, price, duration_min, is_active, sort_order
         FROM services WHERE is_active = 1 ORDER BY sort_order ASC",
    )
    .fetch_all(db)
    .await
}

pub async fn find_service(db: &SqlitePool, id: i64) -> sqlx::Result<Option<Service>> {
    sqlx::query_as::<_, Service>(
        "SELECT id, name, description, price, duration_min, is_active, sort_order
         FROM services WHERE id = ? AND is_active = 1",
    )
    .bind(id)
    .fetch_optional(db)
    .await
}

// ── Bookings ──

pub async fn find_booking(db: &SqlitePool, id: i64) -> sqlx::Result<Option<Booking>> {
    sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
}

pub async fn find_booking_by_setup_intent(
    db: &SqlitePool,
    setup_intent_id: &str,
) -> sqlx::Result<Option<Booking>> {
    sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE stripe_setup_intent_id = ?")
        .bind(setup_intent_id)
        .fetch_optional(db)
        .await
}

/// Occupied intervals for a day: non-cancelled bookings matching the
/// optional barber/location filters, with the duration fallback chain
/// (aggregate total → legacy first line item → 30 min default) resolved
/// in SQL.
pub async fn occupied_intervals(
    db: &SqlitePool,
    date: &str,
    barber: Option<&str>,
    location: Option<&str>,
) -> sqlx::Result<Vec<BookedInterval>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT b.time,
                CASE WHEN b.total_duration > 0 THEN b.total_duration
                     ELSE COALESCE(
                        (SELECT bs.duration_min FROM booking_services bs
                          WHERE bs.booking_id = b.id ORDER BY bs.id ASC LIMIT 1),
                        ?)
                END AS duration_min
         FROM bookings b
         WHERE b.date = ?
           AND b.status != 'cancelled'
           AND (? IS NULL OR b.barber = ?)
           AND (? IS NULL OR b.location = ?)",
    )
    .bind(DEFAULT_DURATION_MIN)
    .bind(date)
    .bind(barber)
    .bind(barber)
    .bind(location)
    .bind(location)
    .fetch_all(db)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(time, duration_min)| BookedInterval { time, duration_min })
        .collect())
}

pub async fn bookings_for_guest(db: &SqlitePool, guest_id: i64) -> sqlx::Result<Vec<Booking>> {
    sqlx::query_as::<_, Booking>(
        "SELECT * FROM bookings WHERE guest_customer_id = ? ORDER BY created_at DESC, id DESC",
    )
    .bind(guest_id)
    .fetch_all(db)
    .await
}

pub async fn list_bookings(
    db: &SqlitePool,
    date: Option<&str>,
    status: Option<&str>,
) -> sqlx::Result<Vec<Booking>> {
    sqlx::query_as::<_, Booking>(
        "SELECT * FROM bookings
         WHERE (? IS NULL OR date = ?)
           AND (? IS NULL OR status = ?)
         ORDER BY date ASC, time ASC, id ASC",
    )
    .bind(date)
    .bind(date)
    .bind(status)
    .bind(status)
    .fetch_all(db)
    .await
}

/// Everything needed to insert a booking row. Totals must already be the
/// sums over the line items.
pub struct NewBooking<'a> {
    pub guest_customer_id: Option<i64>,
    pub customer: &'a CustomerInfo,
    pub barber: Option<&'a str>,
    pub location: Option<&'a str>,
    pub date: &'a str,
    pub time: &'a str,
    pub total_price: i64,
    pub total_duration: i64,
    pub payment_mode: PaymentMode,
    pub stripe_customer_id: Option<&'a str>,
    pub stripe_setup_intent_id: Option<&'a str>,
    pub stripe_payment_method_id: Option<&'a str>,
    pub card_setup_complete: bool,
    pub notes: Option<&'a str>,
}

pub async fn insert_booking(db: &SqlitePool, new: &NewBooking<'_>) -> sqlx::Result<i64> {
    let mut conn = db.acquire().await?;
    insert_booking_on(&mut conn, new).await
}

async fn insert_booking_on(
    conn: &mut SqliteConnection,
    new: &NewBooking<'_>,
) -> sqlx::Result<i64> {
    let now = clock::timestamp();
    let result = sqlx::query(
        "INSERT INTO bookings (
            guest_customer_id, customer_name, customer_email, customer_phone,
            barber, location, date, time, total_price, total_duration,
            status, payment_mode, payment_status, is_paid,
            cancellation_policy_accepted, cancellation_policy_accepted_at,
            stripe_customer_id, stripe_setup_intent_id, stripe_payment_method_id,
            card_setup_complete, notes, source, created_at, updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, 'pending', 0, 1, ?, ?, ?, ?, ?, ?, 'Website', ?, ?)",
    )
    .bind(new.guest_customer_id)
    .bind(&new.customer.name)
    .bind(&new.customer.email)
    .bind(&new.customer.phone)
    .bind(new.barber)
    .bind(new.location)
    .bind(new.date)
    .bind(new.time)
    .bind(new.total_price)
    .bind(new.total_duration)
    .bind(new.payment_mode)
    .bind(&now)
    .bind(new.stripe_customer_id)
    .bind(new.stripe_setup_intent_id)
    .bind(new.stripe_payment_method_id)
    .bind(new.card_setup_complete)
    .bind(new.notes)
    .bind(&now)
    .bind(&now)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn insert_line_items_on(
    conn: &mut SqliteConnection,
    booking_id: i64,
    items: &[(i64, String, i64, i64)], // (service_id, name, price, duration_min)
) -> sqlx::Result<()> {
    for (service_id, name, price, duration_min) in items {
        sqlx::query(
            "INSERT INTO booking_services (booking_id, service_id, service_name, price, duration_min)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(booking_id)
        .bind(service_id)
        .bind(name)
        .bind(price)
        .bind(duration_min)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Create a booking, its line items and the creation audit entry in one
/// transaction. Either the whole booking lands or nothing does; a row
/// with totals but no line items can never persist.
pub async fn create_booking(
    db: &SqlitePool,
    new: &NewBooking<'_>,
    items: &[(i64, String, i64, i64)],
    actor: &str,
    details: &str,
) -> sqlx::Result<i64> {
    let mut tx = db.begin().await?;
    let booking_id = insert_booking_on(&mut tx, new).await?;
    insert_line_items_on(&mut tx, booking_id, items).await?;
    append_audit_on(&mut tx, booking_id, "booking_created", actor, details).await?;
    tx.commit().await?;
    Ok(booking_id)
}

pub async fn booking_services(db: &SqlitePool, booking_id: i64) -> sqlx::Result<Vec<BookingService>> {
    sqlx::query_as::<_, BookingService>(
        "SELECT id, booking_id, service_id, service_name, price, duration_min
         FROM booking_services WHERE booking_id = ? ORDER BY id ASC",
    )
    .bind(booking_id)
    .fetch_all(db)
    .await
}

pub async fn set_booking_status(
    db: &SqlitePool,
    id: i64,
    status: BookingStatus,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE bookings SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(clock::timestamp())
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn mark_cancelled(db: &SqlitePool, id: i64, reason: &str) -> sqlx::Result<()> {
    let now = clock::timestamp();
    sqlx::query(
        "UPDATE bookings SET status = 'cancelled', cancellation_reason = ?,
                cancelled_at = ?, updated_at = ? WHERE id = ?",
    )
    .bind(reason)
    .bind(&now)
    .bind(&now)
    .bind(id)
    .execute(db)
    .await?;
    Ok(())
}

/// Confirm a card setup against a booking: flips `card_setup_complete` and
/// stores the captured method id.
pub async fn confirm_card_setup(
    db: &SqlitePool,
    id: i64,
    payment_method_id: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE bookings SET card_setup_complete = 1, stripe_payment_method_id = ?,
                updated_at = ? WHERE id = ?",
    )
    .bind(payment_method_id)
    .bind(clock::timestamp())
    .bind(id)
    .execute(db)
    .await?;
    Ok(())
}

/// Atomically record a successful charge. Only flips the row if it is
/// still unpaid; returns whether this call won the flip.
pub async fn apply_charge_success(
    db: &SqlitePool,
    id: i64,
    payment_status: PaymentStatus,
    payment_intent_id: &str,
    complete_booking: bool,
) -> sqlx::Result<bool> {
    let result = if complete_booking {
        sqlx::query(
            "UPDATE bookings SET payment_status = ?, is_paid = 1,
                    stripe_payment_intent_id = ?, status = 'completed', updated_at = ?
             WHERE id = ? AND is_paid = 0",
        )
    } else {
        sqlx::query(
            "UPDATE bookings SET payment_status = ?, is_paid = 1,
                    stripe_payment_intent_id = ?, updated_at = ?
             WHERE id = ? AND is_paid = 0",
        )
    }
    .bind(payment_status)
    .bind(payment_intent_id)
    .bind(clock::timestamp())
    .bind(id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Record a failed charge on the booking row (trail entries are appended
/// separately). Leaves paid bookings untouched.
pub async fn mark_charge_failed(db: &SqlitePool, id: i64) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE bookings SET payment_status = 'failed', updated_at = ?
         WHERE id = ? AND is_paid = 0",
    )
    .bind(clock::timestamp())
    .bind(id)
    .execute(db)
    .await?;
    Ok(())
}

// ── Guest customers ──

/// Lookup by the natural key: lowercased email AND phone. Matching email
/// alone is not enough — households share inboxes, not phones.
pub async fn find_guest(
    db: &SqlitePool,
    email: &str,
    phone: &str,
) -> sqlx::Result<Option<GuestCustomer>> {
    sqlx::query_as::<_, GuestCustomer>(
        "SELECT * FROM guest_customers WHERE lower(email) = lower(?) AND phone = ?",
    )
    .bind(email)
    .bind(phone)
    .fetch_optional(db)
    .await
}

pub async fn find_guest_by_id(db: &SqlitePool, id: i64) -> sqlx::Result<Option<GuestCustomer>> {
    sqlx::query_as::<_, GuestCustomer>("SELECT * FROM guest_customers WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
}

pub async fn insert_guest(
    db: &SqlitePool,
    info: &CustomerInfo,
    stripe_customer_id: Option<&str>,
    stripe_payment_method_id: Option<&str>,
) -> sqlx::Result<i64> {
    let result = sqlx::query(
        "INSERT INTO guest_customers (name, email, phone, stripe_customer_id,
                stripe_payment_method_id, created_at)
         VALUES (?, lower(?), ?, ?, ?, ?)",
    )
    .bind(&info.name)
    .bind(&info.email)
    .bind(&info.phone)
    .bind(stripe_customer_id)
    .bind(stripe_payment_method_id)
    .bind(clock::timestamp())
    .execute(db)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Refresh name and any newly captured gateway ids on an existing guest.
pub async fn update_guest_payment_profile(
    db: &SqlitePool,
    id: i64,
    name: &str,
    stripe_customer_id: Option<&str>,
    stripe_payment_method_id: Option<&str>,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE guest_customers SET name = ?,
                stripe_customer_id = COALESCE(?, stripe_customer_id),
                stripe_payment_method_id = COALESCE(?, stripe_payment_method_id)
         WHERE id = ?",
    )
    .bind(name)
    .bind(stripe_customer_id)
    .bind(stripe_payment_method_id)
    .bind(id)
    .execute(db)
    .await?;
    Ok(())
}

/// Counters only ever move up; administrative corrections go through a
/// different path than this one.
pub async fn increment_late_cancellations(db: &SqlitePool, guest_id: i64) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE guest_customers SET late_cancellation_count = late_cancellation_count + 1
         WHERE id = ?",
    )
    .bind(guest_id)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn update_guest_notes(db: &SqlitePool, id: i64, notes: &str) -> sqlx::Result<bool> {
    let result = sqlx::query("UPDATE guest_customers SET notes = ? WHERE id = ?")
        .bind(notes)
        .bind(id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() == 1)
}

// ── Append-only trails ──

pub async fn append_audit(
    db: &SqlitePool,
    booking_id: i64,
    action: &str,
    performed_by: &str,
    details: &str,
) -> sqlx::Result<()> {
    let mut conn = db.acquire().await?;
    append_audit_on(&mut conn, booking_id, action, performed_by, details).await
}

async fn append_audit_on(
    conn: &mut SqliteConnection,
    booking_id: i64,
    action: &str,
    performed_by: &str,
    details: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO booking_audit_log (booking_id, action, performed_by, performed_at, details)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(booking_id)
    .bind(action)
    .bind(performed_by)
    .bind(clock::timestamp())
    .bind(details)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn append_charge_attempt(
    db: &SqlitePool,
    booking_id: i64,
    amount: i64,
    reason: &str,
    success: bool,
    payment_intent_id: Option<&str>,
    error_message: Option<&str>,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO charge_attempts (booking_id, attempted_at, amount, reason, success,
                payment_intent_id, error_message)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(booking_id)
    .bind(clock::timestamp())
    .bind(amount)
    .bind(reason)
    .bind(success)
    .bind(payment_intent_id)
    .bind(error_message)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn audit_log(db: &SqlitePool, booking_id: i64) -> sqlx::Result<Vec<AuditEntry>> {
    sqlx::query_as::<_, AuditEntry>(
        "SELECT id, booking_id, action, performed_by, performed_at, details
         FROM booking_audit_log WHERE booking_id = ? ORDER BY id ASC",
    )
    .bind(booking_id)
    .fetch_all(db)
    .await
}

pub async fn charge_attempts(db: &SqlitePool, booking_id: i64) -> sqlx::Result<Vec<ChargeAttempt>> {
    sqlx::query_as::<_, ChargeAttempt>(
        "SELECT id, booking_id, attempted_at, amount, reason, success,
                payment_intent_id, error_message
         FROM charge_attempts WHERE booking_id = ? ORDER BY id ASC",
    )
    .bind(booking_id)
    .fetch_all(db)
    .await
}

// ── Webhook dedup ──

/// Record a gateway event id. Returns false when the event was already
/// seen — the caller must then skip all state mutation for it.
pub async fn record_webhook_event(db: &SqlitePool, event_id: &str) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO webhook_events (event_id, received_at) VALUES (?, ?)",
    )
    .bind(event_id)
    .bind(clock::timestamp())
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

// ── Gift cards ──

pub async fn find_gift_card(db: &SqlitePool, code: &str) -> sqlx::Result<Option<GiftCard>> {
    sqlx::query_as::<_, GiftCard>(
        "SELECT id, code, balance, status, expires_at, created_at
         FROM gift_cards WHERE code = ?",
    )
    .bind(code)
    .fetch_optional(db)
    .await
}

// ── Tests ──
