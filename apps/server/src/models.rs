use serde::{Deserialize, Serialize};

// ── Lifecycle enums ──

/// Booking lifecycle state. Transitions are one-directional; `Cancelled`
/// and `Completed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "completed" => Some(BookingStatus::Completed),
            "cancelled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether a transition from `self` to `to` is legal.
    ///
    /// pending → confirmed | completed | cancelled
    /// confirmed → completed | cancelled
    pub fn can_transition_to(&self, to: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, to),
            (Pending, Confirmed)
                | (Pending, Completed)
                | (Pending, Cancelled)
                | (Confirmed, Completed)
                | (Confirmed, Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
    ChargedLateCancel,
    ChargedNoShow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PaymentMode {
    Prepaid,
    Postpaid,
    CardOnFile,
    PayAtVenue,
}

/// Who owns a booking. Exactly one channel applies; contact info is always
/// carried on the booking itself as an immutable snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BookingIdentity {
    Registered { user_id: i64 },
    Guest { guest_customer_id: i64 },
    Anonymous,
}

// ── Database models ──

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub price: i64,
    pub duration_min: i64,
    pub is_active: bool,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Booking {
    pub id: i64,
    pub user_id: Option<i64>,
    pub guest_customer_id: Option<i64>,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: String,
    pub barber: Option<String>,
    pub location: Option<String>,
    pub date: String,
    pub time: String,
    pub total_price: i64,
    pub total_duration: i64,
    pub status: BookingStatus,
    pub payment_mode: PaymentMode,
    pub payment_status: PaymentStatus,
    pub is_paid: bool,
    pub cancellation_policy_accepted: bool,
    pub cancellation_policy_accepted_at: Option<String>,
    pub cancellation_reason: Option<String>,
    pub cancelled_at: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub stripe_setup_intent_id: Option<String>,
    pub stripe_payment_method_id: Option<String>,
    pub stripe_payment_intent_id: Option<String>,
    pub card_setup_complete: bool,
    pub notes: Option<String>,
    pub source: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Booking {
    pub fn identity(&self) -> BookingIdentity {
        match (self.user_id, self.guest_customer_id) {
            (Some(user_id), _) => BookingIdentity::Registered { user_id },
            (None, Some(guest_customer_id)) => BookingIdentity::Guest { guest_customer_id },
            (None, None) => BookingIdentity::Anonymous,
        }
    }

    /// A booking holds a usable payment guarantee when card setup finished
    /// and both gateway references were captured.
    pub fn has_guarantee(&self) -> bool {
        self.card_setup_complete
            && self.stripe_customer_id.is_some()
            && self.stripe_payment_method_id.is_some()
    }
}

/// One service line item embedded in a booking: a snapshot of name, price
/// and duration at booking time.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BookingService {
    pub id: i64,
    pub booking_id: i64,
    pub service_id: i64,
    pub service_name: String,
    pub price: i64,
    pub duration_min: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GuestCustomer {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub stripe_customer_id: Option<String>,
    pub stripe_payment_method_id: Option<String>,
    pub no_show_count: i64,
    pub late_cancellation_count: i64,
    pub notes: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GiftCard {
    pub id: i64,
    pub code: String,
    pub balance: i64,
    pub status: String,
    pub expires_at: Option<String>,
    pub created_at: String,
}

/// Append-only audit record. Never updated or deleted.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub booking_id: i64,
    pub action: String,
    pub performed_by: String,
    pub performed_at: String,
    pub details: String,
}

/// Append-only record of one charge attempt, success or failure.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ChargeAttempt {
    pub id: i64,
    pub booking_id: i64,
    pub attempted_at: String,
    pub amount: i64,
    pub reason: String,
    pub success: bool,
    pub payment_intent_id: Option<String>,
    pub error_message: Option<String>,
}

// ── API request/response types ──

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerInfo {
    pub name: String,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Deserialize)]
pub struct EmailPhoneRequest {
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityResponse {
    pub can_pay_at_venue: bool,
    pub no_show_count: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSetupIntentRequest {
    pub customer_info: CustomerInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSetupIntentResponse {
    pub client_secret: String,
    pub setup_intent_id: String,
    pub guest_customer_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSelection {
    pub service_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGuestBookingRequest {
    pub customer_info: CustomerInfo,
    pub services: Vec<ServiceSelection>,
    pub barber: Option<String>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub location: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub cancellation_policy_accepted: bool,
    pub setup_intent_id: Option<String>,
    /// "card" or "pay_at_venue"
    pub payment_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGuestBookingResponse {
    pub booking: BookingDetail,
    pub payment_required: bool,
    pub charged: bool,
    pub payment_type: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelGuestBookingRequest {
    pub email: String,
    pub phone: String,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelBookingResponse {
    pub message: String,
    pub charged: bool,
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub barber: Option<String>,
    pub date: Option<String>,
    pub location: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateSlotRequest {
    pub barber: Option<String>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub duration: Option<i64>,
    pub location: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ValidateSlotResponse {
    pub available: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityResponse {
    pub date: String,
    pub barber: Option<String>,
    pub location: Option<String>,
    pub slots: Vec<crate::slots::SlotInfo>,
    pub total_slots: usize,
    pub available_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct RetryChargeRequest {
    /// "late_cancellation" or "no_show"
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChargeResponse {
    pub charged: bool,
    pub amount: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateNotesRequest {
    pub notes: String,
}

#[derive(Debug, Deserialize)]
pub struct AdminBookingsQuery {
    pub date: Option<String>,
    pub status: Option<String>,
}

/// Booking plus its line items — the shape most read endpoints return.
#[derive(Debug, Serialize)]
pub struct BookingDetail {
    #[serde(flatten)]
    pub booking: Booking,
    pub identity: BookingIdentity,
    pub services: Vec<BookingService>,
}

/// Full staff-facing view: detail plus both append-only trails.
#[derive(Debug, Serialize)]
pub struct BookingInspection {
    #[serde(flatten)]
    pub detail: BookingDetail,
    pub audit_log: Vec<AuditEntry>,
    pub charge_attempts: Vec<ChargeAttempt>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestCustomerStats {
    pub total_bookings: usize,
    pub no_show_count: i64,
    pub late_cancellation_count: i64,
    pub completed_bookings: usize,
    pub cancelled_bookings: usize,
    pub total_spent: i64,
}

#[derive(Debug, Serialize)]
pub struct GuestCustomerHistory {
    pub customer: Option<GuestCustomer>,
    pub bookings: Vec<BookingDetail>,
    pub stats: GuestCustomerStats,
}

#[derive(Debug, Serialize)]
pub struct GuestBookingsResponse {
    pub bookings: Vec<BookingDetail>,
    pub customer: Option<GuestCustomer>,
}

// ── Response envelope ──

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// ── Tests ──
