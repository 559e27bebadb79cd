//! Payment guarantee lifecycle: card setup, off-session charges and the
//! cancellation policy.
//!
//! All charge paths for a booking funnel through [`GuaranteeManager`],
//! which serialises them per booking id. A booking is charged at most
//! once: the winner of the conditional `is_paid` flip owns the side
//! effects (counters, status coupling); everyone else observes
//! `AlreadyPaid`.

use std::sync::Arc;

use dashmap::DashMap;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::clock;
use crate::models::{CustomerInfo, GuestCustomer, PaymentStatus};
use crate::store;
use crate::stripe::{ChargeRequest, GatewayError, PaymentGateway, SetupIntent, WebhookEvent};

/// Hours before the appointment under which a cancellation is "late" and
/// triggers the full charge. At exactly 24h the cancellation is free.
pub const LATE_CANCEL_THRESHOLD_HOURS: f64 = 24.0;

/// Why a booking is being charged. Each reason carries its own resulting
/// payment status and whether settling also completes the booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeReason {
    /// Upfront charge for customers with a no-show history.
    Prepayment,
    LateCancellation,
    ServiceCompleted,
    NoShow,
}

impl ChargeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeReason::Prepayment => "prepayment_required_no_show_history",
            ChargeReason::LateCancellation => "late_cancellation",
            ChargeReason::ServiceCompleted => "service_completed",
            ChargeReason::NoShow => "no_show",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prepayment_required_no_show_history" => Some(ChargeReason::Prepayment),
            "late_cancellation" => Some(ChargeReason::LateCancellation),
            "service_completed" => Some(ChargeReason::ServiceCompleted),
            "no_show" => Some(ChargeReason::NoShow),
            _ => None,
        }
    }

    fn settled_status(&self) -> PaymentStatus {
        match self {
            ChargeReason::Prepayment | ChargeReason::ServiceCompleted => PaymentStatus::Paid,
            ChargeReason::LateCancellation => PaymentStatus::ChargedLateCancel,
            ChargeReason::NoShow => PaymentStatus::ChargedNoShow,
        }
    }

    /// A post-service charge settles payment and completion together.
    fn completes_booking(&self) -> bool {
        matches!(self, ChargeReason::ServiceCompleted)
    }
}

/// Outcome of one charge request against a booking.
#[derive(Debug)]
pub enum ChargeOutcome {
    Charged { amount: i64 },
    /// Someone already won the flip; nothing was charged again.
    AlreadyPaid,
    /// No usable guarantee on the booking.
    NoGuarantee,
    ZeroAmount,
    Failed { error: String },
}

/// A confirmed card setup, ready to attach to a booking.
#[derive(Debug, Clone)]
pub struct ConfirmedSetup {
    pub setup_intent_id: String,
    pub customer_id: String,
    pub payment_method_id: String,
}

pub struct GuaranteeManager {
    db: SqlitePool,
    gateway: Arc<dyn PaymentGateway>,
    charge_locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl GuaranteeManager {
    pub fn new(db: SqlitePool, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            db,
            gateway,
            charge_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, booking_id: i64) -> Arc<Mutex<()>> {
        self.charge_locks
            .entry(booking_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Whether a guest may book without a card on file: first-time
    /// customers and customers with a clean no-show record.
    pub fn pay_at_venue_allowed(guest: Option<&GuestCustomer>) -> bool {
        guest.map(|g| g.no_show_count == 0).unwrap_or(true)
    }

    /// Start card setup for a customer: find or create the guest record,
    /// make sure a gateway customer exists, and open a setup intent.
    pub async fn establish(
        &self,
        info: &CustomerInfo,
    ) -> anyhow::Result<(SetupIntent, i64)> {
        let existing = store::find_guest(&self.db, &info.email, &info.phone).await?;

        let (guest_id, customer_id) = match existing {
            Some(guest) => {
                let customer_id = match &guest.stripe_customer_id {
                    Some(id) => id.clone(),
                    None => {
                        let customer = self
                            .gateway
                            .create_customer(&info.name, &info.email, &info.phone)
                            .await?;
                        customer.id
                    }
                };
                store::update_guest_payment_profile(
                    &self.db,
                    guest.id,
                    &info.name,
                    Some(&customer_id),
                    None,
                )
                .await?;
                (guest.id, customer_id)
            }
            None => {
                let customer = self
                    .gateway
                    .create_customer(&info.name, &info.email, &info.phone)
                    .await?;
                let guest_id =
                    store::insert_guest(&self.db, info, Some(&customer.id), None).await?;
                (guest_id, customer.id)
            }
        };

        let intent = self.gateway.create_setup_intent(&customer_id).await?;
        Ok((intent, guest_id))
    }

    /// Verify a setup intent server-side. Client claims are never trusted:
    /// the intent must exist at the gateway and have succeeded.
    pub async fn confirm(
        &self,
        setup_intent_id: &str,
    ) -> anyhow::Result<Option<ConfirmedSetup>> {
        let intent = self.gateway.retrieve_setup_intent(setup_intent_id).await?;
        if intent.status != "succeeded" {
            return Ok(None);
        }
        let (Some(customer), Some(payment_method)) = (intent.customer, intent.payment_method)
        else {
            return Ok(None);
        };
        Ok(Some(ConfirmedSetup {
            setup_intent_id: intent.id,
            customer_id: customer,
            payment_method_id: payment_method,
        }))
    }

    /// Charge a booking's full total against its stored guarantee.
    ///
    /// Holds the per-booking lock across the re-read, the gateway call and
    /// the conditional flip, so concurrent attempts line up rather than
    /// double-charge. Every attempt lands in the charge_attempts trail.
    pub async fn charge_booking(
        &self,
        booking_id: i64,
        reason: ChargeReason,
        actor: &str,
    ) -> anyhow::Result<ChargeOutcome> {
        let lock = self.lock_for(booking_id);
        let _guard = lock.lock().await;

        let Some(booking) = store::find_booking(&self.db, booking_id).await? else {
            return Ok(ChargeOutcome::Failed {
                error: "booking not found".into(),
            });
        };
        if booking.is_paid {
            return Ok(ChargeOutcome::AlreadyPaid);
        }
        if !booking.has_guarantee() {
            return Ok(ChargeOutcome::NoGuarantee);
        }
        if booking.total_price <= 0 {
            return Ok(ChargeOutcome::ZeroAmount);
        }

        let request = ChargeRequest {
            customer_id: booking.stripe_customer_id.clone().unwrap_or_default(),
            payment_method_id: booking.stripe_payment_method_id.clone().unwrap_or_default(),
            amount: booking.total_price,
            booking_id,
            reason: reason.as_str().to_string(),
        };

        match self.gateway.charge_off_session(&request).await {
            Ok(charge) => {
                self.settle_success(
                    booking_id,
                    booking.guest_customer_id,
                    booking.total_price,
                    reason,
                    &charge.payment_intent_id,
                    actor,
                )
                .await?;
                Ok(ChargeOutcome::Charged {
                    amount: booking.total_price,
                })
            }
            Err(err) => {
                let message = match &err {
                    GatewayError::Declined(m) => m.clone(),
                    other => other.to_string(),
                };
                store::mark_charge_failed(&self.db, booking_id).await?;
                store::append_charge_attempt(
                    &self.db,
                    booking_id,
                    booking.total_price,
                    reason.as_str(),
                    false,
                    None,
                    Some(&message),
                )
                .await?;
                store::append_audit(
                    &self.db,
                    booking_id,
                    "charge_failed",
                    actor,
                    &format!("reason={} error={}", reason.as_str(), message),
                )
                .await?;
                tracing::warn!("Charge failed for booking {}: {}", booking_id, message);
                Ok(ChargeOutcome::Failed { error: message })
            }
        }
    }

    /// Apply a successful charge: flip the row, then run side effects only
    /// if this call actually won the flip.
    async fn settle_success(
        &self,
        booking_id: i64,
        guest_id: Option<i64>,
        amount: i64,
        reason: ChargeReason,
        payment_intent_id: &str,
        actor: &str,
    ) -> anyhow::Result<()> {
        let won = store::apply_charge_success(
            &self.db,
            booking_id,
            reason.settled_status(),
            payment_intent_id,
            reason.completes_booking(),
        )
        .await?;
        if !won {
            return Ok(());
        }

        if reason == ChargeReason::LateCancellation {
            if let Some(guest_id) = guest_id {
                store::increment_late_cancellations(&self.db, guest_id).await?;
            }
        }

        store::append_charge_attempt(
            &self.db,
            booking_id,
            amount,
            reason.as_str(),
            true,
            Some(payment_intent_id),
            None,
        )
        .await?;
        store::append_audit(
            &self.db,
            booking_id,
            "charged",
            actor,
            &format!("reason={} amount={}", reason.as_str(), amount),
        )
        .await?;
        tracing::info!(
            "Booking {} charged: {} cents ({})",
            booking_id,
            amount,
            reason.as_str()
        );
        Ok(())
    }

    /// Run the cancellation policy for an already-cancelled booking.
    /// Within the threshold window the full price is charged off-session;
    /// outside it nothing happens. Returns (charged, amount).
    pub async fn handle_cancellation(
        &self,
        booking_id: i64,
        date: &str,
        time: &str,
        actor: &str,
    ) -> anyhow::Result<(bool, i64)> {
        let hours = clock::hours_until(date, time, clock::business_now());
        let late = matches!(hours, Some(h) if h < LATE_CANCEL_THRESHOLD_HOURS);
        if !late {
            return Ok((false, 0));
        }
        match self
            .charge_booking(booking_id, ChargeReason::LateCancellation, actor)
            .await?
        {
            ChargeOutcome::Charged { amount } => Ok((true, amount)),
            _ => Ok((false, 0)),
        }
    }

    /// Apply a verified, deduplicated gateway notification. The caller has
    /// already checked the signature; dedup happens here so every path
    /// shares it.
    pub async fn apply_webhook(&self, event_id: &str, event: &WebhookEvent) -> anyhow::Result<()> {
        let fresh = store::record_webhook_event(&self.db, event_id).await?;
        if !fresh {
            tracing::info!("Skipping replayed webhook event {}", event_id);
            return Ok(());
        }

        match event {
            WebhookEvent::SetupSucceeded {
                setup_intent_id,
                payment_method,
                ..
            } => {
                let Some(booking) =
                    store::find_booking_by_setup_intent(&self.db, setup_intent_id).await?
                else {
                    return Ok(());
                };
                if let Some(pm) = payment_method {
                    store::confirm_card_setup(&self.db, booking.id, pm).await?;
                    store::append_audit(
                        &self.db,
                        booking.id,
                        "card_setup_complete",
                        "System",
                        setup_intent_id,
                    )
                    .await?;
                }
            }
            WebhookEvent::ChargeSucceeded {
                payment_intent_id,
                booking_id: Some(booking_id),
                reason,
                amount: _,
            } => {
                let reason = reason
                    .as_deref()
                    .and_then(ChargeReason::parse)
                    .unwrap_or(ChargeReason::ServiceCompleted);
                let lock = self.lock_for(*booking_id);
                let _guard = lock.lock().await;
                let Some(booking) = store::find_booking(&self.db, *booking_id).await? else {
                    return Ok(());
                };
                let guest_id = booking.guest_customer_id;
                self.settle_success(
                    *booking_id,
                    guest_id,
                    booking.total_price,
                    reason,
                    payment_intent_id,
                    "System",
                )
                .await?;
            }
            WebhookEvent::ChargeFailed {
                booking_id: Some(booking_id),
                error,
                ..
            } => {
                let lock = self.lock_for(*booking_id);
                let _guard = lock.lock().await;
                store::mark_charge_failed(&self.db, *booking_id).await?;
                store::append_audit(
                    &self.db,
                    *booking_id,
                    "charge_failed",
                    "System",
                    error.as_deref().unwrap_or(""),
                )
                .await?;
            }
            _ => {}
        }
        Ok(())
    }
}

// ── Tests ──

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::run_migrations;
    use crate::models::BookingStatus;
    use crate::store::NewBooking;
    use crate::stripe::{Charge, GatewayCustomer, GatewayError, SetupIntent};
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Gateway double: counts charges, optionally declines everything.
    pub(crate) struct MockGateway {
        pub charges: AtomicU32,
        pub decline: bool,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self {
                charges: AtomicU32::new(0),
                decline: false,
            }
        }

        pub fn declining() -> Self {
            Self {
                charges: AtomicU32::new(0),
                decline: true,
            }
        }
    }

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn create_customer(
            &self,
            _name: &str,
            _email: &str,
            _phone: &str,
        ) -> Result<GatewayCustomer, GatewayError> {
            Ok(GatewayCustomer {
                id: "cus_mock".into(),
            })
        }

        async fn create_setup_intent(
            &self,
            customer_id: &str,
        ) -> Result<SetupIntent, GatewayError> {
            Ok(SetupIntent {
                id: "seti_mock".into(),
                client_secret: "seti_mock_secret".into(),
                status: "requires_payment_method".into(),
                payment_method: None,
                customer: Some(customer_id.into()),
            })
        }

        async fn retrieve_setup_intent(&self, id: &str) -> Result<SetupIntent, GatewayError> {
            Ok(SetupIntent {
                id: id.into(),
                client_secret: format!("{}_secret", id),
                status: "succeeded".into(),
                payment_method: Some("pm_mock".into()),
                customer: Some("cus_mock".into()),
            })
        }

        async fn charge_off_session(&self, req: &ChargeRequest) -> Result<Charge, GatewayError> {
            if self.decline {
                return Err(GatewayError::Declined("card was declined".into()));
            }
            let n = self.charges.fetch_add(1, Ordering::SeqCst);
            Ok(Charge {
                payment_intent_id: format!("pi_mock_{}_{}", req.booking_id, n),
            })
        }
    }

    pub(crate) async fn test_pool() -> SqlitePool {
        // Single connection keeps every task on the same in-memory db.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn customer() -> CustomerInfo {
        CustomerInfo {
            name: "Jonas".into(),
            email: "Jonas@Example.lt".into(),
            phone: "+37060000001".into(),
        }
    }

    pub(crate) async fn insert_guaranteed_booking(
        db: &SqlitePool,
        guest_id: Option<i64>,
        date: &str,
        time: &str,
        price: i64,
    ) -> i64 {
        let info = customer();
        let new = NewBooking {
            guest_customer_id: guest_id,
            customer: &info,
            barber: Some("Tomas"),
            location: None,
            date,
            time,
            total_price: price,
            total_duration: 45,
            payment_mode: crate::models::PaymentMode::CardOnFile,
            stripe_customer_id: Some("cus_mock"),
            stripe_setup_intent_id: Some("seti_mock"),
            stripe_payment_method_id: Some("pm_mock"),
            card_setup_complete: true,
            notes: None,
        };
        store::insert_booking(db, &new).await.unwrap()
    }

    #[tokio::test]
    async fn test_pay_at_venue_eligibility() {
        let db = test_pool().await;
        // No record at all: allowed.
        assert!(GuaranteeManager::pay_at_venue_allowed(None));

        let guest_id = store::insert_guest(&db, &customer(), None, None)
            .await
            .unwrap();
        let guest = store::find_guest_by_id(&db, guest_id).await.unwrap().unwrap();
        assert!(GuaranteeManager::pay_at_venue_allowed(Some(&guest)));

        sqlx::query("UPDATE guest_customers SET no_show_count = 1 WHERE id = ?")
            .bind(guest_id)
            .execute(&db)
            .await
            .unwrap();
        let guest = store::find_guest_by_id(&db, guest_id).await.unwrap().unwrap();
        assert!(!GuaranteeManager::pay_at_venue_allowed(Some(&guest)));
    }

    #[tokio::test]
    async fn test_charge_flips_booking_once() {
        let db = test_pool().await;
        let manager = GuaranteeManager::new(db.clone(), Arc::new(MockGateway::new()));
        let id = insert_guaranteed_booking(&db, None, "2030-01-10", "10:00", 2500).await;

        let outcome = manager
            .charge_booking(id, ChargeReason::ServiceCompleted, "Staff: a@b.lt")
            .await
            .unwrap();
        assert!(matches!(outcome, ChargeOutcome::Charged { amount: 2500 }));

        let booking = store::find_booking(&db, id).await.unwrap().unwrap();
        assert!(booking.is_paid);
        assert_eq!(booking.payment_status, PaymentStatus::Paid);
        // Post-service charge also completes the booking.
        assert_eq!(booking.status, BookingStatus::Completed);

        // Second attempt is a no-op.
        let again = manager
            .charge_booking(id, ChargeReason::ServiceCompleted, "Staff: a@b.lt")
            .await
            .unwrap();
        assert!(matches!(again, ChargeOutcome::AlreadyPaid));

        let attempts = store::charge_attempts(&db, id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].success);
    }

    #[tokio::test]
    async fn test_late_cancel_charge_bumps_counter() {
        let db = test_pool().await;
        let manager = GuaranteeManager::new(db.clone(), Arc::new(MockGateway::new()));
        let guest_id = store::insert_guest(&db, &customer(), Some("cus_mock"), None)
            .await
            .unwrap();
        let id =
            insert_guaranteed_booking(&db, Some(guest_id), "2030-01-10", "10:00", 3500).await;

        let outcome = manager
            .charge_booking(id, ChargeReason::LateCancellation, "Guest: jonas@example.lt")
            .await
            .unwrap();
        assert!(matches!(outcome, ChargeOutcome::Charged { amount: 3500 }));

        let booking = store::find_booking(&db, id).await.unwrap().unwrap();
        assert_eq!(booking.payment_status, PaymentStatus::ChargedLateCancel);
        // Late-cancel charge does not complete the booking.
        assert_eq!(booking.status, BookingStatus::Pending);

        let guest = store::find_guest_by_id(&db, guest_id).await.unwrap().unwrap();
        assert_eq!(guest.late_cancellation_count, 1);

        // A replayed charge attempt must not bump the counter again.
        let again = manager
            .charge_booking(id, ChargeReason::LateCancellation, "Guest: jonas@example.lt")
            .await
            .unwrap();
        assert!(matches!(again, ChargeOutcome::AlreadyPaid));
        let guest = store::find_guest_by_id(&db, guest_id).await.unwrap().unwrap();
        assert_eq!(guest.late_cancellation_count, 1);
    }

    #[tokio::test]
    async fn test_declined_charge_records_failure() {
        let db = test_pool().await;
        let manager = GuaranteeManager::new(db.clone(), Arc::new(MockGateway::declining()));
        let id = insert_guaranteed_booking(&db, None, "2030-01-10", "10:00", 2500).await;

        let outcome = manager
            .charge_booking(id, ChargeReason::NoShow, "Staff: a@b.lt")
            .await
            .unwrap();
        assert!(matches!(outcome, ChargeOutcome::Failed { .. }));

        let booking = store::find_booking(&db, id).await.unwrap().unwrap();
        assert!(!booking.is_paid);
        assert_eq!(booking.payment_status, PaymentStatus::Failed);

        let attempts = store::charge_attempts(&db, id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(!attempts[0].success);
        assert!(attempts[0].error_message.is_some());
    }

    #[tokio::test]
    async fn test_no_guarantee_refused() {
        let db = test_pool().await;
        let manager = GuaranteeManager::new(db.clone(), Arc::new(MockGateway::new()));
        let info = customer();
        let new = NewBooking {
            guest_customer_id: None,
            customer: &info,
            barber: None,
            location: None,
            date: "2030-01-10",
            time: "11:00",
            total_price: 2500,
            total_duration: 30,
            payment_mode: crate::models::PaymentMode::PayAtVenue,
            stripe_customer_id: None,
            stripe_setup_intent_id: None,
            stripe_payment_method_id: None,
            card_setup_complete: false,
            notes: None,
        };
        let id = store::insert_booking(&db, &new).await.unwrap();

        let outcome = manager
            .charge_booking(id, ChargeReason::ServiceCompleted, "Staff: a@b.lt")
            .await
            .unwrap();
        assert!(matches!(outcome, ChargeOutcome::NoGuarantee));
        assert!(store::charge_attempts(&db, id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_outside_window_is_free() {
        let db = test_pool().await;
        let gateway = Arc::new(MockGateway::new());
        let manager = GuaranteeManager::new(db.clone(), gateway.clone());
        // Far-future appointment: well outside the 24h window.
        let id = insert_guaranteed_booking(&db, None, "2030-01-10", "10:00", 2500).await;

        let (charged, amount) = manager
            .handle_cancellation(id, "2030-01-10", "10:00", "Guest: jonas@example.lt")
            .await
            .unwrap();
        assert!(!charged);
        assert_eq!(amount, 0);
        assert_eq!(gateway.charges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_inside_window_charges() {
        let db = test_pool().await;
        let manager = GuaranteeManager::new(db.clone(), Arc::new(MockGateway::new()));
        // Yesterday relative to any "now": always inside the window.
        let id = insert_guaranteed_booking(&db, None, "2020-01-01", "10:00", 2500).await;

        let (charged, amount) = manager
            .handle_cancellation(id, "2020-01-01", "10:00", "Guest: jonas@example.lt")
            .await
            .unwrap();
        assert!(charged);
        assert_eq!(amount, 2500);
        let booking = store::find_booking(&db, id).await.unwrap().unwrap();
        assert_eq!(booking.payment_status, PaymentStatus::ChargedLateCancel);
    }

    #[tokio::test]
    async fn test_webhook_replay_is_ignored() {
        let db = test_pool().await;
        let gateway = Arc::new(MockGateway::new());
        let manager = GuaranteeManager::new(db.clone(), gateway);
        let guest_id = store::insert_guest(&db, &customer(), Some("cus_mock"), None)
            .await
            .unwrap();
        let id =
            insert_guaranteed_booking(&db, Some(guest_id), "2030-01-10", "10:00", 2500).await;

        let event = WebhookEvent::ChargeSucceeded {
            payment_intent_id: "pi_wh_1".into(),
            booking_id: Some(id),
            reason: Some("late_cancellation".into()),
            amount: 2500,
        };
        manager.apply_webhook("evt_once", &event).await.unwrap();
        manager.apply_webhook("evt_once", &event).await.unwrap();

        let guest = store::find_guest_by_id(&db, guest_id).await.unwrap().unwrap();
        assert_eq!(guest.late_cancellation_count, 1);
        let attempts = store::charge_attempts(&db, id).await.unwrap();
        assert_eq!(attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_after_direct_charge_is_noop() {
        let db = test_pool().await;
        let manager = GuaranteeManager::new(db.clone(), Arc::new(MockGateway::new()));
        let id = insert_guaranteed_booking(&db, None, "2030-01-10", "10:00", 2500).await;

        manager
            .charge_booking(id, ChargeReason::ServiceCompleted, "Staff: a@b.lt")
            .await
            .unwrap();
        // The async notification for the same charge arrives later.
        let event = WebhookEvent::ChargeSucceeded {
            payment_intent_id: "pi_mock_dup".into(),
            booking_id: Some(id),
            reason: Some("service_completed".into()),
            amount: 2500,
        };
        manager.apply_webhook("evt_dup", &event).await.unwrap();

        let attempts = store::charge_attempts(&db, id).await.unwrap();
        assert_eq!(attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_setup_webhook_flips_card_setup() {
        let db = test_pool().await;
        let manager = GuaranteeManager::new(db.clone(), Arc::new(MockGateway::new()));
        let info = customer();
        let new = NewBooking {
            guest_customer_id: None,
            customer: &info,
            barber: None,
            location: None,
            date: "2030-01-10",
            time: "12:00",
            total_price: 2500,
            total_duration: 30,
            payment_mode: crate::models::PaymentMode::CardOnFile,
            stripe_customer_id: Some("cus_mock"),
            stripe_setup_intent_id: Some("seti_pending"),
            stripe_payment_method_id: None,
            card_setup_complete: false,
            notes: None,
        };
        let id = store::insert_booking(&db, &new).await.unwrap();

        let event = WebhookEvent::SetupSucceeded {
            setup_intent_id: "seti_pending".into(),
            payment_method: Some("pm_late".into()),
            customer: Some("cus_mock".into()),
        };
        manager.apply_webhook("evt_setup", &event).await.unwrap();

        let booking = store::find_booking(&db, id).await.unwrap().unwrap();
        assert!(booking.card_setup_complete);
        assert_eq!(booking.stripe_payment_method_id.as_deref(), Some("pm_late"));
        assert!(booking.has_guarantee());
    }

    #[tokio::test]
    async fn test_concurrent_charges_single_settlement() {
        let db = test_pool().await;
        let gateway = Arc::new(MockGateway::new());
        let manager = Arc::new(GuaranteeManager::new(db.clone(), gateway.clone()));
        let id = insert_guaranteed_booking(&db, None, "2030-01-10", "10:00", 2500).await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .charge_booking(id, ChargeReason::ServiceCompleted, "Staff: a@b.lt")
                    .await
                    .unwrap()
            }));
        }
        let mut charged = 0;
        let mut already = 0;
        for handle in handles {
            match handle.await.unwrap() {
                ChargeOutcome::Charged { .. } => charged += 1,
                ChargeOutcome::AlreadyPaid => already += 1,
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
        assert_eq!(charged, 1);
        assert_eq!(already, 3);
        assert_eq!(gateway.charges.load(Ordering::SeqCst), 1);
        assert_eq!(store::charge_attempts(&db, id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_establish_reuses_existing_guest() {
        let db = test_pool().await;
        let manager = GuaranteeManager::new(db.clone(), Arc::new(MockGateway::new()));
        let info = customer();

        let (_, first_id) = manager.establish(&info).await.unwrap();
        // Same email (different case) and phone must hit the same record.
        let recased = CustomerInfo {
            name: "Jonas P.".into(),
            email: "jonas@example.lt".into(),
            phone: info.phone.clone(),
        };
        let (_, second_id) = manager.establish(&recased).await.unwrap();
        assert_eq!(first_id, second_id);

        let guest = store::find_guest_by_id(&db, first_id).await.unwrap().unwrap();
        assert_eq!(guest.name, "Jonas P.");
        assert_eq!(guest.stripe_customer_id.as_deref(), Some("cus_mock"));
    }

    #[tokio::test]
    async fn test_confirm_returns_setup_details() {
        let db = test_pool().await;
        let manager = GuaranteeManager::new(db, Arc::new(MockGateway::new()));
        let confirmed = manager.confirm("seti_42").await.unwrap().unwrap();
        assert_eq!(confirmed.setup_intent_id, "seti_42");
        assert_eq!(confirmed.customer_id, "cus_mock");
        assert_eq!(confirmed.payment_method_id, "pm_mock");
    }
}
