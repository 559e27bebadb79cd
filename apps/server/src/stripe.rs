//! Stripe integration: card-on-file setup and off-session charges.
//!
//! Handlers never talk to the gateway directly; everything goes through the
//! [`PaymentGateway`] trait so the charge logic can be tested against a mock.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

const API_BASE: &str = "https://api.stripe.com/v1";

/// Webhook signatures older than this are rejected.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The card was declined; retrying with the same method will not help
    /// without customer action.
    #[error("card declined: {0}")]
    Declined(String),
    #[error("gateway error: {0}")]
    Api(String),
}

#[derive(Debug, Clone)]
pub struct GatewayCustomer {
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct SetupIntent {
    pub id: String,
    pub client_secret: String,
    pub status: String,
    pub payment_method: Option<String>,
    pub customer: Option<String>,
}

/// One off-session charge request. `amount` is in euro cents.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub customer_id: String,
    pub payment_method_id: String,
    pub amount: i64,
    pub booking_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct Charge {
    pub payment_intent_id: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_customer(
        &self,
        name: &str,
        email: &str,
        phone: &str,
    ) -> Result<GatewayCustomer, GatewayError>;

    async fn create_setup_intent(&self, customer_id: &str) -> Result<SetupIntent, GatewayError>;

    async fn retrieve_setup_intent(&self, id: &str) -> Result<SetupIntent, GatewayError>;

    /// Charge a saved payment method without the customer present.
    async fn charge_off_session(&self, req: &ChargeRequest) -> Result<Charge, GatewayError>;
}

// ── Stripe client ──

pub struct StripeGateway {
    client: reqwest::Client,
    secret_key: String,
}

impl StripeGateway {
    pub fn new(secret_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            secret_key,
        }
    }

    async fn parse_or_error<T: for<'de> Deserialize<'de>>(
        resp: reqwest::Response,
    ) -> Result<T, GatewayError> {
        if resp.status().is_success() {
            return Ok(resp.json().await?);
        }
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        let err = &body["error"];
        let message = err["message"]
            .as_str()
            .unwrap_or("unknown gateway error")
            .to_string();
        if err["type"].as_str() == Some("card_error") {
            return Err(GatewayError::Declined(message));
        }
        tracing::error!("Stripe API error: {} - {}", status, message);
        Err(GatewayError::Api(message))
    }
}

#[derive(Debug, Deserialize)]
struct StripeCustomer {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripeSetupIntent {
    id: String,
    client_secret: String,
    status: String,
    payment_method: Option<String>,
    customer: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripePaymentIntent {
    id: String,
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_customer(
        &self,
        name: &str,
        email: &str,
        phone: &str,
    ) -> Result<GatewayCustomer, GatewayError> {
        let resp = self
            .client
            .post(format!("{}/customers", API_BASE))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(&[("name", name), ("email", email), ("phone", phone)])
            .send()
            .await?;
        let customer: StripeCustomer = Self::parse_or_error(resp).await?;
        Ok(GatewayCustomer { id: customer.id })
    }

    async fn create_setup_intent(&self, customer_id: &str) -> Result<SetupIntent, GatewayError> {
        let resp = self
            .client
            .post(format!("{}/setup_intents", API_BASE))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(&[
                ("customer", customer_id),
                ("payment_method_types[]", "card"),
                ("usage", "off_session"),
            ])
            .send()
            .await?;
        let intent: StripeSetupIntent = Self::parse_or_error(resp).await?;
        Ok(SetupIntent {
            id: intent.id,
            client_secret: intent.client_secret,
            status: intent.status,
            payment_method: intent.payment_method,
            customer: intent.customer,
        })
    }

    async fn retrieve_setup_intent(&self, id: &str) -> Result<SetupIntent, GatewayError> {
        let resp = self
            .client
            .get(format!("{}/setup_intents/{}", API_BASE, id))
            .basic_auth(&self.secret_key, None::<&str>)
            .send()
            .await?;
        let intent: StripeSetupIntent = Self::parse_or_error(resp).await?;
        Ok(SetupIntent {
            id: intent.id,
            client_secret: intent.client_secret,
            status: intent.status,
            payment_method: intent.payment_method,
            customer: intent.customer,
        })
    }

    async fn charge_off_session(&self, req: &ChargeRequest) -> Result<Charge, GatewayError> {
        let idempotency_key = format!(
            "charge-{}-{}-{}",
            req.booking_id,
            req.reason,
            chrono::Utc::now().timestamp_millis()
        );
        let amount = req.amount.to_string();
        let booking_id = req.booking_id.to_string();
        let resp = self
            .client
            .post(format!("{}/payment_intents", API_BASE))
            .basic_auth(&self.secret_key, None::<&str>)
            .header("Idempotency-Key", &idempotency_key)
            .form(&[
                ("amount", amount.as_str()),
                ("currency", "eur"),
                ("customer", req.customer_id.as_str()),
                ("payment_method", req.payment_method_id.as_str()),
                ("off_session", "true"),
                ("confirm", "true"),
                ("metadata[bookingId]", booking_id.as_str()),
                ("metadata[reason]", req.reason.as_str()),
            ])
            .send()
            .await?;
        let intent: StripePaymentIntent = Self::parse_or_error(resp).await?;
        tracing::info!(
            "Stripe charge created: {} for booking {}",
            intent.id,
            req.booking_id
        );
        Ok(Charge {
            payment_intent_id: intent.id,
        })
    }
}

// ── Webhook verification ──

/// A verified, parsed webhook notification.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    /// Card setup finished; the payment method can now be charged.
    SetupSucceeded {
        setup_intent_id: String,
        payment_method: Option<String>,
        customer: Option<String>,
    },
    /// An off-session charge settled.
    ChargeSucceeded {
        payment_intent_id: String,
        booking_id: Option<i64>,
        reason: Option<String>,
        amount: i64,
    },
    ChargeFailed {
        payment_intent_id: String,
        booking_id: Option<i64>,
        error: Option<String>,
    },
    /// Recognised envelope, event type we do not act on.
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing or malformed signature header")]
    BadHeader,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("signature mismatch")]
    BadSignature,
    #[error("unparseable event payload")]
    BadPayload,
}

/// Verify a `Stripe-Signature` header against the raw request body and
/// parse the event. The header format is `t=<unix>,v1=<hex hmac>` where
/// the MAC is HMAC-SHA256 over `"{t}.{payload}"`.
pub fn verify_and_parse(
    payload: &[u8],
    sig_header: &str,
    secret: &str,
    now_ts: i64,
) -> Result<(String, WebhookEvent), WebhookError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();
    for part in sig_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = v.parse().ok(),
            Some(("v1", v)) => signatures.push(v),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(WebhookError::BadHeader)?;
    if signatures.is_empty() {
        return Err(WebhookError::BadHeader);
    }
    if (now_ts - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(WebhookError::Expired);
    }

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| WebhookError::BadSignature)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());

    if !signatures.iter().any(|s| *s == expected) {
        return Err(WebhookError::BadSignature);
    }

    parse_event(payload)
}

fn parse_event(payload: &[u8]) -> Result<(String, WebhookEvent), WebhookError> {
    let json: serde_json::Value =
        serde_json::from_slice(payload).map_err(|_| WebhookError::BadPayload)?;
    let event_id = json["id"]
        .as_str()
        .ok_or(WebhookError::BadPayload)?
        .to_string();
    let event_type = json["type"].as_str().ok_or(WebhookError::BadPayload)?;
    let object = &json["data"]["object"];

    let booking_id = object["metadata"]["bookingId"]
        .as_str()
        .and_then(|s| s.parse().ok());

    let event = match event_type {
        "setup_intent.succeeded" => WebhookEvent::SetupSucceeded {
            setup_intent_id: object["id"]
                .as_str()
                .ok_or(WebhookError::BadPayload)?
                .to_string(),
            payment_method: object["payment_method"].as_str().map(str::to_string),
            customer: object["customer"].as_str().map(str::to_string),
        },
        "payment_intent.succeeded" => WebhookEvent::ChargeSucceeded {
            payment_intent_id: object["id"]
                .as_str()
                .ok_or(WebhookError::BadPayload)?
                .to_string(),
            booking_id,
            reason: object["metadata"]["reason"].as_str().map(str::to_string),
            amount: object["amount"].as_i64().unwrap_or(0),
        },
        "payment_intent.payment_failed" => WebhookEvent::ChargeFailed {
            payment_intent_id: object["id"]
                .as_str()
                .ok_or(WebhookError::BadPayload)?
                .to_string(),
            booking_id,
            error: object["last_payment_error"]["message"]
                .as_str()
                .map(str::to_string),
        },
        other => WebhookEvent::Other(other.to_string()),
    };
    Ok((event_id, event))
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &str, timestamp: i64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    fn charge_payload() -> String {
        serde_json::json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "data": { "object": {
                "id": "pi_123",
                "amount": 2500,
                "metadata": { "bookingId": "42", "reason": "late_cancellation" }
            }}
        })
        .to_string()
    }

    #[test]
    fn test_valid_signature_parses() {
        let payload = charge_payload();
        let header = sign(&payload, 1_700_000_000);
        let (event_id, event) =
            verify_and_parse(payload.as_bytes(), &header, SECRET, 1_700_000_000).unwrap();
        assert_eq!(event_id, "evt_1");
        assert_eq!(
            event,
            WebhookEvent::ChargeSucceeded {
                payment_intent_id: "pi_123".into(),
                booking_id: Some(42),
                reason: Some("late_cancellation".into()),
                amount: 2500,
            }
        );
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let payload = charge_payload();
        let header = sign(&payload, 1_700_000_000);
        let tampered = payload.replace("2500", "1");
        let err = verify_and_parse(tampered.as_bytes(), &header, SECRET, 1_700_000_000);
        assert!(matches!(err, Err(WebhookError::BadSignature)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = charge_payload();
        let header = sign(&payload, 1_700_000_000);
        let err = verify_and_parse(payload.as_bytes(), &header, "whsec_other", 1_700_000_000);
        assert!(matches!(err, Err(WebhookError::BadSignature)));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = charge_payload();
        let header = sign(&payload, 1_700_000_000);
        let err = verify_and_parse(payload.as_bytes(), &header, SECRET, 1_700_000_000 + 301);
        assert!(matches!(err, Err(WebhookError::Expired)));
    }

    #[test]
    fn test_malformed_header_rejected() {
        let payload = charge_payload();
        for header in ["", "t=abc", "v1=deadbeef", "nonsense"] {
            let err = verify_and_parse(payload.as_bytes(), header, SECRET, 1_700_000_000);
            assert!(matches!(
                err,
                Err(WebhookError::BadHeader) | Err(WebhookError::BadSignature)
            ));
        }
    }

    #[test]
    fn test_setup_intent_event() {
        let payload = serde_json::json!({
            "id": "evt_2",
            "type": "setup_intent.succeeded",
            "data": { "object": {
                "id": "seti_1",
                "payment_method": "pm_9",
                "customer": "cus_9"
            }}
        })
        .to_string();
        let header = sign(&payload, 100);
        let (_, event) = verify_and_parse(payload.as_bytes(), &header, SECRET, 100).unwrap();
        assert_eq!(
            event,
            WebhookEvent::SetupSucceeded {
                setup_intent_id: "seti_1".into(),
                payment_method: Some("pm_9".into()),
                customer: Some("cus_9".into()),
            }
        );
    }

    #[test]
    fn test_unknown_event_is_other() {
        let payload = serde_json::json!({
            "id": "evt_3",
            "type": "charge.refunded",
            "data": { "object": {} }
        })
        .to_string();
        let header = sign(&payload, 100);
        let (_, event) = verify_and_parse(payload.as_bytes(), &header, SECRET, 100).unwrap();
        assert_eq!(event, WebhookEvent::Other("charge.refunded".into()));
    }
}
