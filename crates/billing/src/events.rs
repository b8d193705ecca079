//! Webhook event vocabulary
//!
//! The payment processor's event stream is modeled as a closed enum so
//! each transition can be dispatched and tested without the network or
//! signature layer. Event types outside the vocabulary parse to
//! [`WebhookEvent::Unknown`] and are acknowledged without side effects.

use std::collections::HashMap;

use serde::Deserialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// `checkout.session.completed` payload (the fields we consume)
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionPayload {
    pub id: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// `customer.subscription.*` payload
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionPayload {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub customer: Option<String>,
    /// Unix timestamp of the current billing period's end
    #[serde(default)]
    pub current_period_end: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentError {
    #[serde(default)]
    pub message: Option<String>,
}

/// `payment_intent.*` payload
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentPayload {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub last_payment_error: Option<PaymentError>,
}

/// Closed set of event kinds the reconciler acts on
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    CheckoutCompleted(CheckoutSessionPayload),
    /// Covers both `customer.subscription.created` and `.updated`; the
    /// transition only mutates the ledger when the status is `active`
    SubscriptionUpdated(SubscriptionPayload),
    SubscriptionDeleted(SubscriptionPayload),
    PaymentIntentSucceeded(PaymentIntentPayload),
    PaymentIntentFailed(PaymentIntentPayload),
    /// Anything else: acknowledged and ignored
    Unknown,
}

/// A verified, parsed webhook delivery
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub id: String,
    pub event_type: String,
    pub created: i64,
    pub event: WebhookEvent,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: i64,
    data: RawData,
}

#[derive(Debug, Deserialize)]
struct RawData {
    object: serde_json::Value,
}

impl EventEnvelope {
    /// Parse a raw webhook body into the closed event vocabulary
    pub fn parse(payload: &str) -> BillingResult<Self> {
        let raw: RawEnvelope = serde_json::from_str(payload)
            .map_err(|e| BillingError::UnsupportedPayload(e.to_string()))?;

        fn object<T: serde::de::DeserializeOwned>(
            value: serde_json::Value,
        ) -> BillingResult<T> {
            serde_json::from_value(value)
                .map_err(|e| BillingError::UnsupportedPayload(e.to_string()))
        }

        let event = match raw.event_type.as_str() {
            "checkout.session.completed" => {
                WebhookEvent::CheckoutCompleted(object(raw.data.object)?)
            }
            "customer.subscription.created" | "customer.subscription.updated" => {
                WebhookEvent::SubscriptionUpdated(object(raw.data.object)?)
            }
            "customer.subscription.deleted" => {
                WebhookEvent::SubscriptionDeleted(object(raw.data.object)?)
            }
            "payment_intent.succeeded" => {
                WebhookEvent::PaymentIntentSucceeded(object(raw.data.object)?)
            }
            "payment_intent.payment_failed" => {
                WebhookEvent::PaymentIntentFailed(object(raw.data.object)?)
            }
            _ => WebhookEvent::Unknown,
        };

        Ok(Self {
            id: raw.id,
            event_type: raw.event_type,
            created: raw.created,
            event,
        })
    }
}

/// Read the user id the checkout flow attached as metadata
pub fn user_id_from_metadata(metadata: &HashMap<String, String>) -> Option<Uuid> {
    metadata
        .get("user_id")
        .and_then(|s| Uuid::parse_str(s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_checkout_completed() {
        let payload = r#"{
            "id": "evt_1",
            "type": "checkout.session.completed",
            "created": 1700000000,
            "data": {
                "object": {
                    "id": "cs_test_1",
                    "mode": "payment",
                    "amount_total": 2999,
                    "currency": "usd",
                    "customer": "cus_1",
                    "payment_intent": "pi_1",
                    "metadata": {
                        "user_id": "6f3f9fbe-94d1-41e0-b24d-96c1a9f2a6aa",
                        "plan_name": "5-pack"
                    }
                }
            }
        }"#;

        let envelope = EventEnvelope::parse(payload).unwrap();
        assert_eq!(envelope.id, "evt_1");
        let WebhookEvent::CheckoutCompleted(session) = envelope.event else {
            panic!("expected CheckoutCompleted");
        };
        assert_eq!(session.amount_total, Some(2999));
        assert!(user_id_from_metadata(&session.metadata).is_some());
    }

    #[test]
    fn test_created_and_updated_share_a_transition() {
        for event_type in [
            "customer.subscription.created",
            "customer.subscription.updated",
        ] {
            let payload = format!(
                r#"{{
                    "id": "evt_2",
                    "type": "{event_type}",
                    "data": {{
                        "object": {{
                            "id": "sub_1",
                            "status": "active",
                            "current_period_end": 1700000000,
                            "metadata": {{}}
                        }}
                    }}
                }}"#
            );
            let envelope = EventEnvelope::parse(&payload).unwrap();
            assert!(matches!(
                envelope.event,
                WebhookEvent::SubscriptionUpdated(_)
            ));
        }
    }

    #[test]
    fn test_unknown_event_type_is_accepted() {
        let payload = r#"{
            "id": "evt_3",
            "type": "customer.tax_id.created",
            "data": { "object": { "id": "txi_1" } }
        }"#;

        let envelope = EventEnvelope::parse(payload).unwrap();
        assert!(matches!(envelope.event, WebhookEvent::Unknown));
        assert_eq!(envelope.event_type, "customer.tax_id.created");
    }

    #[test]
    fn test_garbage_payload_is_rejected() {
        assert!(matches!(
            EventEnvelope::parse("not json"),
            Err(BillingError::UnsupportedPayload(_))
        ));
    }

    #[test]
    fn test_missing_user_id_metadata() {
        let mut metadata = HashMap::new();
        metadata.insert("plan_name".to_string(), "single".to_string());
        assert!(user_id_from_metadata(&metadata).is_none());

        metadata.insert("user_id".to_string(), "not-a-uuid".to_string());
        assert!(user_id_from_metadata(&metadata).is_none());
    }
}
