//! Stripe webhook reconciliation
//!
//! Verifies inbound deliveries, then replays them against the entitlement
//! ledger. Every event kind passes the same idempotency gate: the event id
//! is claimed in the processed-event log before any side effect runs, so a
//! duplicated or concurrently redelivered event mutates the ledger exactly
//! once.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;

use crate::email::BillingEmailService;
use crate::entitlements::NewEntitlement;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    user_id_from_metadata, CheckoutSessionPayload, EventEnvelope, PaymentIntentPayload,
    SubscriptionPayload, WebhookEvent,
};
use crate::plans::Plan;
use crate::store::{BillingStore, EventClaim, ProcessedEvent};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed payload before it is rejected
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// How a verified event was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    /// The event id was already in the processed-event log
    Duplicate,
}

/// Webhook handler for payment processor events
pub struct WebhookHandler {
    store: Arc<dyn BillingStore>,
    email: BillingEmailService,
    webhook_secret: String,
}

impl WebhookHandler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        email: BillingEmailService,
        webhook_secret: impl Into<String>,
    ) -> Self {
        Self {
            store,
            email,
            webhook_secret: webhook_secret.into(),
        }
    }

    /// Verify a delivery's signature and parse it.
    ///
    /// The signature header carries `t=<unix>,v1=<hex hmac>`; the HMAC is
    /// SHA-256 over `"{t}.{payload}"` keyed with the endpoint secret.
    /// Verification failure is terminal: no ledger state is touched.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<EventEnvelope> {
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<&str> = None;

        for part in signature.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => v1_signature = Some(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(BillingError::SignatureInvalid)?;
        let v1_signature = v1_signature.ok_or(BillingError::SignatureInvalid)?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(
                timestamp,
                now,
                "Webhook signature timestamp outside tolerance"
            );
            return Err(BillingError::SignatureInvalid);
        }

        let secret_key = self
            .webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(&self.webhook_secret);
        let signed_payload = format!("{timestamp}.{payload}");

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
            .map_err(|_| BillingError::SignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::SignatureInvalid);
        }

        EventEnvelope::parse(payload)
    }

    /// Apply a verified event to the ledger, exactly once per event id
    pub async fn handle_event(&self, envelope: EventEnvelope) -> BillingResult<WebhookOutcome> {
        if matches!(envelope.event, WebhookEvent::Unknown) {
            // Forward compatibility: acknowledge event types we don't act on
            tracing::info!(
                event_type = %envelope.event_type,
                event_id = %envelope.id,
                "Unhandled webhook event type acknowledged"
            );
            return Ok(WebhookOutcome::Processed);
        }

        // Single idempotency gate for every event kind. The claim races on
        // the event-id uniqueness constraint; the loser is a duplicate.
        match self
            .store
            .claim_event(&envelope.id, &envelope.event_type)
            .await?
        {
            EventClaim::Duplicate => {
                tracing::info!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    "Duplicate webhook event skipped"
                );
                return Ok(WebhookOutcome::Duplicate);
            }
            EventClaim::Claimed => {}
        }

        let result = match &envelope.event {
            WebhookEvent::CheckoutCompleted(session) => {
                self.apply_checkout_completed(&envelope.id, session).await
            }
            WebhookEvent::SubscriptionUpdated(subscription) => {
                self.apply_subscription_updated(&envelope.id, subscription)
                    .await
            }
            WebhookEvent::SubscriptionDeleted(subscription) => {
                self.apply_subscription_deleted(&envelope.id, subscription)
                    .await
            }
            WebhookEvent::PaymentIntentSucceeded(intent) => {
                self.apply_payment_intent(&envelope.id, intent, false).await
            }
            WebhookEvent::PaymentIntentFailed(intent) => {
                self.apply_payment_intent(&envelope.id, intent, true).await
            }
            WebhookEvent::Unknown => Ok(()),
        };

        if let Err(e) = &result {
            tracing::error!(
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                error = %e,
                "Webhook transition failed"
            );
            // Record the failure so the row doesn't linger as 'processing'
            if let Err(update_err) = self
                .store
                .finish_event(&envelope.id, ProcessedEvent::with_status("error"))
                .await
            {
                tracing::error!(
                    event_id = %envelope.id,
                    error = %update_err,
                    "Failed to record webhook processing error"
                );
            }
        }

        result.map(|()| WebhookOutcome::Processed)
    }

    /// checkout.session.completed: create the purchased entitlement from
    /// the metadata the checkout flow attached
    async fn apply_checkout_completed(
        &self,
        event_id: &str,
        session: &CheckoutSessionPayload,
    ) -> BillingResult<()> {
        let Some(user_id) = user_id_from_metadata(&session.metadata) else {
            tracing::error!(event_id, "Checkout session missing user_id metadata");
            self.store
                .finish_event(event_id, ProcessedEvent::with_status("error"))
                .await?;
            return Ok(());
        };
        let Some(plan) = session
            .metadata
            .get("plan_name")
            .and_then(|s| s.parse::<Plan>().ok())
        else {
            tracing::error!(event_id, user_id = %user_id, "Checkout session missing plan_name metadata");
            self.store
                .finish_event(event_id, ProcessedEvent::with_status("error"))
                .await?;
            return Ok(());
        };

        let now = OffsetDateTime::now_utc();
        let new = NewEntitlement::from_plan(
            user_id,
            plan,
            now,
            session.customer.clone(),
            session.subscription.clone(),
        );

        let entitlement = match self.store.insert_entitlement(new).await {
            Ok(entitlement) => Some(entitlement),
            Err(BillingError::Conflict(_)) => {
                // The subscription-activation event got here first; its row
                // is authoritative.
                tracing::info!(
                    event_id,
                    user_id = %user_id,
                    "Entitlement already exists for this subscription"
                );
                match session.subscription.as_deref() {
                    Some(sub_ref) => self.store.find_active_by_subscription_ref(sub_ref).await?,
                    None => None,
                }
            }
            Err(e) => return Err(e),
        };

        self.store
            .finish_event(
                event_id,
                ProcessedEvent {
                    user_id: Some(user_id),
                    amount: session.amount_total.unwrap_or(0),
                    currency: session.currency.clone(),
                    status: "completed".to_string(),
                    plan_name: Some(plan),
                    entitlement_id: entitlement.as_ref().map(|e| e.id),
                    checkout_session_id: Some(session.id.clone()),
                    payment_intent_id: session.payment_intent.clone(),
                },
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            plan = %plan,
            event_id,
            "Checkout completed, entitlement granted"
        );

        // Notifications run after the ledger and event log commit and are
        // best effort only.
        if let Ok(Some(address)) = self.store.find_user_email(user_id).await {
            let sent = if session.mode.as_deref() == Some("subscription") {
                self.email
                    .send_subscription_confirmation(
                        &address,
                        session.subscription.as_deref().unwrap_or_default(),
                    )
                    .await
            } else {
                self.email
                    .send_purchase_confirmation(&address, plan, session.amount_total.unwrap_or(0))
                    .await
            };
            if let Err(e) = sent {
                tracing::warn!(error = %e, "Failed to send purchase confirmation email");
            }
        }

        Ok(())
    }

    /// customer.subscription.created / .updated: upsert the subscription's
    /// ledger row while the subscription is active
    async fn apply_subscription_updated(
        &self,
        event_id: &str,
        subscription: &SubscriptionPayload,
    ) -> BillingResult<()> {
        let user_id = user_id_from_metadata(&subscription.metadata);
        let mut entitlement_id = None;

        if subscription.status == "active" {
            let new_expiry = OffsetDateTime::from_unix_timestamp(subscription.current_period_end)
                .map_err(|_| {
                    BillingError::UnsupportedPayload(format!(
                        "invalid current_period_end {}",
                        subscription.current_period_end
                    ))
                })?;

            match self
                .store
                .find_active_by_subscription_ref(&subscription.id)
                .await?
            {
                Some(existing) => {
                    // Renewal: move the expiry forward on the existing row
                    self.store
                        .extend_subscription_expiry(&subscription.id, new_expiry)
                        .await?;
                    entitlement_id = Some(existing.id);
                    tracing::info!(
                        subscription_id = %subscription.id,
                        new_expiry = %new_expiry,
                        "Subscription renewed"
                    );
                }
                None => {
                    let Some(user_id) = user_id else {
                        tracing::error!(
                            event_id,
                            subscription_id = %subscription.id,
                            "Subscription event missing user_id metadata"
                        );
                        self.store
                            .finish_event(event_id, ProcessedEvent::with_status("error"))
                            .await?;
                        return Ok(());
                    };

                    let mut new = NewEntitlement::from_plan(
                        user_id,
                        Plan::Monthly,
                        OffsetDateTime::now_utc(),
                        subscription.customer.clone(),
                        Some(subscription.id.clone()),
                    );
                    new.expires_at = Some(new_expiry);

                    match self.store.insert_entitlement(new).await {
                        Ok(entitlement) => {
                            entitlement_id = Some(entitlement.id);
                            tracing::info!(
                                user_id = %user_id,
                                subscription_id = %subscription.id,
                                "Subscription entitlement created"
                            );
                        }
                        Err(BillingError::Conflict(_)) => {
                            // A concurrent event created the row between our
                            // read and insert; fall back to extending it.
                            self.store
                                .extend_subscription_expiry(&subscription.id, new_expiry)
                                .await?;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        } else {
            tracing::info!(
                subscription_id = %subscription.id,
                status = %subscription.status,
                "Subscription event with non-active status; ledger unchanged"
            );
        }

        self.store
            .finish_event(
                event_id,
                ProcessedEvent {
                    user_id,
                    amount: 0,
                    currency: None,
                    status: "completed".to_string(),
                    plan_name: Some(Plan::Monthly),
                    entitlement_id,
                    checkout_session_id: None,
                    payment_intent_id: None,
                },
            )
            .await?;

        Ok(())
    }

    /// customer.subscription.deleted: deactivate the ledger rows tied to
    /// the subscription
    async fn apply_subscription_deleted(
        &self,
        event_id: &str,
        subscription: &SubscriptionPayload,
    ) -> BillingResult<()> {
        let deactivated = self.store.deactivate_subscription(&subscription.id).await?;
        let user_id = user_id_from_metadata(&subscription.metadata);

        self.store
            .finish_event(
                event_id,
                ProcessedEvent {
                    user_id,
                    amount: 0,
                    currency: None,
                    status: "completed".to_string(),
                    plan_name: Some(Plan::Monthly),
                    entitlement_id: None,
                    checkout_session_id: None,
                    payment_intent_id: None,
                },
            )
            .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            deactivated,
            "Subscription canceled"
        );

        if let Some(user_id) = user_id {
            if let Ok(Some(address)) = self.store.find_user_email(user_id).await {
                let access_until =
                    OffsetDateTime::from_unix_timestamp(subscription.current_period_end)
                        .map(|dt| dt.date().to_string())
                        .unwrap_or_else(|_| "the end of the billing period".to_string());
                if let Err(e) = self
                    .email
                    .send_subscription_canceled(&address, &access_until)
                    .await
                {
                    tracing::warn!(error = %e, "Failed to send cancellation email");
                }
            }
        }

        Ok(())
    }

    /// payment_intent.succeeded / .payment_failed: audit-log only
    async fn apply_payment_intent(
        &self,
        event_id: &str,
        intent: &PaymentIntentPayload,
        failed: bool,
    ) -> BillingResult<()> {
        let user_id = user_id_from_metadata(&intent.metadata);

        self.store
            .finish_event(
                event_id,
                ProcessedEvent {
                    user_id,
                    amount: intent.amount,
                    currency: intent.currency.clone(),
                    status: if failed { "failed" } else { "completed" }.to_string(),
                    plan_name: None,
                    entitlement_id: None,
                    checkout_session_id: None,
                    payment_intent_id: Some(intent.id.clone()),
                },
            )
            .await?;

        if failed {
            tracing::warn!(
                payment_intent_id = %intent.id,
                amount = intent.amount,
                "Payment failed"
            );
            if let Some(user_id) = user_id {
                if let Ok(Some(address)) = self.store.find_user_email(user_id).await {
                    let reason = intent
                        .last_payment_error
                        .as_ref()
                        .and_then(|e| e.message.as_deref());
                    if let Err(e) = self.email.send_payment_failed(&address, reason).await {
                        tracing::warn!(error = %e, "Failed to send payment failed email");
                    }
                }
            }
        }

        Ok(())
    }
}
