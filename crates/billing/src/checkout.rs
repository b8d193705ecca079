//! Checkout session creation
//!
//! Builds the Stripe checkout session for a plan purchase. The
//! `{user_id, plan_name}` metadata attached here is read back verbatim by
//! the webhook reconciler; it is the only linkage between a checkout and
//! a user, so it goes on the session and, for subscriptions, on the
//! subscription itself.

use std::collections::HashMap;

use serde::Serialize;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionSubscriptionData,
};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::plans::Plan;

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub url: String,
}

/// Creates hosted checkout sessions for plan purchases
pub struct CheckoutService {
    stripe: StripeClient,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    pub async fn create_session(
        &self,
        user_id: Uuid,
        plan: Plan,
    ) -> BillingResult<CheckoutResponse> {
        let config = self.stripe.config();
        let price_id = config.price_ids.price_for_plan(plan)?.to_string();

        let success_url = format!("{}/pricing?success=true&plan={}", config.app_url, plan);
        let cancel_url = format!("{}/pricing?canceled=true", config.app_url);

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("plan_name".to_string(), plan.to_string());

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(if plan.is_subscription() {
            CheckoutSessionMode::Subscription
        } else {
            CheckoutSessionMode::Payment
        });
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(price_id),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.success_url = Some(&success_url);
        params.cancel_url = Some(&cancel_url);
        params.metadata = Some(metadata.clone());
        if plan.is_subscription() {
            // Subscription lifecycle events carry the subscription's own
            // metadata, not the session's.
            params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
                metadata: Some(metadata),
                ..Default::default()
            });
        }

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;
        let url = session
            .url
            .ok_or_else(|| BillingError::Internal("checkout session has no redirect URL".to_string()))?;

        tracing::info!(
            user_id = %user_id,
            plan = %plan,
            session_id = %session.id,
            "Created checkout session"
        );

        Ok(CheckoutResponse { url })
    }
}
