// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! CarMR Billing Module
//!
//! The entitlement ledger and payment-reconciliation core of the
//! storefront.
//!
//! ## Features
//!
//! - **Plan Catalog**: credit packs, the 3-day pass, the monthly subscription
//! - **Entitlement Ledger**: who bought what, and how much remains
//! - **Evaluator / Consumer**: decide which grant pays for a report, then
//!   debit it exactly once per delivered report
//! - **Checkout**: Stripe checkout sessions with the user/plan metadata
//!   round-trip
//! - **Webhooks**: idempotent reconciliation of the payment event stream
//! - **Email Notifications**: purchase, subscription, and payment-failure
//!   confirmations

pub mod checkout;
pub mod client;
pub mod email;
pub mod entitlements;
pub mod error;
pub mod events;
pub mod plans;
pub mod store;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Checkout
pub use checkout::{CheckoutResponse, CheckoutService};

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Email
pub use email::BillingEmailService;

// Entitlements
pub use entitlements::{
    select_grant, summarize, ActiveWindow, Entitlement, EntitlementCheck, EntitlementKind,
    EntitlementService, EntitlementSummary, NewEntitlement,
};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    CheckoutSessionPayload, EventEnvelope, PaymentIntentPayload, SubscriptionPayload, WebhookEvent,
};

// Plans
pub use plans::{Plan, PlanGrant};

// Store
pub use store::{BillingStore, EventClaim, MemoryBillingStore, PgBillingStore, ProcessedEvent};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub checkout: CheckoutService,
    pub entitlements: EntitlementService,
    pub webhooks: WebhookHandler,
    pub email: BillingEmailService,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::with_store(
            StripeClient::from_env()?,
            Arc::new(PgBillingStore::new(pool)),
        ))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self::with_store(
            StripeClient::new(config),
            Arc::new(PgBillingStore::new(pool)),
        )
    }

    fn with_store(stripe: StripeClient, store: Arc<dyn BillingStore>) -> Self {
        let email = BillingEmailService::from_env();
        let webhook_secret = stripe.config().webhook_secret.clone();

        Self {
            checkout: CheckoutService::new(stripe),
            entitlements: EntitlementService::new(store.clone()),
            webhooks: WebhookHandler::new(store, email.clone(), webhook_secret),
            email,
        }
    }
}
