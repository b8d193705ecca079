//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// A uniqueness constraint rejected the write (e.g. a second active
    /// entitlement for the same Stripe subscription)
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("webhook signature invalid")]
    SignatureInvalid,

    #[error("unsupported webhook payload: {0}")]
    UnsupportedPayload(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stripe error: {0}")]
    Stripe(#[from] stripe::StripeError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}
