// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! CarMR API Library
//!
//! The HTTP server for the CarMR storefront: authentication, report
//! acquisition, checkout, entitlements, and the payment webhook endpoint.

pub mod auth;
pub mod config;
pub mod error;
pub mod lookup;
pub mod reports;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
