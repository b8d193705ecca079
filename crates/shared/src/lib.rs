// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shared infrastructure for the CarMR workspace.
//!
//! Database pool construction, migrations, and the in-memory rate limiter
//! used by the API server.

pub mod db;
pub mod rate_limit;

pub use db::{create_pool, run_migrations};
pub use rate_limit::{RateLimitResult, RateLimiter};
