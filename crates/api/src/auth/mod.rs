//! Authentication for the CarMR API

pub mod middleware;

pub use middleware::{require_auth, AuthState, AuthUser};
