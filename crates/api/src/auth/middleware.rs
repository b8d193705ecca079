//! Authentication middleware for Axum
//!
//! The core never issues or stores sessions. Bearer tokens are opaque and
//! verified by a call to the external auth provider's user endpoint; the
//! resolved user id is what the rest of the system consumes. Verification
//! results are cached briefly so a dashboard making parallel requests
//! doesn't hammer the provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

/// Cache verified tokens for 60 seconds
const TOKEN_CACHE_TTL: Duration = Duration::from_secs(60);

/// Bound the cache so a flood of unique tokens cannot exhaust memory
const MAX_CACHE_ENTRIES: usize = 10_000;

/// Authenticated user resolved from a bearer token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
}

/// Response from the auth provider's user endpoint
#[derive(Debug, Clone, Deserialize)]
struct ProviderUserResponse {
    id: String,
    email: Option<String>,
}

#[derive(Clone)]
struct CachedVerification {
    user: AuthUser,
    cached_at: Instant,
}

type TokenCache = Arc<RwLock<HashMap<String, CachedVerification>>>;

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub http_client: Client,
    pub auth_url: String,
    pub auth_anon_key: String,
    token_cache: TokenCache,
}

impl AuthState {
    pub fn new(http_client: Client, auth_url: String, auth_anon_key: String) -> Self {
        Self {
            http_client,
            auth_url,
            auth_anon_key,
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

/// Extract bearer token from the Authorization header
fn extract_bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(String::from)
}

/// Middleware that requires a verified bearer token
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = extract_bearer_token(&request) else {
        return ApiError::Unauthorized("Missing authorization header".to_string()).into_response();
    };

    match verify_token(&auth_state, &token).await {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(err) => err.into_response(),
    }
}

/// Verify a token against the auth provider, with a bounded cache
async fn verify_token(state: &AuthState, token: &str) -> ApiResult<AuthUser> {
    {
        let cache = state.token_cache.read().await;
        if let Some(hit) = cache.get(token) {
            if hit.cached_at.elapsed() < TOKEN_CACHE_TTL {
                return Ok(hit.user.clone());
            }
        }
    }

    let url = format!("{}/auth/v1/user", state.auth_url.trim_end_matches('/'));
    let response = state
        .http_client
        .get(&url)
        .bearer_auth(token)
        .header("apikey", &state.auth_anon_key)
        .send()
        .await
        .map_err(|e| ApiError::Internal(format!("auth provider unreachable: {e}")))?;

    if !response.status().is_success() {
        return Err(ApiError::Unauthorized(
            "Invalid or expired token".to_string(),
        ));
    }

    let provider_user: ProviderUserResponse = response
        .json()
        .await
        .map_err(|_| ApiError::Unauthorized("Invalid or expired token".to_string()))?;
    let user_id = Uuid::parse_str(&provider_user.id)
        .map_err(|_| ApiError::Unauthorized("Invalid or expired token".to_string()))?;

    let user = AuthUser {
        user_id,
        email: provider_user.email,
    };

    {
        let mut cache = state.token_cache.write().await;
        if cache.len() >= MAX_CACHE_ENTRIES {
            // Evict the oldest entry to stay bounded
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, v)| v.cached_at)
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            token.to_string(),
            CachedVerification {
                user: user.clone(),
                cached_at: Instant::now(),
            },
        );
    }

    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_state(url: &str) -> AuthState {
        AuthState::new(Client::new(), url.to_string(), "anon-key".to_string())
    }

    #[tokio::test]
    async fn test_valid_token_resolves_user() {
        let mut server = mockito::Server::new_async().await;
        let user_id = Uuid::new_v4();
        let mock = server
            .mock("GET", "/auth/v1/user")
            .match_header("authorization", "Bearer good-token")
            .with_status(200)
            .with_body(format!(
                r#"{{"id":"{user_id}","email":"driver@example.com"}}"#
            ))
            .create_async()
            .await;

        let state = auth_state(&server.url());
        let user = verify_token(&state, "good-token").await.unwrap();
        assert_eq!(user.user_id, user_id);
        assert_eq!(user.email.as_deref(), Some("driver@example.com"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_token_is_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/auth/v1/user")
            .with_status(401)
            .with_body(r#"{"error":"invalid token"}"#)
            .create_async()
            .await;

        let state = auth_state(&server.url());
        let err = verify_token(&state, "bad-token").await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_verification_is_cached() {
        let mut server = mockito::Server::new_async().await;
        let user_id = Uuid::new_v4();
        let mock = server
            .mock("GET", "/auth/v1/user")
            .with_status(200)
            .with_body(format!(r#"{{"id":"{user_id}","email":null}}"#))
            .expect(1)
            .create_async()
            .await;

        let state = auth_state(&server.url());
        verify_token(&state, "cached-token").await.unwrap();
        let second = verify_token(&state, "cached-token").await.unwrap();
        assert_eq!(second.user_id, user_id);
        mock.assert_async().await;
    }
}
