//! API server configuration

use anyhow::Context;

/// Server configuration loaded once at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: String,
    /// Base URL of the auth provider; tokens are verified against its
    /// user endpoint
    pub auth_url: String,
    pub auth_anon_key: String,
    pub vehicle_data_api_url: Option<String>,
    pub vehicle_data_api_key: Option<String>,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let optional = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        Ok(Self {
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL is required")?,
            auth_url: std::env::var("AUTH_URL").context("AUTH_URL is required")?,
            auth_anon_key: std::env::var("AUTH_ANON_KEY").context("AUTH_ANON_KEY is required")?,
            vehicle_data_api_url: optional("AUTO_DATA_DIRECT_API_URL"),
            vehicle_data_api_key: optional("AUTO_DATA_DIRECT_API_KEY"),
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }
}
