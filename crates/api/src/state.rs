//! Application state

use std::sync::Arc;

use reqwest::Client;
use sqlx::PgPool;

use carmr_billing::BillingService;
use carmr_shared::RateLimiter;

use crate::auth::AuthState;
use crate::config::Config;
use crate::lookup::{VehicleDataClient, VehicleLookup};
use crate::reports::{PgReportStore, ReportService, ReportStore};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
    pub reports: ReportService,
    pub rate_limiter: RateLimiter,
    pub http_client: Client,
    auth_state: AuthState,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let http_client = Client::new();

        let billing = Arc::new(BillingService::from_env(pool.clone())?);
        tracing::info!("Stripe billing service initialized");

        let lookup: Arc<dyn VehicleLookup> = Arc::new(VehicleDataClient::new(
            http_client.clone(),
            config.vehicle_data_api_url.clone(),
            config.vehicle_data_api_key.clone(),
        ));
        if config.vehicle_data_api_url.is_none() {
            tracing::warn!(
                "Vehicle data provider not configured; lookups will serve placeholder reports"
            );
        }

        let report_store: Arc<dyn ReportStore> = Arc::new(PgReportStore::new(pool.clone()));
        let reports = ReportService::new(report_store, billing.entitlements.clone(), lookup);

        let rate_limiter = RateLimiter::new_in_memory();

        let auth_state = AuthState::new(
            http_client.clone(),
            config.auth_url.clone(),
            config.auth_anon_key.clone(),
        );

        Ok(Self {
            pool,
            config,
            billing,
            reports,
            rate_limiter,
            http_client,
            auth_state,
        })
    }

    /// Auth state for the middleware layer
    pub fn auth_state(&self) -> AuthState {
        self.auth_state.clone()
    }
}
