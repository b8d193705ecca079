//! Stripe client and configuration

use crate::error::{BillingError, BillingResult};
use crate::plans::Plan;

/// Stripe price ids for each plan, from the environment
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub single: String,
    pub five_pack: String,
    pub twenty_pack: String,
    pub three_day_pass: String,
    pub monthly: String,
}

impl PriceIds {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).unwrap_or_default();
        Self {
            single: var("STRIPE_PRICE_SINGLE"),
            five_pack: var("STRIPE_PRICE_5_PACK"),
            twenty_pack: var("STRIPE_PRICE_20_PACK"),
            three_day_pass: var("STRIPE_PRICE_3_DAY_PASS"),
            monthly: var("STRIPE_PRICE_MONTHLY"),
        }
    }

    /// Resolve a plan to its configured price id
    pub fn price_for_plan(&self, plan: Plan) -> BillingResult<&str> {
        let price_id = match plan {
            Plan::Single => &self.single,
            Plan::FivePack => &self.five_pack,
            Plan::TwentyPack => &self.twenty_pack,
            Plan::ThreeDayPass => &self.three_day_pass,
            Plan::Monthly => &self.monthly,
        };

        if price_id.is_empty() {
            return Err(BillingError::Config(format!(
                "no Stripe price configured for plan '{plan}'"
            )));
        }

        Ok(price_id)
    }
}

/// Stripe configuration loaded from the environment
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_ids: PriceIds,
    pub app_url: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not configured".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not configured".to_string()))?;

        Ok(Self {
            secret_key,
            webhook_secret,
            price_ids: PriceIds::from_env(),
            app_url: std::env::var("APP_URL").unwrap_or_else(|_| "https://carmr.com".to_string()),
        })
    }
}

/// Thin wrapper pairing the Stripe API client with its configuration
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            inner: stripe::Client::new(config.secret_key.clone()),
            config,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
