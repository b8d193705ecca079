//! Outbound billing e-mail notifications
//!
//! Sent via the Resend API when `RESEND_API_KEY` is configured; a no-op
//! otherwise. Every send is fire-and-forget from the caller's point of
//! view: a failure here must never roll back a ledger write.

use reqwest::Client;

use crate::error::{BillingError, BillingResult};
use crate::plans::Plan;

const RESEND_API_URL: &str = "https://api.resend.com/emails";

#[derive(Clone)]
pub struct BillingEmailService {
    client: Client,
    api_key: Option<String>,
    from_address: String,
    app_url: String,
}

impl BillingEmailService {
    /// Configure from the environment; missing key disables sending
    pub fn from_env() -> Self {
        Self {
            client: Client::new(),
            api_key: std::env::var("RESEND_API_KEY")
                .ok()
                .filter(|key| !key.is_empty()),
            from_address: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "CarMR <notifications@carmr.com>".to_string()),
            app_url: std::env::var("APP_URL").unwrap_or_else(|_| "https://carmr.com".to_string()),
        }
    }

    /// A service that never sends; used where notifications are irrelevant
    pub fn disabled() -> Self {
        Self {
            client: Client::new(),
            api_key: None,
            from_address: "CarMR <notifications@carmr.com>".to_string(),
            app_url: "https://carmr.com".to_string(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    async fn send(&self, to: &str, subject: &str, html: String) -> BillingResult<()> {
        let Some(api_key) = &self.api_key else {
            tracing::debug!(to, subject, "Email notifications disabled; skipping send");
            return Ok(());
        };

        let response = self
            .client
            .post(RESEND_API_URL)
            .bearer_auth(api_key)
            .json(&serde_json::json!({
                "from": self.from_address,
                "to": [to],
                "subject": subject,
                "html": html,
            }))
            .send()
            .await
            .map_err(|e| BillingError::Internal(format!("email send failed: {e}")))?;

        if !response.status().is_success() {
            return Err(BillingError::Internal(format!(
                "email provider returned {}",
                response.status()
            )));
        }

        Ok(())
    }

    pub async fn send_purchase_confirmation(
        &self,
        to: &str,
        plan: Plan,
        amount_cents: i64,
    ) -> BillingResult<()> {
        let credits_line = plan
            .credits()
            .map(|n| {
                format!(
                    "<p><strong>Credits:</strong> {} report{}</p>",
                    n,
                    if n > 1 { "s" } else { "" }
                )
            })
            .unwrap_or_default();

        let html = format!(
            "<h1>Thank you for your purchase!</h1>\
             <p>Your payment has been processed successfully.</p>\
             <p><strong>Plan:</strong> {}</p>\
             <p><strong>Amount:</strong> ${:.2}</p>\
             {}\
             <p><a href=\"{}/dashboard\">View your dashboard</a></p>",
            plan,
            amount_cents as f64 / 100.0,
            credits_line,
            self.app_url,
        );

        self.send(to, "Purchase Confirmation - CarMR", html).await
    }

    pub async fn send_subscription_confirmation(
        &self,
        to: &str,
        subscription_id: &str,
    ) -> BillingResult<()> {
        let html = format!(
            "<h1>Welcome to CarMR Monthly!</h1>\
             <p>Your monthly subscription is active: unlimited vehicle history reports.</p>\
             <p><a href=\"{}/\">Check a VIN now</a></p>\
             <p style=\"font-size:12px;color:#666\">Subscription ID: {}</p>",
            self.app_url, subscription_id,
        );

        self.send(to, "Subscription Activated - CarMR", html).await
    }

    pub async fn send_subscription_canceled(
        &self,
        to: &str,
        access_until: &str,
    ) -> BillingResult<()> {
        let html = format!(
            "<h1>Subscription Canceled</h1>\
             <p>Your CarMR monthly subscription has been canceled.</p>\
             <p><strong>Access until:</strong> {}</p>\
             <p>If you change your mind, you can resubscribe anytime.</p>",
            access_until,
        );

        self.send(to, "Subscription Canceled - CarMR", html).await
    }

    pub async fn send_payment_failed(&self, to: &str, reason: Option<&str>) -> BillingResult<()> {
        let reason_line = reason
            .map(|r| format!("<p><strong>Error:</strong> {}</p>", r))
            .unwrap_or_default();

        let html = format!(
            "<h1>Payment Failed</h1>\
             <p>We were unable to process your payment.</p>\
             {}\
             <p>Please check your payment method and <a href=\"{}/pricing\">try again</a>.</p>",
            reason_line, self.app_url,
        );

        self.send(to, "Payment Failed - CarMR", html).await
    }
}
