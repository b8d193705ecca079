//! Entitlement ledger model and access policy
//!
//! The ledger is the authoritative record of what access each user has
//! purchased and how much remains. Selection and aggregation are pure
//! functions over the user's active rows; every evaluation re-reads
//! storage, so there is no entitlement state cached across requests.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::plans::{Plan, PlanGrant};
use crate::store::BillingStore;

/// The three shapes of access a plan can grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitlementKind {
    Credits,
    Pass,
    Subscription,
}

impl EntitlementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitlementKind::Credits => "credits",
            EntitlementKind::Pass => "pass",
            EntitlementKind::Subscription => "subscription",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credits" => Some(EntitlementKind::Credits),
            "pass" => Some(EntitlementKind::Pass),
            "subscription" => Some(EntitlementKind::Subscription),
            _ => None,
        }
    }
}

/// One ledger row: a grant of access
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub kind: EntitlementKind,
    pub credits_remaining: i32,
    pub expires_at: Option<OffsetDateTime>,
    pub plan_name: Plan,
    #[serde(skip_serializing)]
    pub stripe_customer_id: Option<String>,
    #[serde(skip_serializing)]
    pub stripe_subscription_id: Option<String>,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
    #[serde(skip_serializing)]
    pub updated_at: OffsetDateTime,
}

impl Entitlement {
    /// Whether this grant can pay for a report right now
    pub fn is_effective(&self, now: OffsetDateTime) -> bool {
        self.is_active
            && (self.kind != EntitlementKind::Credits || self.credits_remaining > 0)
            && self.expires_at.map_or(true, |expires_at| expires_at > now)
    }
}

/// Row to be inserted into the ledger
#[derive(Debug, Clone)]
pub struct NewEntitlement {
    pub user_id: Uuid,
    pub kind: EntitlementKind,
    pub credits_remaining: i32,
    pub expires_at: Option<OffsetDateTime>,
    pub plan_name: Plan,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
}

impl NewEntitlement {
    /// Build the ledger row a plan purchase produces
    pub fn from_plan(
        user_id: Uuid,
        plan: Plan,
        now: OffsetDateTime,
        stripe_customer_id: Option<String>,
        stripe_subscription_id: Option<String>,
    ) -> Self {
        let (kind, credits_remaining, expires_at) = match plan.grant() {
            PlanGrant::Credits(n) => (EntitlementKind::Credits, n, None),
            PlanGrant::Pass(validity) => (EntitlementKind::Pass, 0, Some(now + validity)),
            PlanGrant::Subscription(period) => {
                (EntitlementKind::Subscription, 0, Some(now + period))
            }
        };

        Self {
            user_id,
            kind,
            credits_remaining,
            expires_at,
            plan_name: plan,
            stripe_customer_id,
            stripe_subscription_id,
        }
    }
}

/// Pick the grant that pays for the next report.
///
/// Passes and subscriptions are unlimited-use, so they always win over
/// spending a metered credit; among them the latest expiry is preferred.
/// Credit grants are consumed oldest-first so earlier purchases are
/// exhausted before later ones.
pub fn select_grant(rows: &[Entitlement], now: OffsetDateTime) -> Option<&Entitlement> {
    let timed = rows
        .iter()
        .filter(|e| {
            matches!(
                e.kind,
                EntitlementKind::Pass | EntitlementKind::Subscription
            ) && e.is_effective(now)
        })
        .max_by_key(|e| e.expires_at);

    if timed.is_some() {
        return timed;
    }

    rows.iter()
        .filter(|e| e.kind == EntitlementKind::Credits && e.is_effective(now))
        .min_by_key(|e| e.created_at)
}

/// Result of an access evaluation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementCheck {
    pub has_access: bool,
    pub entitlement: Option<Entitlement>,
}

/// Latest-expiring active pass or subscription, for the summary view
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveWindow {
    pub plan_name: Plan,
    pub expires_at: OffsetDateTime,
}

/// Aggregated entitlement view returned by the summary endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementSummary {
    pub has_access: bool,
    pub total_credits: i64,
    pub active_pass: Option<ActiveWindow>,
    pub active_subscription: Option<ActiveWindow>,
    pub entitlements: Vec<Entitlement>,
}

/// Aggregate a user's active rows into the summary view
pub fn summarize(rows: &[Entitlement], now: OffsetDateTime) -> EntitlementSummary {
    let mut total_credits: i64 = 0;
    let mut active_pass: Option<ActiveWindow> = None;
    let mut active_subscription: Option<ActiveWindow> = None;

    for row in rows {
        if !row.is_active {
            continue;
        }

        match row.kind {
            EntitlementKind::Credits => {
                if row.credits_remaining > 0 {
                    total_credits += i64::from(row.credits_remaining);
                }
            }
            EntitlementKind::Pass => {
                if let Some(expires_at) = row.expires_at.filter(|e| *e > now) {
                    if active_pass.as_ref().map_or(true, |p| expires_at > p.expires_at) {
                        active_pass = Some(ActiveWindow {
                            plan_name: row.plan_name,
                            expires_at,
                        });
                    }
                }
            }
            EntitlementKind::Subscription => {
                if let Some(expires_at) = row.expires_at.filter(|e| *e > now) {
                    if active_subscription
                        .as_ref()
                        .map_or(true, |s| expires_at > s.expires_at)
                    {
                        active_subscription = Some(ActiveWindow {
                            plan_name: row.plan_name,
                            expires_at,
                        });
                    }
                }
            }
        }
    }

    EntitlementSummary {
        has_access: select_grant(rows, now).is_some(),
        total_credits,
        active_pass,
        active_subscription,
        entitlements: rows.to_vec(),
    }
}

/// Evaluator and consumer over the entitlement ledger
#[derive(Clone)]
pub struct EntitlementService {
    store: Arc<dyn BillingStore>,
}

impl EntitlementService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Can this user get a report right now, and which grant pays for it?
    pub async fn check_access(&self, user_id: Uuid) -> BillingResult<EntitlementCheck> {
        let rows = self.store.list_active(user_id).await?;
        let now = OffsetDateTime::now_utc();
        let entitlement = select_grant(&rows, now).cloned();

        Ok(EntitlementCheck {
            has_access: entitlement.is_some(),
            entitlement,
        })
    }

    /// Debit a grant for one delivered report.
    ///
    /// Credits go through the conditional update with the remaining count
    /// the evaluator observed; `false` means a concurrent consumer won the
    /// race. Passes and subscriptions are unlimited within their validity
    /// window, so consuming them is a no-op.
    pub async fn consume(&self, entitlement: &Entitlement) -> BillingResult<bool> {
        match entitlement.kind {
            EntitlementKind::Credits => {
                self.store
                    .compare_and_debit_credit(entitlement.id, entitlement.credits_remaining)
                    .await
            }
            EntitlementKind::Pass | EntitlementKind::Subscription => Ok(true),
        }
    }

    /// Aggregated entitlement view for the dashboard
    pub async fn summary(&self, user_id: Uuid) -> BillingResult<EntitlementSummary> {
        let rows = self.store.list_active(user_id).await?;
        Ok(summarize(&rows, OffsetDateTime::now_utc()))
    }
}
