//! Storage seam for the entitlement ledger and processed-event log
//!
//! All shared mutable state goes through this trait. The two mutation
//! primitives that matter for correctness are `compare_and_debit_credit`
//! (optimistic concurrency for credit consumption) and `claim_event`
//! (unique-constraint idempotency for webhook deliveries); everything else
//! is a plain single-row write.
//!
//! `PgBillingStore` is the production implementation. `MemoryBillingStore`
//! mirrors its semantics behind one mutex and drives the concurrency tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::entitlements::{Entitlement, EntitlementKind, NewEntitlement};
use crate::error::{BillingError, BillingResult};
use crate::plans::Plan;

/// Outcome of claiming a webhook event id for processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClaim {
    /// This caller owns the event; side effects may proceed
    Claimed,
    /// Another delivery already claimed it; treat as processed
    Duplicate,
}

/// Final record written to the processed-event log after a transition runs
#[derive(Debug, Clone)]
pub struct ProcessedEvent {
    pub user_id: Option<Uuid>,
    pub amount: i64,
    pub currency: Option<String>,
    pub status: String,
    pub plan_name: Option<Plan>,
    pub entitlement_id: Option<Uuid>,
    pub checkout_session_id: Option<String>,
    pub payment_intent_id: Option<String>,
}

impl ProcessedEvent {
    /// A completed record with everything else unset
    pub fn completed() -> Self {
        Self {
            user_id: None,
            amount: 0,
            currency: None,
            status: "completed".to_string(),
            plan_name: None,
            entitlement_id: None,
            checkout_session_id: None,
            payment_intent_id: None,
        }
    }

    pub fn with_status(status: &str) -> Self {
        Self {
            status: status.to_string(),
            ..Self::completed()
        }
    }
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Insert a ledger row. Fails with [`BillingError::Conflict`] when the
    /// active-subscription uniqueness constraint rejects it.
    async fn insert_entitlement(&self, new: NewEntitlement) -> BillingResult<Entitlement>;

    /// All active rows for a user, newest first
    async fn list_active(&self, user_id: Uuid) -> BillingResult<Vec<Entitlement>>;

    /// Decrement one credit iff the stored count still equals
    /// `expected_remaining`. Returns false when another consumer won the
    /// race. This is the only mutation path for credit consumption.
    async fn compare_and_debit_credit(
        &self,
        entitlement_id: Uuid,
        expected_remaining: i32,
    ) -> BillingResult<bool>;

    /// Active subscription row for a Stripe subscription id, if any
    async fn find_active_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<Entitlement>>;

    /// Move the expiry of the active subscription row forward (renewal)
    async fn extend_subscription_expiry(
        &self,
        subscription_ref: &str,
        new_expires_at: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Soft-deactivate the subscription's ledger rows
    async fn deactivate_subscription(&self, subscription_ref: &str) -> BillingResult<bool>;

    /// Claim exclusive processing rights for a webhook event id. Exactly
    /// one of any number of concurrent claims for the same id wins.
    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<EventClaim>;

    /// Fill in the claimed event's row once its transition has run
    async fn finish_event(&self, event_id: &str, record: ProcessedEvent) -> BillingResult<()>;

    /// E-mail address for notifications; None when the profile is missing
    async fn find_user_email(&self, user_id: Uuid) -> BillingResult<Option<String>>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

/// Database row for an entitlement; kind and plan are stored as text
#[derive(Debug, sqlx::FromRow)]
struct EntitlementRow {
    id: Uuid,
    user_id: Uuid,
    kind: String,
    credits_remaining: i32,
    expires_at: Option<OffsetDateTime>,
    plan_name: String,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    is_active: bool,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<EntitlementRow> for Entitlement {
    type Error = BillingError;

    fn try_from(row: EntitlementRow) -> Result<Self, Self::Error> {
        let kind = EntitlementKind::parse(&row.kind).ok_or_else(|| {
            BillingError::Internal(format!("unknown entitlement kind '{}'", row.kind))
        })?;
        let plan_name = row
            .plan_name
            .parse::<Plan>()
            .map_err(BillingError::Internal)?;

        Ok(Entitlement {
            id: row.id,
            user_id: row.user_id,
            kind,
            credits_remaining: row.credits_remaining,
            expires_at: row.expires_at,
            plan_name,
            stripe_customer_id: row.stripe_customer_id,
            stripe_subscription_id: row.stripe_subscription_id,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const ENTITLEMENT_COLUMNS: &str = "id, user_id, kind, credits_remaining, expires_at, plan_name, \
     stripe_customer_id, stripe_subscription_id, is_active, created_at, updated_at";

pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn insert_entitlement(&self, new: NewEntitlement) -> BillingResult<Entitlement> {
        let query = format!(
            r#"
            INSERT INTO entitlements
                (user_id, kind, credits_remaining, expires_at, plan_name,
                 stripe_customer_id, stripe_subscription_id, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE)
            RETURNING {ENTITLEMENT_COLUMNS}
            "#
        );

        let row: EntitlementRow = sqlx::query_as(&query)
            .bind(new.user_id)
            .bind(new.kind.as_str())
            .bind(new.credits_remaining)
            .bind(new.expires_at)
            .bind(new.plan_name.as_str())
            .bind(new.stripe_customer_id.as_deref())
            .bind(new.stripe_subscription_id.as_deref())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                let unique_violation =
                    matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation());
                if unique_violation {
                    BillingError::Conflict(format!(
                        "active entitlement already exists for subscription {:?}",
                        new.stripe_subscription_id
                    ))
                } else {
                    BillingError::Database(e)
                }
            })?;

        row.try_into()
    }

    async fn list_active(&self, user_id: Uuid) -> BillingResult<Vec<Entitlement>> {
        let query = format!(
            r#"
            SELECT {ENTITLEMENT_COLUMNS}
            FROM entitlements
            WHERE user_id = $1 AND is_active
            ORDER BY created_at DESC
            "#
        );

        let rows: Vec<EntitlementRow> = sqlx::query_as(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Entitlement::try_from).collect()
    }

    async fn compare_and_debit_credit(
        &self,
        entitlement_id: Uuid,
        expected_remaining: i32,
    ) -> BillingResult<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE entitlements
            SET credits_remaining = credits_remaining - 1, updated_at = NOW()
            WHERE id = $1
              AND credits_remaining = $2
              AND credits_remaining > 0
            "#,
        )
        .bind(entitlement_id)
        .bind(expected_remaining)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    async fn find_active_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<Entitlement>> {
        let query = format!(
            r#"
            SELECT {ENTITLEMENT_COLUMNS}
            FROM entitlements
            WHERE stripe_subscription_id = $1
              AND is_active
              AND kind = 'subscription'
            LIMIT 1
            "#
        );

        let row: Option<EntitlementRow> = sqlx::query_as(&query)
            .bind(subscription_ref)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Entitlement::try_from).transpose()
    }

    async fn extend_subscription_expiry(
        &self,
        subscription_ref: &str,
        new_expires_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE entitlements
            SET expires_at = $2, updated_at = NOW()
            WHERE stripe_subscription_id = $1
              AND is_active
              AND kind = 'subscription'
            "#,
        )
        .bind(subscription_ref)
        .bind(new_expires_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    async fn deactivate_subscription(&self, subscription_ref: &str) -> BillingResult<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE entitlements
            SET is_active = FALSE, updated_at = NOW()
            WHERE stripe_subscription_id = $1
              AND is_active
            "#,
        )
        .bind(subscription_ref)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<EventClaim> {
        // INSERT ... ON CONFLICT DO NOTHING RETURNING atomically decides
        // the winner; the loser sees no row and backs off.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO transactions (stripe_event_id, event_type, status)
            VALUES ($1, $2, 'processing')
            ON CONFLICT (stripe_event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(if claimed.is_some() {
            EventClaim::Claimed
        } else {
            EventClaim::Duplicate
        })
    }

    async fn finish_event(&self, event_id: &str, record: ProcessedEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE transactions
            SET user_id = $2,
                amount = $3,
                currency = COALESCE($4, currency),
                status = $5,
                plan_name = $6,
                entitlement_id = $7,
                stripe_checkout_session_id = $8,
                stripe_payment_intent_id = $9,
                processed_at = NOW()
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(record.user_id)
        .bind(record.amount)
        .bind(record.currency.as_deref())
        .bind(&record.status)
        .bind(record.plan_name.map(|p| p.as_str()))
        .bind(record.entitlement_id)
        .bind(record.checkout_session_id.as_deref())
        .bind(record.payment_intent_id.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_user_email(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT email FROM profiles WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(email,)| email))
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    entitlements: Vec<Entitlement>,
    events: HashMap<String, (String, String)>,
    emails: HashMap<Uuid, String>,
}

/// In-memory store with the same semantics as the Postgres one. A single
/// mutex stands in for the database's row-level atomicity.
#[derive(Default)]
pub struct MemoryBillingStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a ledger row directly, bypassing plan derivation
    pub async fn seed_entitlement(&self, entitlement: Entitlement) {
        self.inner.lock().await.entitlements.push(entitlement);
    }

    /// Seed a profile e-mail for notification lookups
    pub async fn seed_email(&self, user_id: Uuid, email: &str) {
        self.inner.lock().await.emails.insert(user_id, email.to_string());
    }

    /// Processed-event rows as (event_id, status) pairs
    pub async fn recorded_events(&self) -> Vec<(String, String)> {
        self.inner
            .lock()
            .await
            .events
            .iter()
            .map(|(id, (_, status))| (id.clone(), status.clone()))
            .collect()
    }

    /// Every ledger row, active or not
    pub async fn all_entitlements(&self) -> Vec<Entitlement> {
        self.inner.lock().await.entitlements.clone()
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn insert_entitlement(&self, new: NewEntitlement) -> BillingResult<Entitlement> {
        let mut inner = self.inner.lock().await;

        if new.kind == EntitlementKind::Subscription {
            if let Some(sub_ref) = new.stripe_subscription_id.as_deref() {
                let exists = inner.entitlements.iter().any(|e| {
                    e.is_active
                        && e.kind == EntitlementKind::Subscription
                        && e.stripe_subscription_id.as_deref() == Some(sub_ref)
                });
                if exists {
                    return Err(BillingError::Conflict(format!(
                        "active entitlement already exists for subscription {sub_ref}"
                    )));
                }
            }
        }

        let now = OffsetDateTime::now_utc();
        let entitlement = Entitlement {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            kind: new.kind,
            credits_remaining: new.credits_remaining,
            expires_at: new.expires_at,
            plan_name: new.plan_name,
            stripe_customer_id: new.stripe_customer_id,
            stripe_subscription_id: new.stripe_subscription_id,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        inner.entitlements.push(entitlement.clone());
        Ok(entitlement)
    }

    async fn list_active(&self, user_id: Uuid) -> BillingResult<Vec<Entitlement>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<Entitlement> = inner
            .entitlements
            .iter()
            .filter(|e| e.user_id == user_id && e.is_active)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn compare_and_debit_credit(
        &self,
        entitlement_id: Uuid,
        expected_remaining: i32,
    ) -> BillingResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(row) = inner
            .entitlements
            .iter_mut()
            .find(|e| e.id == entitlement_id)
        else {
            return Ok(false);
        };

        if row.credits_remaining != expected_remaining || row.credits_remaining <= 0 {
            return Ok(false);
        }

        row.credits_remaining -= 1;
        row.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn find_active_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<Entitlement>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entitlements
            .iter()
            .find(|e| {
                e.is_active
                    && e.kind == EntitlementKind::Subscription
                    && e.stripe_subscription_id.as_deref() == Some(subscription_ref)
            })
            .cloned())
    }

    async fn extend_subscription_expiry(
        &self,
        subscription_ref: &str,
        new_expires_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut inner = self.inner.lock().await;
        let mut updated = false;
        for row in inner.entitlements.iter_mut().filter(|e| {
            e.is_active
                && e.kind == EntitlementKind::Subscription
                && e.stripe_subscription_id.as_deref() == Some(subscription_ref)
        }) {
            row.expires_at = Some(new_expires_at);
            row.updated_at = OffsetDateTime::now_utc();
            updated = true;
        }
        Ok(updated)
    }

    async fn deactivate_subscription(&self, subscription_ref: &str) -> BillingResult<bool> {
        let mut inner = self.inner.lock().await;
        let mut updated = false;
        for row in inner
            .entitlements
            .iter_mut()
            .filter(|e| e.is_active && e.stripe_subscription_id.as_deref() == Some(subscription_ref))
        {
            row.is_active = false;
            row.updated_at = OffsetDateTime::now_utc();
            updated = true;
        }
        Ok(updated)
    }

    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<EventClaim> {
        let mut inner = self.inner.lock().await;
        if inner.events.contains_key(event_id) {
            return Ok(EventClaim::Duplicate);
        }
        inner.events.insert(
            event_id.to_string(),
            (event_type.to_string(), "processing".to_string()),
        );
        Ok(EventClaim::Claimed)
    }

    async fn finish_event(&self, event_id: &str, record: ProcessedEvent) -> BillingResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.events.get_mut(event_id) {
            entry.1 = record.status;
        }
        Ok(())
    }

    async fn find_user_email(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        Ok(self.inner.lock().await.emails.get(&user_id).cloned())
    }
}
