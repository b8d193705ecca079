//! Vehicle report storage and the acquisition flow
//!
//! One request, one orchestration: cache check, entitlement evaluation,
//! pending insert, provider lookup (with placeholder fallback), completion,
//! and only then the entitlement debit. A cache hit never consumes a
//! grant; a lookup failure never surfaces to the user.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use carmr_billing::EntitlementService;

use crate::error::{ApiError, ApiResult};
use crate::lookup::{fallback_report, PlateQuery, VehicleLookup, Vin, PLATE_FALLBACK_VIN};

/// How long a completed report serves cache hits
const REPORT_CACHE_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Pending,
    Completed,
    Failed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "pending",
            ReportStatus::Completed => "completed",
            ReportStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReportStatus::Pending),
            "completed" => Some(ReportStatus::Completed),
            "failed" => Some(ReportStatus::Failed),
            _ => None,
        }
    }
}

/// One stored vehicle history report
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: Uuid,
    pub user_id: Uuid,
    pub vin: String,
    pub license_plate: Option<String>,
    pub license_state: Option<String>,
    pub status: ReportStatus,
    pub report_data: Option<serde_json::Value>,
    pub entitlement_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

/// What the user asked for: a VIN directly, or a plate to resolve
#[derive(Debug, Clone)]
pub enum ReportIdentifier {
    Vin(Vin),
    Plate(PlateQuery),
}

impl ReportIdentifier {
    fn endpoint(&self) -> &'static str {
        match self {
            ReportIdentifier::Vin(_) => "/api/vin",
            ReportIdentifier::Plate(_) => "/api/plate",
        }
    }
}

/// Row for the pending insert
#[derive(Debug, Clone)]
pub struct NewReport {
    pub user_id: Uuid,
    pub vin: String,
    pub license_plate: Option<String>,
    pub license_state: Option<String>,
    pub entitlement_id: Option<Uuid>,
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Latest completed, unexpired report for this user + identifier
    async fn find_cached(
        &self,
        user_id: Uuid,
        identifier: &ReportIdentifier,
    ) -> ApiResult<Option<Report>>;

    /// Insert a pending row, reserving the slot for this request
    async fn insert_pending(&self, new: NewReport) -> ApiResult<Report>;

    /// Move a pending row to completed with its payload; a row completes
    /// exactly once
    async fn complete(&self, report_id: Uuid, data: serde_json::Value) -> ApiResult<()>;

    /// Fetch a report the user owns
    async fn find_by_id(&self, user_id: Uuid, report_id: Uuid) -> ApiResult<Option<Report>>;

    /// Fire-and-forget request audit row
    async fn record_request_audit(
        &self,
        user_id: Uuid,
        ip_address: Option<&str>,
        endpoint: &str,
        blocked: bool,
    ) -> ApiResult<()>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct ReportRow {
    id: Uuid,
    user_id: Uuid,
    vin: String,
    license_plate: Option<String>,
    license_state: Option<String>,
    status: String,
    report_data: Option<serde_json::Value>,
    entitlement_id: Option<Uuid>,
    created_at: OffsetDateTime,
    expires_at: OffsetDateTime,
}

impl TryFrom<ReportRow> for Report {
    type Error = ApiError;

    fn try_from(row: ReportRow) -> Result<Self, Self::Error> {
        let status = ReportStatus::parse(&row.status)
            .ok_or_else(|| ApiError::Internal(format!("unknown report status '{}'", row.status)))?;

        Ok(Report {
            id: row.id,
            user_id: row.user_id,
            vin: row.vin,
            license_plate: row.license_plate,
            license_state: row.license_state,
            status,
            report_data: row.report_data,
            entitlement_id: row.entitlement_id,
            created_at: row.created_at,
            expires_at: row.expires_at,
        })
    }
}

const REPORT_COLUMNS: &str = "id, user_id, vin, license_plate, license_state, status, \
     report_data, entitlement_id, created_at, expires_at";

pub struct PgReportStore {
    pool: PgPool,
}

impl PgReportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn find_cached(
        &self,
        user_id: Uuid,
        identifier: &ReportIdentifier,
    ) -> ApiResult<Option<Report>> {
        let row: Option<ReportRow> = match identifier {
            ReportIdentifier::Vin(vin) => {
                let query = format!(
                    r#"
                    SELECT {REPORT_COLUMNS}
                    FROM reports
                    WHERE user_id = $1
                      AND vin = $2
                      AND status = 'completed'
                      AND expires_at > NOW()
                    ORDER BY created_at DESC
                    LIMIT 1
                    "#
                );
                sqlx::query_as(&query)
                    .bind(user_id)
                    .bind(vin.as_str())
                    .fetch_optional(&self.pool)
                    .await?
            }
            ReportIdentifier::Plate(plate) => {
                let query = format!(
                    r#"
                    SELECT {REPORT_COLUMNS}
                    FROM reports
                    WHERE user_id = $1
                      AND license_plate = $2
                      AND license_state = $3
                      AND status = 'completed'
                      AND expires_at > NOW()
                    ORDER BY created_at DESC
                    LIMIT 1
                    "#
                );
                sqlx::query_as(&query)
                    .bind(user_id)
                    .bind(&plate.plate)
                    .bind(&plate.state)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };

        row.map(Report::try_from).transpose()
    }

    async fn insert_pending(&self, new: NewReport) -> ApiResult<Report> {
        let query = format!(
            r#"
            INSERT INTO reports (user_id, vin, license_plate, license_state, status, entitlement_id)
            VALUES ($1, $2, $3, $4, 'pending', $5)
            RETURNING {REPORT_COLUMNS}
            "#
        );

        let row: ReportRow = sqlx::query_as(&query)
            .bind(new.user_id)
            .bind(&new.vin)
            .bind(new.license_plate.as_deref())
            .bind(new.license_state.as_deref())
            .bind(new.entitlement_id)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn complete(&self, report_id: Uuid, data: serde_json::Value) -> ApiResult<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE reports
            SET report_data = $2, status = 'completed'
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(report_id)
        .bind(&data)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(ApiError::Internal(format!(
                "report {report_id} was not pending"
            )));
        }

        Ok(())
    }

    async fn find_by_id(&self, user_id: Uuid, report_id: Uuid) -> ApiResult<Option<Report>> {
        let query = format!(
            r#"
            SELECT {REPORT_COLUMNS}
            FROM reports
            WHERE id = $1 AND user_id = $2
            "#
        );

        let row: Option<ReportRow> = sqlx::query_as(&query)
            .bind(report_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Report::try_from).transpose()
    }

    async fn record_request_audit(
        &self,
        user_id: Uuid,
        ip_address: Option<&str>,
        endpoint: &str,
        blocked: bool,
    ) -> ApiResult<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_limit_events (user_id, ip_address, endpoint, blocked)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(user_id)
        .bind(ip_address)
        .bind(endpoint)
        .bind(blocked)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryReports {
    reports: Vec<Report>,
    audits: Vec<(Uuid, String, bool)>,
}

/// In-memory report store for tests; mirrors the Postgres semantics
#[derive(Default)]
pub struct MemoryReportStore {
    inner: Arc<Mutex<MemoryReports>>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a report row directly
    pub async fn seed_report(&self, report: Report) {
        self.inner.lock().await.reports.push(report);
    }

    pub async fn report_count(&self) -> usize {
        self.inner.lock().await.reports.len()
    }

    pub async fn audit_count(&self) -> usize {
        self.inner.lock().await.audits.len()
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn find_cached(
        &self,
        user_id: Uuid,
        identifier: &ReportIdentifier,
    ) -> ApiResult<Option<Report>> {
        let now = OffsetDateTime::now_utc();
        let inner = self.inner.lock().await;
        Ok(inner
            .reports
            .iter()
            .filter(|r| {
                r.user_id == user_id && r.status == ReportStatus::Completed && r.expires_at > now
            })
            .filter(|r| match identifier {
                ReportIdentifier::Vin(vin) => r.vin == vin.as_str(),
                ReportIdentifier::Plate(plate) => {
                    r.license_plate.as_deref() == Some(plate.plate.as_str())
                        && r.license_state.as_deref() == Some(plate.state.as_str())
                }
            })
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn insert_pending(&self, new: NewReport) -> ApiResult<Report> {
        let now = OffsetDateTime::now_utc();
        let report = Report {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            vin: new.vin,
            license_plate: new.license_plate,
            license_state: new.license_state,
            status: ReportStatus::Pending,
            report_data: None,
            entitlement_id: new.entitlement_id,
            created_at: now,
            expires_at: now + Duration::days(REPORT_CACHE_DAYS),
        };
        self.inner.lock().await.reports.push(report.clone());
        Ok(report)
    }

    async fn complete(&self, report_id: Uuid, data: serde_json::Value) -> ApiResult<()> {
        let mut inner = self.inner.lock().await;
        let Some(report) = inner
            .reports
            .iter_mut()
            .find(|r| r.id == report_id && r.status == ReportStatus::Pending)
        else {
            return Err(ApiError::Internal(format!(
                "report {report_id} was not pending"
            )));
        };
        report.report_data = Some(data);
        report.status = ReportStatus::Completed;
        Ok(())
    }

    async fn find_by_id(&self, user_id: Uuid, report_id: Uuid) -> ApiResult<Option<Report>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .reports
            .iter()
            .find(|r| r.id == report_id && r.user_id == user_id)
            .cloned())
    }

    async fn record_request_audit(
        &self,
        user_id: Uuid,
        _ip_address: Option<&str>,
        endpoint: &str,
        blocked: bool,
    ) -> ApiResult<()> {
        self.inner
            .lock()
            .await
            .audits
            .push((user_id, endpoint.to_string(), blocked));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Acquisition flow
// ---------------------------------------------------------------------------

/// Response for a report request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportOutcome {
    pub report_id: Uuid,
    pub vin: String,
    pub cached: bool,
}

/// Orchestrates a single report request
#[derive(Clone)]
pub struct ReportService {
    store: Arc<dyn ReportStore>,
    entitlements: EntitlementService,
    lookup: Arc<dyn VehicleLookup>,
}

impl ReportService {
    pub fn new(
        store: Arc<dyn ReportStore>,
        entitlements: EntitlementService,
        lookup: Arc<dyn VehicleLookup>,
    ) -> Self {
        Self {
            store,
            entitlements,
            lookup,
        }
    }

    pub async fn acquire(
        &self,
        user_id: Uuid,
        identifier: ReportIdentifier,
        client_ip: Option<&str>,
    ) -> ApiResult<ReportOutcome> {
        // Cache hit: serve the completed report, consume nothing
        if let Some(report) = self.store.find_cached(user_id, &identifier).await? {
            tracing::debug!(user_id = %user_id, report_id = %report.id, "Report served from cache");
            return Ok(ReportOutcome {
                report_id: report.id,
                vin: report.vin,
                cached: true,
            });
        }

        // Entitlement evaluation precedes every write; 402 leaves no row
        let check = self.entitlements.check_access(user_id).await?;
        let Some(entitlement) = check.entitlement else {
            return Err(ApiError::PaymentRequired);
        };

        // A plate must be resolved to a VIN before the pending insert; the
        // provider response doubles as the report payload when it succeeds.
        let (vin, license_plate, license_state, resolved_data) = match &identifier {
            ReportIdentifier::Vin(vin) => (vin.as_str().to_string(), None, None, None),
            ReportIdentifier::Plate(plate) => match self.lookup.lookup_plate(plate).await {
                Ok(hit) => (
                    hit.vin,
                    Some(plate.plate.clone()),
                    Some(plate.state.clone()),
                    Some(hit.data),
                ),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        plate = %plate.plate,
                        state = %plate.state,
                        fallback = true,
                        "Plate lookup failed, serving placeholder report"
                    );
                    (
                        PLATE_FALLBACK_VIN.to_string(),
                        Some(plate.plate.clone()),
                        Some(plate.state.clone()),
                        None,
                    )
                }
            },
        };

        let pending = self
            .store
            .insert_pending(NewReport {
                user_id,
                vin: vin.clone(),
                license_plate,
                license_state,
                entitlement_id: Some(entitlement.id),
            })
            .await?;

        let report_data = match (resolved_data, &identifier) {
            (Some(mut data), _) => {
                if let Some(object) = data.as_object_mut() {
                    object.insert("reportId".to_string(), json!(pending.id));
                }
                data
            }
            (None, ReportIdentifier::Vin(lookup_vin)) => {
                match self.lookup.lookup_vin(lookup_vin).await {
                    Ok(mut data) => {
                        if let Some(object) = data.as_object_mut() {
                            object.insert("reportId".to_string(), json!(pending.id));
                        }
                        data
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            vin = %lookup_vin,
                            fallback = true,
                            "Vehicle lookup failed, serving placeholder report"
                        );
                        fallback_report(&vin, pending.id)
                    }
                }
            }
            (None, ReportIdentifier::Plate(_)) => fallback_report(&vin, pending.id),
        };

        // A failure here leaves the row pending; nothing has been debited
        self.store.complete(pending.id, report_data).await?;

        // Debit only after the report is completed, so a failed generation
        // never burns a credit. A lost debit race is accepted: the report
        // has already been delivered.
        if !self.entitlements.consume(&entitlement).await? {
            tracing::warn!(
                user_id = %user_id,
                entitlement_id = %entitlement.id,
                "Credit debit lost a concurrent race"
            );
        }

        if let Err(e) = self
            .store
            .record_request_audit(user_id, client_ip, identifier.endpoint(), false)
            .await
        {
            tracing::warn!(error = %e, "Failed to record request audit");
        }

        Ok(ReportOutcome {
            report_id: pending.id,
            vin,
            cached: false,
        })
    }

    /// Fetch a stored report the user owns
    pub async fn fetch(&self, user_id: Uuid, report_id: Uuid) -> ApiResult<Report> {
        self.store
            .find_by_id(user_id, report_id)
            .await?
            .ok_or(ApiError::NotFound)
    }
}
