//! Persistence for report records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::PgPool;
use uuid::Uuid;

use super::model::Report;
use crate::error::{InspectorError, Result};

#[async_trait]
pub trait ReportRepository: Send + Sync {
    async fn insert_report(&self, report: &Report) -> Result<()>;

    /// Reports for an inspection, newest first.
    async fn list_reports(&self, inspection_id: Uuid) -> Result<Vec<Report>>;
}

#[derive(Debug, Default)]
pub struct InMemoryReportRepository {
    reports: RwLock<Vec<Report>>,
}

impl InMemoryReportRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.reports.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.read().is_empty()
    }
}

#[async_trait]
impl ReportRepository for InMemoryReportRepository {
    async fn insert_report(&self, report: &Report) -> Result<()> {
        self.reports.write().push(report.clone());
        Ok(())
    }

    async fn list_reports(&self, inspection_id: Uuid) -> Result<Vec<Report>> {
        let mut reports: Vec<Report> = self
            .reports
            .read()
            .iter()
            .filter(|r| r.inspection_id == inspection_id)
            .cloned()
            .collect();
        reports.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(reports)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ReportRow {
    id: Uuid,
    inspection_id: Uuid,
    user_id: Uuid,
    format: String,
    storage_key: String,
    size_bytes: i64,
    checksum: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ReportRow> for Report {
    type Error = InspectorError;

    fn try_from(row: ReportRow) -> Result<Self> {
        Ok(Report {
            id: row.id,
            inspection_id: row.inspection_id,
            user_id: row.user_id,
            format: row.format.parse()?,
            storage_key: row.storage_key,
            size_bytes: row.size_bytes,
            checksum: row.checksum,
            created_at: row.created_at,
        })
    }
}

#[derive(Clone)]
pub struct PgReportRepository {
    pool: PgPool,
}

impl PgReportRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReportRepository for PgReportRepository {
    async fn insert_report(&self, report: &Report) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reports (id, inspection_id, user_id, format, storage_key,
                                 size_bytes, checksum, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(report.id)
        .bind(report.inspection_id)
        .bind(report.user_id)
        .bind(report.format.as_str())
        .bind(&report.storage_key)
        .bind(report.size_bytes)
        .bind(&report.checksum)
        .bind(report.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_reports(&self, inspection_id: Uuid) -> Result<Vec<Report>> {
        let rows = sqlx::query_as::<_, ReportRow>(
            r#"
            SELECT id, inspection_id, user_id, format, storage_key, size_bytes, checksum, created_at
            FROM reports
            WHERE inspection_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(inspection_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Report::try_from).collect()
    }
}
