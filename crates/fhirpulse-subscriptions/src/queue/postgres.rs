//! PostgreSQL-backed delivery queue and audit trail.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use serde_json::Value;
use sqlx_postgres::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::DeliveryQueue;
use crate::audit::AuditTrail;
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::types::{AuditRecord, DeliveryJob, JobState};

/// How long delivered and abandoned rows are kept.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Minimum time between two sweeps of finished rows.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS subscription_delivery_job (
        id TEXT PRIMARY KEY,
        subscription_id TEXT NOT NULL,
        event JSONB NOT NULL,
        attempt INTEGER NOT NULL DEFAULT 1,
        status TEXT NOT NULL DEFAULT 'queued',
        available_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        last_error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_delivery_job_due ON subscription_delivery_job(status, available_at)",
    r#"
    CREATE TABLE IF NOT EXISTS subscription_audit (
        id TEXT PRIMARY KEY,
        subscription_id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        compartment TEXT,
        entity TEXT NOT NULL,
        channel TEXT NOT NULL,
        outcome TEXT NOT NULL,
        outcome_desc TEXT NOT NULL,
        http_status INTEGER,
        attempt INTEGER NOT NULL,
        recorded_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_subscription_audit_sub ON subscription_audit(subscription_id, recorded_at)",
];

/// Durable queue and audit trail in PostgreSQL.
///
/// Claims use `FOR UPDATE SKIP LOCKED`, so several processes may share one
/// queue. While executing, `available_at` holds the lease expiry. Finished
/// rows are deleted once older than the retention period; the audit table
/// is never pruned.
#[derive(Clone)]
pub struct PgDeliveryStore {
    pool: PgPool,
    capacity: Option<usize>,
    retention: Duration,
    last_prune: Arc<Mutex<Option<Instant>>>,
    tables_created: Arc<DashSet<&'static str>>,
}

type JobRow = (String, String, Value, i32, OffsetDateTime);

type AuditRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    String,
    Option<i32>,
    i32,
    OffsetDateTime,
);

impl PgDeliveryStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            capacity: None,
            retention: DEFAULT_RETENTION,
            last_prune: Arc::new(Mutex::new(None)),
            tables_created: Arc::new(DashSet::new()),
        }
    }

    /// Reject enqueues once this many jobs are pending.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Keep delivered and abandoned rows for `retention` after they finish.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Create the queue and audit tables if missing.
    #[instrument(skip(self))]
    pub async fn ensure_tables(&self) -> SubscriptionResult<()> {
        if self.tables_created.contains("delivery") {
            return Ok(());
        }
        for statement in SCHEMA {
            sqlx_core::query::query(statement)
                .execute(&self.pool)
                .await?;
        }
        info!("Created subscription delivery tables");
        self.tables_created.insert("delivery");
        Ok(())
    }

    /// Decode a claimed row, or hand back its id and the decode error.
    fn job_from_row(row: JobRow) -> Result<DeliveryJob, (String, serde_json::Error)> {
        let (id, subscription_id, event, attempt, created_at) = row;
        match serde_json::from_value(event) {
            Ok(event) => Ok(DeliveryJob {
                id,
                subscription_id,
                event,
                attempt: u32::try_from(attempt).unwrap_or(1),
                enqueued_at: created_at,
            }),
            Err(e) => Err((id, e)),
        }
    }

    /// Delete finished rows older than the retention period.
    pub async fn prune_finished(&self) -> SubscriptionResult<u64> {
        self.ensure_tables().await?;
        let result = sqlx_core::query::query(
            r#"
            DELETE FROM subscription_delivery_job
            WHERE status IN ($1, $2)
              AND updated_at < NOW() - make_interval(secs => $3)
            "#,
        )
        .bind(JobState::Delivered.as_str())
        .bind(JobState::Abandoned.as_str())
        .bind(self.retention.as_secs_f64())
        .execute(&self.pool)
        .await?;
        *self.last_prune.lock().await = Some(Instant::now());
        if result.rows_affected() > 0 {
            debug!(rows = result.rows_affected(), "Pruned finished delivery jobs");
        }
        Ok(result.rows_affected())
    }

    async fn prune_if_due(&self) {
        let due = self
            .last_prune
            .lock()
            .await
            .is_none_or(|at| at.elapsed() >= PRUNE_INTERVAL);
        if due && let Err(e) = self.prune_finished().await {
            warn!(error = %e, "Failed to prune finished delivery jobs");
        }
    }

    fn audit_from_row(row: AuditRow) -> AuditRecord {
        let (
            id,
            subscription_id,
            tenant_id,
            compartment,
            entity,
            channel,
            outcome,
            outcome_desc,
            http_status,
            attempt,
            recorded_at,
        ) = row;
        AuditRecord {
            id,
            subscription_id,
            tenant_id,
            compartment,
            entity,
            channel,
            outcome,
            outcome_desc,
            http_status: http_status.and_then(|s| u16::try_from(s).ok()),
            attempt: u32::try_from(attempt).unwrap_or(0),
            recorded_at,
        }
    }

    /// Move an executing job to a terminal state.
    async fn finish(
        &self,
        job_id: &str,
        state: JobState,
        error: Option<&str>,
    ) -> SubscriptionResult<()> {
        let result = sqlx_core::query::query(
            r#"
            UPDATE subscription_delivery_job
            SET status = $2, last_error = COALESCE($3, last_error), updated_at = NOW()
            WHERE id = $1 AND status = $4
            "#,
        )
        .bind(job_id)
        .bind(state.as_str())
        .bind(error)
        .bind(JobState::Executing.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(SubscriptionError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryQueue for PgDeliveryStore {
    async fn enqueue(&self, job: DeliveryJob) -> SubscriptionResult<()> {
        self.ensure_tables().await?;

        if let Some(capacity) = self.capacity {
            let depth = self.depth().await?;
            if depth >= capacity {
                return Err(SubscriptionError::QueueFull(capacity));
            }
        }

        let event = serde_json::to_value(&job.event)?;
        sqlx_core::query::query(
            r#"
            INSERT INTO subscription_delivery_job
                (id, subscription_id, event, attempt, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&job.id)
        .bind(&job.subscription_id)
        .bind(event)
        .bind(job.attempt as i32)
        .bind(JobState::Queued.as_str())
        .bind(job.enqueued_at)
        .execute(&self.pool)
        .await?;

        debug!(job_id = %job.id, subscription_id = %job.subscription_id, "Enqueued delivery job");
        Ok(())
    }

    async fn claim(&self, limit: usize, lease: Duration) -> SubscriptionResult<Vec<DeliveryJob>> {
        self.ensure_tables().await?;
        self.prune_if_due().await;

        let rows: Vec<JobRow> = sqlx_core::query_as::query_as(
            r#"
            UPDATE subscription_delivery_job
            SET status = $3,
                available_at = NOW() + make_interval(secs => $2),
                updated_at = NOW()
            WHERE id IN (
                SELECT id FROM subscription_delivery_job
                WHERE status IN ($3, $4)
                  AND available_at <= NOW()
                ORDER BY available_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, subscription_id, event, attempt, created_at
            "#,
        )
        .bind(limit as i64)
        .bind(lease.as_secs_f64())
        .bind(JobState::Executing.as_str())
        .bind(JobState::Queued.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            match Self::job_from_row(row) {
                Ok(job) => jobs.push(job),
                Err((job_id, e)) => {
                    warn!(job_id = %job_id, error = %e, "Abandoning undecodable delivery job");
                    let reason = format!("undecodable event: {e}");
                    if let Err(e) = self.finish(&job_id, JobState::Abandoned, Some(&reason)).await
                    {
                        warn!(job_id = %job_id, error = %e, "Failed to abandon delivery job");
                    }
                }
            }
        }
        Ok(jobs)
    }

    async fn complete(&self, job_id: &str) -> SubscriptionResult<()> {
        self.finish(job_id, JobState::Delivered, None).await
    }

    async fn retry(&self, job_id: &str, delay: Duration, error: &str) -> SubscriptionResult<()> {
        let result = sqlx_core::query::query(
            r#"
            UPDATE subscription_delivery_job
            SET status = $4,
                attempt = attempt + 1,
                available_at = NOW() + make_interval(secs => $2),
                last_error = $3,
                updated_at = NOW()
            WHERE id = $1 AND status = $5
            "#,
        )
        .bind(job_id)
        .bind(delay.as_secs_f64())
        .bind(error)
        .bind(JobState::Queued.as_str())
        .bind(JobState::Executing.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(SubscriptionError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn abandon(&self, job_id: &str, reason: &str) -> SubscriptionResult<()> {
        self.finish(job_id, JobState::Abandoned, Some(reason)).await
    }

    async fn depth(&self) -> SubscriptionResult<usize> {
        self.ensure_tables().await?;
        let (count,): (i64,) = sqlx_core::query_as::query_as(
            "SELECT COUNT(*) FROM subscription_delivery_job WHERE status IN ($1, $2)",
        )
        .bind(JobState::Queued.as_str())
        .bind(JobState::Executing.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[async_trait]
impl AuditTrail for PgDeliveryStore {
    async fn append(&self, record: AuditRecord) -> SubscriptionResult<()> {
        self.ensure_tables().await?;
        sqlx_core::query::query(
            r#"
            INSERT INTO subscription_audit (
                id, subscription_id, tenant_id, compartment, entity, channel,
                outcome, outcome_desc, http_status, attempt, recorded_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&record.id)
        .bind(&record.subscription_id)
        .bind(&record.tenant_id)
        .bind(&record.compartment)
        .bind(&record.entity)
        .bind(&record.channel)
        .bind(&record.outcome)
        .bind(&record.outcome_desc)
        .bind(record.http_status.map(i32::from))
        .bind(record.attempt as i32)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_subscription(
        &self,
        subscription_id: &str,
    ) -> SubscriptionResult<Vec<AuditRecord>> {
        self.ensure_tables().await?;
        let rows: Vec<AuditRow> = sqlx_core::query_as::query_as(
            r#"
            SELECT id, subscription_id, tenant_id, compartment, entity, channel,
                   outcome, outcome_desc, http_status, attempt, recorded_at
            FROM subscription_audit
            WHERE subscription_id = $1
            ORDER BY recorded_at ASC
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Self::audit_from_row).collect())
    }
}
