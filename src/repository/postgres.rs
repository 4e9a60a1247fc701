use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{default_retention_statuses, LogMutation, NotificationLogRepository};
use crate::error::{Error, Result};
use crate::models::notification_log::{LogFilter, NotificationLog, NotificationStatus, PageRequest};
use crate::utils::time::Clock;

const COLUMNS: &str = "id, recipient, notification_type, payload, status, created_at, updated_at, \
     sent_at, error_log, retry_count, next_retry_at, job_id, metadata";

/// PostgreSQL store. Mutations lock the row (`FOR UPDATE`) for the whole
/// read-modify-write so concurrent writers to one log are serialized.
#[derive(Clone)]
pub struct PgLogRepository {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgLogRepository {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct NotificationLogRow {
    id: Uuid,
    recipient: String,
    notification_type: String,
    payload: JsonValue,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    error_log: Vec<String>,
    retry_count: i32,
    next_retry_at: Option<DateTime<Utc>>,
    job_id: Option<String>,
    metadata: JsonValue,
}

impl TryFrom<NotificationLogRow> for NotificationLog {
    type Error = Error;

    fn try_from(r: NotificationLogRow) -> Result<Self> {
        let metadata = match r.metadata {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        };
        Ok(NotificationLog {
            id: r.id,
            to: r.recipient,
            notification_type: r.notification_type.parse()?,
            payload: r.payload,
            status: r.status.parse()?,
            created_at: r.created_at,
            updated_at: r.updated_at,
            sent_at: r.sent_at,
            error_log: r.error_log,
            retry_count: r.retry_count.max(0) as u32,
            next_retry_at: r.next_retry_at,
            job_id: r.job_id,
            metadata,
        })
    }
}

fn convert(rows: Vec<NotificationLogRow>) -> Result<Vec<NotificationLog>> {
    rows.into_iter().map(NotificationLog::try_from).collect()
}

fn status_strings(statuses: &[NotificationStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &LogFilter) {
    qb.push(" WHERE TRUE");
    if !filter.statuses.is_empty() {
        qb.push(" AND status = ANY(")
            .push_bind(status_strings(&filter.statuses))
            .push(")");
    }
    if let Some(ty) = filter.notification_type {
        qb.push(" AND notification_type = ")
            .push_bind(ty.as_str().to_string());
    }
    if let Some(to) = &filter.to {
        qb.push(" AND lower(recipient) = lower(")
            .push_bind(to.clone())
            .push(")");
    }
    if let Some(job_id) = &filter.job_id {
        qb.push(" AND job_id = ").push_bind(job_id.clone());
    }
    if let Some(after) = filter.created_after {
        qb.push(" AND created_at >= ").push_bind(after);
    }
    if let Some(before) = filter.created_before {
        qb.push(" AND created_at < ").push_bind(before);
    }
}

#[async_trait]
impl NotificationLogRepository for PgLogRepository {
    async fn create(&self, log: NotificationLog) -> Result<NotificationLog> {
        let row: NotificationLogRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO notification_logs (
                id, recipient, notification_type, payload, status, created_at, updated_at,
                sent_at, error_log, retry_count, next_retry_at, job_id, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(log.id)
        .bind(&log.to)
        .bind(log.notification_type.as_str())
        .bind(&log.payload)
        .bind(log.status.as_str())
        .bind(log.created_at)
        .bind(log.updated_at)
        .bind(log.sent_at)
        .bind(&log.error_log)
        .bind(log.retry_count as i32)
        .bind(log.next_retry_at)
        .bind(&log.job_id)
        .bind(JsonValue::Object(log.metadata.clone()))
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<NotificationLog>> {
        let row: Option<NotificationLogRow> = sqlx::query_as(&format!(
            "SELECT {} FROM notification_logs WHERE id = $1",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(NotificationLog::try_from).transpose()
    }

    async fn find_by_job_id(&self, job_id: &str) -> Result<Vec<NotificationLog>> {
        let rows: Vec<NotificationLogRow> = sqlx::query_as(&format!(
            "SELECT {} FROM notification_logs WHERE job_id = $1 ORDER BY created_at ASC, id ASC",
            COLUMNS
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn find_by_provider_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<NotificationLog>> {
        let row: Option<NotificationLogRow> = sqlx::query_as(&format!(
            r#"SELECT {} FROM notification_logs
               WHERE metadata->>'provider_message_id' = $1
               ORDER BY created_at DESC
               LIMIT 1"#,
            COLUMNS
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(NotificationLog::try_from).transpose()
    }

    async fn find_latest_by_recipient(&self, to: &str) -> Result<Option<NotificationLog>> {
        let row: Option<NotificationLogRow> = sqlx::query_as(&format!(
            r#"SELECT {} FROM notification_logs
               WHERE lower(recipient) = lower($1)
               ORDER BY created_at DESC, id DESC
               LIMIT 1"#,
            COLUMNS
        ))
        .bind(to)
        .fetch_optional(&self.pool)
        .await?;
        row.map(NotificationLog::try_from).transpose()
    }

    async fn modify(&self, id: Uuid, mutation: LogMutation) -> Result<NotificationLog> {
        let mut tx = self.pool.begin().await?;
        let row: Option<NotificationLogRow> = sqlx::query_as(&format!(
            "SELECT {} FROM notification_logs WHERE id = $1 FOR UPDATE",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(Error::NotFound(format!("Notification log {} not found", id)));
        };
        let mut log = NotificationLog::try_from(row)?;
        mutation(&mut log, self.clock.now())?;

        sqlx::query(
            r#"
            UPDATE notification_logs
            SET payload = $2, status = $3, updated_at = $4, sent_at = $5, error_log = $6,
                retry_count = $7, next_retry_at = $8, job_id = $9, metadata = $10
            WHERE id = $1
            "#,
        )
        .bind(log.id)
        .bind(&log.payload)
        .bind(log.status.as_str())
        .bind(log.updated_at)
        .bind(log.sent_at)
        .bind(&log.error_log)
        .bind(log.retry_count as i32)
        .bind(log.next_retry_at)
        .bind(&log.job_id)
        .bind(JsonValue::Object(log.metadata.clone()))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(log)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM notification_logs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_all(
        &self,
        filter: &LogFilter,
        page: &PageRequest,
    ) -> Result<Vec<NotificationLog>> {
        let page = page.normalized();
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM notification_logs", COLUMNS));
        push_filters(&mut qb, filter);
        qb.push(format!(
            " ORDER BY {} {}, id {}",
            page.sort_by.column(),
            page.order.keyword(),
            page.order.keyword()
        ));
        qb.push(" LIMIT ")
            .push_bind(page.per_page as i64)
            .push(" OFFSET ")
            .push_bind(page.offset() as i64);
        let rows: Vec<NotificationLogRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        convert(rows)
    }

    async fn count(&self, filter: &LogFilter) -> Result<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM notification_logs");
        push_filters(&mut qb, filter);
        let count: (i64,) = qb.build_query_as().fetch_one(&self.pool).await?;
        Ok(count.0.max(0) as u64)
    }

    async fn find_failed_for_retry(&self, limit: usize) -> Result<Vec<NotificationLog>> {
        let rows: Vec<NotificationLogRow> = sqlx::query_as(&format!(
            r#"SELECT {} FROM notification_logs
               WHERE status = 'failed' AND (next_retry_at IS NULL OR next_retry_at <= $1)
               ORDER BY retry_count ASC, created_at ASC, id ASC
               LIMIT $2"#,
            COLUMNS
        ))
        .bind(self.clock.now())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn delete_old_logs(
        &self,
        older_than: DateTime<Utc>,
        statuses: Option<&[NotificationStatus]>,
        limit: Option<usize>,
    ) -> Result<u64> {
        let statuses = statuses
            .map(|s| s.to_vec())
            .unwrap_or_else(default_retention_statuses);
        let result = sqlx::query(
            r#"
            DELETE FROM notification_logs
            WHERE id IN (
                SELECT id FROM notification_logs
                WHERE created_at < $1 AND status = ANY($2)
                ORDER BY created_at ASC
                LIMIT $3
            )
            "#,
        )
        .bind(older_than)
        .bind(status_strings(&statuses))
        .bind(limit.map(|l| l as i64))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
