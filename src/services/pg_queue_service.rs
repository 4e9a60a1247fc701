use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::models::delivery_job::{
    DeliveryJob, EnqueueOptions, JobId, JobRun, JobSnapshot, JobState, Priority, QueueMetrics,
};
use crate::models::notification_log::backoff_delay;
use crate::services::queue_service::{DeliveryQueue, JobProcessor, QueueSettings, WorkerQueue};
use crate::utils::ids::IdGenerator;
use crate::utils::time::{add_saturating, sub_saturating, Clock};

const COLUMNS: &str = "id, payload, priority, state, attempts_made, revived, created_at, run_at, \
     finished_at, failed_reason";

/// Idle workers re-check the table at least this often.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Durable queue on the `delivery_jobs` table.
///
/// Workers claim due rows with `FOR UPDATE SKIP LOCKED`, so any number of
/// processes can share one queue. Jobs survive restarts; rows a dead worker left
/// active are handed back by [`WorkerQueue::recover_stalled`].
pub struct PgDeliveryQueue {
    pool: PgPool,
    settings: QueueSettings,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    notify: Notify,
    closed: AtomicBool,
    healthy: AtomicBool,
}

#[derive(sqlx::FromRow)]
struct DeliveryJobRow {
    id: String,
    payload: JsonValue,
    priority: i16,
    state: String,
    attempts_made: i32,
    revived: bool,
    created_at: DateTime<Utc>,
    run_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    failed_reason: Option<String>,
}

impl DeliveryJobRow {
    fn attempts(&self) -> u32 {
        self.attempts_made.max(0) as u32
    }

    fn snapshot(self, now: DateTime<Utc>) -> Result<JobSnapshot> {
        let state = match self.state.as_str() {
            "waiting" if self.run_at > now => JobState::Delayed,
            "waiting" => JobState::Waiting,
            "active" => JobState::Active,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            other => return Err(Error::Internal(format!("unknown job state '{}'", other))),
        };
        Ok(JobSnapshot {
            state,
            priority: Priority::from_rank(self.priority.into()),
            attempts_made: self.attempts(),
            created_at: self.created_at,
            run_at: self.run_at,
            finished_at: self.finished_at,
            failed_reason: self.failed_reason,
            job: serde_json::from_value(self.payload)?,
            id: self.id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CountsRow {
    waiting: i64,
    delayed: i64,
    active: i64,
    completed: i64,
    failed: i64,
}

/// Errors that mean the database cannot be reached, as opposed to a bad query.
fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

impl PgDeliveryQueue {
    pub fn new(
        pool: PgPool,
        settings: QueueSettings,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            pool,
            settings,
            clock,
            ids,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Tracks database reachability; connection failures surface as `QueueUnavailable`.
    fn check<T>(&self, result: std::result::Result<T, sqlx::Error>) -> Result<T> {
        match result {
            Ok(value) => {
                if !self.healthy.swap(true, Ordering::SeqCst) {
                    info!(queue = %self.settings.name, "Delivery queue database reachable again");
                }
                Ok(value)
            }
            Err(err) if is_connection_error(&err) => {
                if self.healthy.swap(false, Ordering::SeqCst) {
                    error!(queue = %self.settings.name, error = %err, "Delivery queue database unreachable");
                }
                Err(Error::QueueUnavailable(format!(
                    "queue '{}': {}",
                    self.settings.name, err
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn claim_next(&self) -> Result<Option<DeliveryJobRow>> {
        let now = self.clock.now();
        let row = sqlx::query_as(&format!(
            r#"
            UPDATE delivery_jobs
            SET state = 'active', attempts_made = attempts_made + 1, started_at = $2
            WHERE id = (
                SELECT id FROM delivery_jobs
                WHERE queue = $1 AND state = 'waiting' AND run_at <= $2
                ORDER BY priority ASC, run_at ASC, seq ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(&self.settings.name)
        .bind(now)
        .fetch_optional(&self.pool)
        .await;
        self.check(row)
    }

    async fn finish(&self, id: &str, state: &str, reason: Option<&str>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET state = $2, finished_at = $3, failed_reason = $4
            WHERE id = $1 AND state = 'active'
            "#,
        )
        .bind(id)
        .bind(state)
        .bind(self.clock.now())
        .bind(reason)
        .execute(&self.pool)
        .await;
        self.check(result).map(|_| ())
    }

    async fn reschedule(&self, id: &str, run_at: DateTime<Utc>, reason: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET state = 'waiting', run_at = $2, started_at = NULL, failed_reason = $3
            WHERE id = $1 AND state = 'active'
            "#,
        )
        .bind(id)
        .bind(run_at)
        .bind(reason)
        .execute(&self.pool)
        .await;
        self.check(result).map(|_| ())
    }

    async fn sweep(&self, state: &str, older_than: Duration, limit: i64) -> Result<usize> {
        let cutoff = sub_saturating(self.clock.now(), older_than);
        let result = sqlx::query(
            r#"
            DELETE FROM delivery_jobs
            WHERE id IN (
                SELECT id FROM delivery_jobs
                WHERE queue = $1 AND state = $2 AND finished_at < $3
                ORDER BY finished_at ASC
                LIMIT $4
            )
            "#,
        )
        .bind(&self.settings.name)
        .bind(state)
        .bind(cutoff)
        .bind(limit)
        .execute(&self.pool)
        .await;
        Ok(self.check(result)?.rows_affected() as usize)
    }
}

#[async_trait]
impl WorkerQueue for PgDeliveryQueue {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn concurrency(&self) -> usize {
        self.settings.concurrency
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn run_once(&self, processor: &dyn JobProcessor) -> Result<bool> {
        if self.is_closed() {
            return Ok(false);
        }
        let Some(row) = self.claim_next().await? else {
            return Ok(false);
        };
        let run = JobRun::new(row.id.clone(), row.attempts()).revived(row.revived);
        let job: DeliveryJob = match serde_json::from_value(row.payload) {
            Ok(job) => job,
            Err(e) => {
                error!(job_id = %run.id, error = %e, "Unreadable delivery job payload");
                self.finish(&run.id, "failed", Some(&format!("unreadable payload: {}", e)))
                    .await?;
                return Ok(true);
            }
        };

        debug!(job_id = %run.id, attempt = run.attempt, log_id = %job.log_id, "Processing delivery job");
        match processor.process(&run, &job).await {
            Ok(()) => self.finish(&run.id, "completed", None).await?,
            Err(e) if run.attempt < self.settings.max_attempts => {
                let delay = backoff_delay(self.settings.backoff_base, run.attempt);
                warn!(
                    job_id = %run.id,
                    attempt = run.attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e.message(),
                    "Delivery attempt failed, retrying"
                );
                self.reschedule(&run.id, add_saturating(self.clock.now(), delay), e.message())
                    .await?;
            }
            Err(e) => {
                self.finish(&run.id, "failed", Some(e.message())).await?;
                error!(job_id = %run.id, log_id = %job.log_id, error = %e.message(), "Delivery job exhausted its attempts");
                processor.on_exhausted(&run, &job, &e).await;
            }
        }
        Ok(true)
    }

    async fn wait_for_work(&self) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }

    async fn prune(&self) -> Result<usize> {
        let completed = self
            .sweep("completed", self.settings.completed_retention, i64::MAX)
            .await?;
        let failed = self
            .sweep("failed", self.settings.failed_retention, i64::MAX)
            .await?;
        Ok(completed + failed)
    }

    async fn recover_stalled(&self) -> Result<usize> {
        let now = self.clock.now();
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET state = 'waiting', run_at = $2, started_at = NULL
            WHERE queue = $1 AND state = 'active' AND started_at < $3
            "#,
        )
        .bind(&self.settings.name)
        .bind(now)
        .bind(sub_saturating(now, self.settings.stall_timeout))
        .execute(&self.pool)
        .await;
        let recovered = self.check(result)?.rows_affected() as usize;
        if recovered > 0 {
            warn!(queue = %self.settings.name, recovered, "Stalled delivery jobs handed back to waiting");
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }
}

#[async_trait]
impl DeliveryQueue for PgDeliveryQueue {
    async fn enqueue(&self, job: DeliveryJob, options: EnqueueOptions) -> Result<JobId> {
        if self.is_closed() {
            return Err(Error::QueueUnavailable(format!(
                "queue '{}' is closed",
                self.settings.name
            )));
        }
        let now = self.clock.now();
        let id = options
            .job_id
            .clone()
            .unwrap_or_else(|| self.ids.next_id().to_string());
        let run_at = options.scheduled_time.filter(|at| *at > now);
        let log_id = job.log_id;
        let payload = serde_json::to_value(&job)?;

        let result = sqlx::query(
            r#"
            INSERT INTO delivery_jobs (id, queue, log_id, payload, priority, state, created_at, run_at)
            VALUES ($1, $2, $3, $4, $5, 'waiting', $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(&self.settings.name)
        .bind(log_id)
        .bind(payload)
        .bind(i16::from(options.priority.rank()))
        .bind(now)
        .bind(run_at.unwrap_or(now))
        .execute(&self.pool)
        .await;
        if self.check(result)?.rows_affected() == 0 {
            return Err(Error::Internal(format!("job '{}' already exists", id)));
        }

        self.notify.notify_one();
        debug!(job_id = %id, priority = %options.priority, delayed = run_at.is_some(), "Job enqueued");
        Ok(id)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobSnapshot>> {
        let row: std::result::Result<Option<DeliveryJobRow>, _> = sqlx::query_as(&format!(
            "SELECT {} FROM delivery_jobs WHERE id = $1 AND queue = $2",
            COLUMNS
        ))
        .bind(job_id)
        .bind(&self.settings.name)
        .fetch_optional(&self.pool)
        .await;
        let now = self.clock.now();
        self.check(row)?.map(|r| r.snapshot(now)).transpose()
    }

    async fn remove(&self, job_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM delivery_jobs WHERE id = $1 AND queue = $2 AND state <> 'active'",
        )
        .bind(job_id)
        .bind(&self.settings.name)
        .execute(&self.pool)
        .await;
        Ok(self.check(result)?.rows_affected() > 0)
    }

    fn is_available(&self) -> bool {
        !self.is_closed() && self.healthy.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(queue = %self.settings.name, "Delivery queue closed");
        }
        self.notify.notify_waiters();
    }

    async fn metrics(&self) -> Result<QueueMetrics> {
        let counts: std::result::Result<CountsRow, _> = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'waiting' AND run_at <= $2) AS waiting,
                COUNT(*) FILTER (WHERE state = 'waiting' AND run_at > $2) AS delayed,
                COUNT(*) FILTER (WHERE state = 'active') AS active,
                COUNT(*) FILTER (WHERE state = 'completed') AS completed,
                COUNT(*) FILTER (WHERE state = 'failed') AS failed
            FROM delivery_jobs
            WHERE queue = $1
            "#,
        )
        .bind(&self.settings.name)
        .bind(self.clock.now())
        .fetch_one(&self.pool)
        .await;
        let c = self.check(counts)?;
        Ok(QueueMetrics {
            queue: self.settings.name.clone(),
            waiting: c.waiting.max(0) as usize,
            delayed: c.delayed.max(0) as usize,
            active: c.active.max(0) as usize,
            completed: c.completed.max(0) as usize,
            failed: c.failed.max(0) as usize,
            degraded: 0,
        })
    }

    async fn retry_failed(&self) -> Result<usize> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET state = 'waiting', attempts_made = 0, revived = TRUE, run_at = $2,
                started_at = NULL, finished_at = NULL, failed_reason = NULL
            WHERE queue = $1 AND state = 'failed'
            "#,
        )
        .bind(&self.settings.name)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await;
        let revived = self.check(result)?.rows_affected() as usize;
        if revived > 0 {
            self.notify.notify_waiters();
        }
        Ok(revived)
    }

    async fn clean_completed(&self, older_than: Duration, limit: usize) -> Result<usize> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.sweep("completed", older_than, limit).await
    }
}
