//! Notification log persistence.
//!
//! Every write goes through [`NotificationLogRepository::modify`], which applies a
//! mutation to the current stored record while holding that record exclusively.
//! The higher-level helpers (`update`, `update_status`, `mark_as_sent`,
//! `record_failed_attempt`) are expressed on top of it, so the state machine rules
//! in [`NotificationLog`] are enforced identically by every backend.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::notification_log::{
    LogFilter, LogPatch, NotificationLog, NotificationStatus, PageRequest,
};

pub use memory::InMemoryLogRepository;
pub use postgres::PgLogRepository;

/// Read-modify-write step run under the record's lock. Receives the write timestamp.
pub type LogMutation = Box<dyn FnOnce(&mut NotificationLog, DateTime<Utc>) -> Result<()> + Send>;

#[async_trait]
pub trait NotificationLogRepository: Send + Sync {
    async fn create(&self, log: NotificationLog) -> Result<NotificationLog>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<NotificationLog>>;

    async fn find_by_job_id(&self, job_id: &str) -> Result<Vec<NotificationLog>>;

    /// Most recent log whose metadata carries this provider message id.
    async fn find_by_provider_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<NotificationLog>>;

    /// Most recent log for a recipient (case-insensitive).
    async fn find_latest_by_recipient(&self, to: &str) -> Result<Option<NotificationLog>>;

    /// Applies `mutation` atomically. Concurrent calls for the same id are serialized
    /// and a failing mutation leaves the stored record untouched.
    async fn modify(&self, id: Uuid, mutation: LogMutation) -> Result<NotificationLog>;

    /// Irreversible.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Filter, then sort, then paginate.
    async fn find_all(&self, filter: &LogFilter, page: &PageRequest)
        -> Result<Vec<NotificationLog>>;

    async fn count(&self, filter: &LogFilter) -> Result<u64>;

    /// FAILED logs whose `next_retry_at` is unset or already past, least-retried
    /// first, then oldest first.
    async fn find_failed_for_retry(&self, limit: usize) -> Result<Vec<NotificationLog>>;

    /// Retention sweep over logs created before `older_than`. `statuses` defaults to
    /// everything except FAILED.
    async fn delete_old_logs(
        &self,
        older_than: DateTime<Utc>,
        statuses: Option<&[NotificationStatus]>,
        limit: Option<usize>,
    ) -> Result<u64>;

    async fn update(&self, id: Uuid, patch: LogPatch) -> Result<NotificationLog> {
        self.modify(id, Box::new(move |log, now| log.apply_patch(patch, now)))
            .await
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: NotificationStatus,
        error: Option<String>,
    ) -> Result<NotificationLog> {
        self.modify(
            id,
            Box::new(move |log, now| {
                if log.status != status {
                    log.transition(status, now)?;
                }
                if let Some(error) = error {
                    log.push_error(error);
                }
                log.updated_at = now;
                Ok(())
            }),
        )
        .await
    }

    /// Idempotent: an already SENT log is returned unchanged.
    async fn mark_as_sent(&self, id: Uuid) -> Result<NotificationLog> {
        self.modify(
            id,
            Box::new(move |log, now| {
                if log.status == NotificationStatus::Sent {
                    return Ok(());
                }
                log.transition(NotificationStatus::Sent, now)
            }),
        )
        .await
    }

    async fn record_failed_attempt(
        &self,
        id: Uuid,
        error: String,
        max_retries: u32,
        base_delay: Duration,
    ) -> Result<NotificationLog> {
        self.modify(
            id,
            Box::new(move |log, now| log.record_failure(error, max_retries, base_delay, now)),
        )
        .await
    }
}

/// Statuses a retention sweep may delete when the caller names none.
pub fn default_retention_statuses() -> Vec<NotificationStatus> {
    NotificationStatus::ALL
        .into_iter()
        .filter(|s| *s != NotificationStatus::Failed)
        .collect()
}
