use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{default_retention_statuses, LogMutation, NotificationLogRepository};
use crate::error::{Error, Result};
use crate::models::notification_log::{LogFilter, NotificationLog, NotificationStatus, PageRequest};
use crate::utils::time::{Clock, SystemClock};

/// Reference store backed by a map behind one async lock.
///
/// Holding the write lock for the whole read-modify-write gives per-id
/// serialization for free.
pub struct InMemoryLogRepository {
    logs: RwLock<HashMap<Uuid, NotificationLog>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLogRepository {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.logs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.logs.read().await.is_empty()
    }
}

impl Default for InMemoryLogRepository {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl NotificationLogRepository for InMemoryLogRepository {
    async fn create(&self, log: NotificationLog) -> Result<NotificationLog> {
        let mut guard = self.logs.write().await;
        if guard.contains_key(&log.id) {
            return Err(Error::Internal(format!("Duplicate notification log id {}", log.id)));
        }
        guard.insert(log.id, log.clone());
        Ok(log)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<NotificationLog>> {
        Ok(self.logs.read().await.get(&id).cloned())
    }

    async fn find_by_job_id(&self, job_id: &str) -> Result<Vec<NotificationLog>> {
        let guard = self.logs.read().await;
        let mut logs: Vec<_> = guard
            .values()
            .filter(|l| l.job_id.as_deref() == Some(job_id))
            .cloned()
            .collect();
        logs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(logs)
    }

    async fn find_by_provider_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<NotificationLog>> {
        let guard = self.logs.read().await;
        Ok(guard
            .values()
            .filter(|l| l.metadata_str("provider_message_id") == Some(message_id))
            .max_by(|a, b| a.created_at.cmp(&b.created_at))
            .cloned())
    }

    async fn find_latest_by_recipient(&self, to: &str) -> Result<Option<NotificationLog>> {
        let guard = self.logs.read().await;
        Ok(guard
            .values()
            .filter(|l| l.to.eq_ignore_ascii_case(to))
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .cloned())
    }

    async fn modify(&self, id: Uuid, mutation: LogMutation) -> Result<NotificationLog> {
        let mut guard = self.logs.write().await;
        let stored = guard
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("Notification log {} not found", id)))?;
        let mut draft = stored.clone();
        mutation(&mut draft, self.clock.now())?;
        *stored = draft.clone();
        Ok(draft)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.logs.write().await.remove(&id).is_some())
    }

    async fn find_all(
        &self,
        filter: &LogFilter,
        page: &PageRequest,
    ) -> Result<Vec<NotificationLog>> {
        let page = page.normalized();
        let guard = self.logs.read().await;
        let mut logs: Vec<_> = guard.values().filter(|l| filter.matches(l)).cloned().collect();
        drop(guard);
        page.sort(&mut logs);
        Ok(logs
            .into_iter()
            .skip(page.offset())
            .take(page.per_page as usize)
            .collect())
    }

    async fn count(&self, filter: &LogFilter) -> Result<u64> {
        let guard = self.logs.read().await;
        Ok(guard.values().filter(|l| filter.matches(l)).count() as u64)
    }

    async fn find_failed_for_retry(&self, limit: usize) -> Result<Vec<NotificationLog>> {
        let now = self.clock.now();
        let guard = self.logs.read().await;
        let mut logs: Vec<_> = guard
            .values()
            .filter(|l| l.status == NotificationStatus::Failed)
            .filter(|l| l.next_retry_at.map_or(true, |at| at <= now))
            .cloned()
            .collect();
        drop(guard);
        logs.sort_by(|a, b| {
            a.retry_count
                .cmp(&b.retry_count)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        logs.truncate(limit);
        Ok(logs)
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
        let mut guard = self.logs.write().await;
        let mut doomed: Vec<_> = guard
            .values()
            .filter(|l| l.created_at < older_than && statuses.contains(&l.status))
            .map(|l| (l.created_at, l.id))
            .collect();
        doomed.sort();
        if let Some(limit) = limit {
            doomed.truncate(limit);
        }
        for (_, id) in &doomed {
            guard.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::notification::NotificationType;
    use crate::models::notification_log::LogPatch;
    use crate::utils::time::ManualClock;
    use serde_json::{json, Map};
    use std::time::Duration;

    fn repo() -> (Arc<ManualClock>, InMemoryLogRepository) {
        let clock = Arc::new(ManualClock::default());
        let repo = InMemoryLogRepository::new(clock.clone());
        (clock, repo)
    }

    fn log(n: u128, clock: &ManualClock) -> NotificationLog {
        NotificationLog::queued(
            Uuid::from_u128(n),
            format!("user{}@example.com", n),
            NotificationType::Welcome,
            json!({}),
            Map::new(),
            clock.now(),
        )
    }

    #[tokio::test]
    async fn failed_mutation_leaves_record_untouched() {
        let (clock, repo) = repo();
        let created = repo.create(log(1, &clock)).await.unwrap();
        repo.mark_as_sent(created.id).await.unwrap();

        let err = repo
            .update(
                created.id,
                LogPatch::new()
                    .merge("note", json!("x"))
                    .status(NotificationStatus::Canceled),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        let stored = repo.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Sent);
        assert!(!stored.metadata.contains_key("note"));
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let (clock, repo) = repo();
        repo.create(log(1, &clock)).await.unwrap();
        assert!(repo.create(log(1, &clock)).await.is_err());
    }

    #[tokio::test]
    async fn record_failed_attempt_uses_repository_clock() {
        let (clock, repo) = repo();
        let created = repo.create(log(1, &clock)).await.unwrap();
        let updated = repo
            .record_failed_attempt(created.id, "timeout".into(), 3, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            updated.next_retry_at,
            Some(clock.now() + chrono::Duration::seconds(60))
        );
    }

    #[tokio::test]
    async fn modify_unknown_id_is_not_found() {
        let (_, repo) = repo();
        let err = repo.mark_as_sent(Uuid::from_u128(99)).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
