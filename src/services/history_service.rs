use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::notification::NotificationType;
use crate::models::notification_log::{LogFilter, NotificationLog, NotificationStatus, PageRequest};
use crate::repository::NotificationLogRepository;
use crate::services::notification_service::round2;
use crate::utils::time::{sub_saturating, Clock};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogPage {
    pub logs: Vec<NotificationLog>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupCommand {
    pub older_than_days: u32,
    /// When set, only these statuses are eligible (minus `exclude`).
    pub include: Option<Vec<NotificationStatus>>,
    /// Defaults to `[FAILED]`.
    pub exclude: Option<Vec<NotificationStatus>>,
    pub limit: Option<usize>,
}

impl CleanupCommand {
    pub fn eligible_statuses(&self) -> Vec<NotificationStatus> {
        let exclude = self
            .exclude
            .clone()
            .unwrap_or_else(|| vec![NotificationStatus::Failed]);
        let base = self
            .include
            .clone()
            .unwrap_or_else(|| NotificationStatus::ALL.to_vec());
        let mut eligible: Vec<_> = base.into_iter().filter(|s| !exclude.contains(s)).collect();
        eligible.sort();
        eligible.dedup();
        eligible
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupOutcome {
    pub deleted_count: u64,
    pub cutoff: DateTime<Utc>,
    pub statuses: Vec<NotificationStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryStats {
    pub since: DateTime<Utc>,
    pub total: u64,
    pub sent: u64,
    /// FAILED + ERROR.
    pub failed: u64,
    /// QUEUED + SENDING + RETRYING.
    pub pending: u64,
    pub canceled: u64,
    /// `sent / total * 100`, two decimals.
    pub delivery_rate: f64,
    pub by_status: BTreeMap<String, u64>,
    pub by_type: BTreeMap<String, u64>,
}

/// Read side of the log store plus operator housekeeping.
#[derive(Clone)]
pub struct HistoryService {
    repo: Arc<dyn NotificationLogRepository>,
    clock: Arc<dyn Clock>,
}

impl HistoryService {
    pub fn new(repo: Arc<dyn NotificationLogRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    pub async fn query_logs(&self, filter: &LogFilter, page: PageRequest) -> Result<LogPage> {
        let page = page.normalized();
        let logs = self.repo.find_all(filter, &page).await?;
        let total = self.repo.count(filter).await?;
        Ok(LogPage {
            logs,
            total,
            page: page.page,
            per_page: page.per_page,
        })
    }

    pub async fn get_log(&self, id: Uuid) -> Result<NotificationLog> {
        self.repo
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Notification log {} not found", id)))
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        if !self.repo.delete(id).await? {
            return Err(Error::NotFound(format!("Notification log {} not found", id)));
        }
        info!(log_id = %id, "Notification log deleted");
        Ok(())
    }

    pub async fn cleanup(&self, cmd: CleanupCommand) -> Result<CleanupOutcome> {
        let statuses = cmd.eligible_statuses();
        let cutoff = sub_saturating(self.clock.now(), DAY * cmd.older_than_days);
        let deleted_count = if statuses.is_empty() {
            0
        } else {
            self.repo
                .delete_old_logs(cutoff, Some(&statuses), cmd.limit)
                .await?
        };
        info!(deleted = deleted_count, cutoff = %cutoff, "Notification log cleanup finished");
        Ok(CleanupOutcome {
            deleted_count,
            cutoff,
            statuses,
        })
    }

    pub async fn stats(&self, since_days: u32) -> Result<DeliveryStats> {
        let since = sub_saturating(self.clock.now(), DAY * since_days);
        let window = LogFilter {
            created_after: Some(since),
            ..LogFilter::default()
        };

        let mut by_status = BTreeMap::new();
        for status in NotificationStatus::ALL {
            let filter = LogFilter {
                statuses: vec![status],
                ..window.clone()
            };
            by_status.insert(status.as_str().to_string(), self.repo.count(&filter).await?);
        }
        let mut by_type = BTreeMap::new();
        for ty in NotificationType::ALL {
            let filter = LogFilter {
                notification_type: Some(ty),
                ..window.clone()
            };
            let n = self.repo.count(&filter).await?;
            if n > 0 {
                by_type.insert(ty.as_str().to_string(), n);
            }
        }

        let get = |s: NotificationStatus| by_status.get(s.as_str()).copied().unwrap_or(0);
        let total: u64 = by_status.values().sum();
        let sent = get(NotificationStatus::Sent);
        let failed = get(NotificationStatus::Failed) + get(NotificationStatus::Error);
        let pending = get(NotificationStatus::Queued)
            + get(NotificationStatus::Sending)
            + get(NotificationStatus::Retrying);
        let canceled = get(NotificationStatus::Canceled);
        let delivery_rate = if total == 0 {
            0.0
        } else {
            round2(sent as f64 * 100.0 / total as f64)
        };

        Ok(DeliveryStats {
            since,
            total,
            sent,
            failed,
            pending,
            canceled,
            delivery_rate,
            by_status,
            by_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryLogRepository;
    use crate::utils::time::ManualClock;
    use serde_json::{json, Map};

    async fn seeded() -> (Arc<ManualClock>, Arc<InMemoryLogRepository>, HistoryService) {
        let clock = Arc::new(ManualClock::default());
        let repo = Arc::new(InMemoryLogRepository::new(clock.clone()));
        let statuses = [
            NotificationStatus::Sent,
            NotificationStatus::Sent,
            NotificationStatus::Sent,
            NotificationStatus::Failed,
            NotificationStatus::Error,
            NotificationStatus::Queued,
        ];
        for (i, status) in statuses.into_iter().enumerate() {
            let mut log = NotificationLog::queued(
                Uuid::from_u128(i as u128 + 1),
                format!("u{}@example.com", i),
                NotificationType::Welcome,
                json!({}),
                Map::new(),
                clock.now(),
            );
            log.status = status;
            if status == NotificationStatus::Sent {
                log.sent_at = Some(clock.now());
            }
            repo.create(log).await.unwrap();
        }
        let service = HistoryService::new(repo.clone(), clock.clone());
        (clock, repo, service)
    }

    #[test]
    fn cleanup_statuses_default_to_everything_but_failed() {
        let cmd = CleanupCommand::default();
        let statuses = cmd.eligible_statuses();
        assert!(!statuses.contains(&NotificationStatus::Failed));
        assert_eq!(statuses.len(), 6);

        let cmd = CleanupCommand {
            include: Some(vec![NotificationStatus::Sent, NotificationStatus::Failed]),
            ..CleanupCommand::default()
        };
        assert_eq!(cmd.eligible_statuses(), vec![NotificationStatus::Sent]);
    }

    #[tokio::test]
    async fn stats_aggregate_statuses() {
        let (_, _, service) = seeded().await;
        let stats = service.stats(7).await.unwrap();
        assert_eq!(stats.total, 6);
        assert_eq!(stats.sent, 3);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.delivery_rate, 50.0);
        assert_eq!(stats.by_type.get("WELCOME"), Some(&6));
    }

    #[tokio::test]
    async fn cleanup_never_touches_failed_logs() {
        let (clock, repo, service) = seeded().await;
        clock.advance(chrono::Duration::days(90));

        let outcome = service
            .cleanup(CleanupCommand {
                older_than_days: 30,
                ..CleanupCommand::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome.deleted_count, 5);
        let left = repo
            .find_all(&LogFilter::default(), &PageRequest::default())
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].status, NotificationStatus::Failed);
    }

    #[tokio::test]
    async fn delete_unknown_log_is_not_found() {
        let (_, _, service) = seeded().await;
        assert!(service.delete(Uuid::from_u128(999)).await.unwrap_err().is_not_found());
        service.delete(Uuid::from_u128(1)).await.unwrap();
        assert!(service.get_log(Uuid::from_u128(1)).await.unwrap_err().is_not_found());
    }
}
