use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::repository::{default_retention_statuses, NotificationLogRepository};
use crate::services::queue_service::WorkerQueue;
use crate::utils::time::{sub_saturating, Clock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub logs_deleted: u64,
    pub jobs_pruned: usize,
    pub jobs_recovered: usize,
}

/// Periodic housekeeping: log retention, queue job pruning and stalled job recovery.
#[derive(Clone)]
pub struct MaintenanceService {
    repo: Arc<dyn NotificationLogRepository>,
    queue: Option<Arc<dyn WorkerQueue>>,
    clock: Arc<dyn Clock>,
    retention_days: u32,
}

impl MaintenanceService {
    pub fn new(
        repo: Arc<dyn NotificationLogRepository>,
        queue: Option<Arc<dyn WorkerQueue>>,
        clock: Arc<dyn Clock>,
        retention_days: u32,
    ) -> Self {
        Self {
            repo,
            queue,
            clock,
            retention_days,
        }
    }

    /// FAILED logs survive retention; they are kept for audit.
    pub async fn run_once(&self) -> Result<MaintenanceReport> {
        let cutoff = sub_saturating(
            self.clock.now(),
            Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60),
        );
        let statuses = default_retention_statuses();
        let logs_deleted = self
            .repo
            .delete_old_logs(cutoff, Some(&statuses), None)
            .await?;
        let (jobs_pruned, jobs_recovered) = match &self.queue {
            Some(queue) => {
                // a queue outage should not stop log retention
                let recovered = queue.recover_stalled().await.unwrap_or_else(|e| {
                    warn!(error = ?e, "Stalled job recovery failed");
                    0
                });
                (queue.prune().await?, recovered)
            }
            None => (0, 0),
        };
        info!(
            logs_deleted,
            jobs_pruned,
            jobs_recovered,
            cutoff = %cutoff,
            "Maintenance run finished"
        );
        Ok(MaintenanceReport {
            logs_deleted,
            jobs_pruned,
            jobs_recovered,
        })
    }
}
