use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::models::delivery_job::{DeliveryJob, JobRun};
use crate::models::notification_log::{LogPatch, NotificationStatus};
use crate::repository::NotificationLogRepository;
use crate::services::queue_service::JobProcessor;
use crate::services::retry_service::RetryEngine;
use crate::transport::{DeliveryReceipt, MailTransport, SendError};
use crate::utils::time::{to_rfc3339, Clock};

/// Queue worker: moves a log through SENDING and hands the message to the transport.
pub struct DeliveryProcessor {
    repo: Arc<dyn NotificationLogRepository>,
    transport: Arc<dyn MailTransport>,
    retry: RetryEngine,
    clock: Arc<dyn Clock>,
}

impl DeliveryProcessor {
    pub fn new(
        repo: Arc<dyn NotificationLogRepository>,
        transport: Arc<dyn MailTransport>,
        retry: RetryEngine,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            transport,
            retry,
            clock,
        }
    }

    /// Claims the log for sending. `Ok(false)` means the job should complete without sending.
    ///
    /// A job only ever sends the log that names it as its current job. Settled logs
    /// (FAILED, ERROR) are reopened only by a job an operator revived with `retry_failed`.
    async fn claim(&self, run: &JobRun, job: &DeliveryJob) -> Result<bool> {
        let owner = run.id.clone();
        let revived = run.revived;
        let claimed = self
            .repo
            .modify(
                job.log_id,
                Box::new(move |log, now| {
                    let owned = log.job_id.as_deref() == Some(owner.as_str());
                    let reopen = revived && log.status.is_retriable_by_operator();
                    if !owned || !(log.status.is_pending() || reopen) {
                        return Err(Error::InvalidStateTransition {
                            from: log.status,
                            to: NotificationStatus::Sending,
                        });
                    }
                    if reopen {
                        log.transition(NotificationStatus::Retrying, now)?;
                    }
                    if log.status != NotificationStatus::Sending {
                        log.transition(NotificationStatus::Sending, now)?;
                    }
                    Ok(())
                }),
            )
            .await;
        match claimed {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => {
                warn!(log_id = %job.log_id, job_id = %run.id, "Log for delivery job no longer exists");
                Ok(false)
            }
            Err(Error::InvalidStateTransition { from, .. }) => {
                debug!(log_id = %job.log_id, job_id = %run.id, status = %from, "Skipping log not claimable by this job");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Last look before the externally visible send.
    async fn still_wanted(&self, run: &JobRun, job: &DeliveryJob) -> Result<bool> {
        let current = self.repo.find_by_id(job.log_id).await?;
        Ok(current.map_or(false, |l| {
            l.status == NotificationStatus::Sending && l.job_id.as_deref() == Some(run.id.as_str())
        }))
    }

    async fn record_sent(&self, job: &DeliveryJob, receipt: &DeliveryReceipt) {
        let mut patch = LogPatch::new()
            .status(NotificationStatus::Sent)
            .merge("provider", json!(receipt.provider));
        if let Some(message_id) = &receipt.message_id {
            patch = patch.merge("provider_message_id", json!(message_id));
        }
        match self.repo.update(job.log_id, patch).await {
            Ok(_) => info!(log_id = %job.log_id, provider = %receipt.provider, "Notification sent"),
            // the message is out; a retry would only duplicate it
            Err(e) => error!(log_id = %job.log_id, error = ?e, "Sent notification could not be marked as sent"),
        }
    }

    async fn record_transport_error(&self, run: &JobRun, job: &DeliveryJob, err: &SendError) {
        let entry = json!({
            "at": to_rfc3339(self.clock.now()),
            "job_id": run.id,
            "attempt": run.attempt,
            "error": err.message(),
            "permanent": err.is_permanent(),
        });
        if let Err(e) = self
            .repo
            .update(job.log_id, LogPatch::new().append("transport_errors", entry))
            .await
        {
            warn!(log_id = %job.log_id, error = ?e, "Could not record transport error");
        }
    }
}

#[async_trait]
impl JobProcessor for DeliveryProcessor {
    async fn process(&self, run: &JobRun, job: &DeliveryJob) -> std::result::Result<(), SendError> {
        let storage_failure = |e: Error| SendError::Transient(format!("log store: {}", e));

        if !self.claim(run, job).await.map_err(storage_failure)? {
            return Ok(());
        }
        if !self.still_wanted(run, job).await.map_err(storage_failure)? {
            info!(log_id = %job.log_id, job_id = %run.id, "Log canceled before send; aborting");
            return Ok(());
        }

        match self.transport.send(&job.message).await {
            Ok(receipt) => {
                self.record_sent(job, &receipt).await;
                Ok(())
            }
            Err(err) => {
                warn!(
                    log_id = %job.log_id,
                    job_id = %run.id,
                    attempt = run.attempt,
                    transport = self.transport.name(),
                    error = %err.message(),
                    "Transport rejected message"
                );
                self.record_transport_error(run, job, &err).await;
                Err(err)
            }
        }
    }

    async fn on_exhausted(&self, run: &JobRun, job: &DeliveryJob, error: &SendError) {
        match self.retry.handle_failure(job.log_id, &run.id, error).await {
            Ok(outcome) => debug!(log_id = %job.log_id, job_id = %run.id, ?outcome, "Failure handled"),
            Err(e) => error!(log_id = %job.log_id, job_id = %run.id, error = ?e, "Failure handling failed"),
        }
    }
}
