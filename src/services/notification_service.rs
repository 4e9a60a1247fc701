use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppEnv;
use crate::error::{Error, Result};
use crate::models::delivery_job::{
    DeliveryJob, EnqueueOptions, Envelope, JobId, JobState, OutboundMessage, Priority,
    StoredPayload,
};
use crate::models::notification::{Channel, NotificationKind, NotificationType};
use crate::models::notification_log::{
    LogFilter, LogPatch, NotificationLog, NotificationStatus, PageRequest, SortField, SortOrder,
};
use crate::repository::NotificationLogRepository;
use crate::services::queue_service::{is_degraded_job_id, DeliveryQueue};
use crate::services::retry_service::RetryEngine;
use crate::services::template_service::TemplateRenderer;
use crate::utils::ids::IdGenerator;
use crate::utils::time::{to_rfc3339, Clock};
use crate::utils::validation::FieldError;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub environment: AppEnv,
    /// Budget for rendering + log creation + enqueue, per recipient.
    pub dispatch_timeout: Duration,
    pub default_from: String,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            environment: AppEnv::Development,
            dispatch_timeout: Duration::from_secs(10),
            default_from: "no-reply@localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DispatchCommand {
    /// Raw type tag as received; checked against the closed set.
    pub notification_type: String,
    pub recipients: Vec<String>,
    pub data: JsonValue,
    pub envelope: Envelope,
    pub priority: Priority,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub source: String,
    pub requested_by: Option<String>,
    pub metadata: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchOutcome {
    pub success: bool,
    /// Completion order, not recipient order.
    pub job_ids: Vec<JobId>,
    pub log_ids: Vec<Uuid>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: String,
    pub progress: f64,
    pub queue_state: Option<JobState>,
    pub logs: Vec<NotificationLog>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryOutcome {
    pub log_id: Uuid,
    pub job_id: JobId,
}

#[derive(Debug, Clone, Default)]
pub struct RetryBulkCommand {
    pub ids: Vec<Uuid>,
    /// Restricted to FAILED/ERROR whatever statuses it names.
    pub filter: Option<LogFilter>,
    pub limit: usize,
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryBulkOutcome {
    pub retried_count: usize,
    pub job_ids: Vec<JobId>,
    pub errors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelOutcome {
    pub canceled: bool,
    pub job_removed: bool,
}

/// Derived job status, first match wins: all SENT, any RETRYING, any SENDING,
/// any QUEUED, any FAILED/ERROR, all CANCELED.
pub fn overall_status(logs: &[NotificationLog]) -> Option<&'static str> {
    use NotificationStatus as S;
    if logs.is_empty() {
        return None;
    }
    let any = |s: S| logs.iter().any(|l| l.status == s);
    let status = if logs.iter().all(|l| l.status == S::Sent) {
        "completed"
    } else if any(S::Retrying) {
        "retrying"
    } else if any(S::Sending) {
        "active"
    } else if any(S::Queued) {
        "waiting"
    } else if any(S::Failed) || any(S::Error) {
        "failed"
    } else if logs.iter().all(|l| l.status == S::Canceled) {
        "canceled"
    } else {
        "completed"
    };
    Some(status)
}

#[derive(Clone)]
pub struct NotificationService {
    repo: Arc<dyn NotificationLogRepository>,
    queue: Arc<dyn DeliveryQueue>,
    renderer: Arc<TemplateRenderer>,
    retry: RetryEngine,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    settings: DispatchSettings,
}

impl NotificationService {
    pub fn new(
        repo: Arc<dyn NotificationLogRepository>,
        queue: Arc<dyn DeliveryQueue>,
        renderer: Arc<TemplateRenderer>,
        retry: RetryEngine,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            repo,
            queue,
            renderer,
            retry,
            clock,
            ids,
            settings,
        }
    }

    /// Validates the request as a whole, then creates one QUEUED log and one queue
    /// job per recipient. Per-recipient failures are collected, not propagated.
    pub async fn dispatch(&self, cmd: DispatchCommand) -> Result<DispatchOutcome> {
        let ty: NotificationType = cmd.notification_type.parse()?;
        let kind = NotificationKind::parse(ty, cmd.data.clone())?;
        validate_addressing(&cmd.recipients, &cmd.envelope)?;

        if !self.renderer.has_template(ty) {
            return Err(Error::TemplateNotFound(ty));
        }
        if self.settings.environment.is_production() && !self.queue.is_available() {
            return Err(Error::QueueUnavailable(
                "delivery queue is not accepting jobs".to_string(),
            ));
        }

        let variables = Arc::new(kind.template_variables());
        let cmd = Arc::new(cmd);
        let timeout = self.settings.dispatch_timeout;
        let mut tasks = JoinSet::new();

        for recipient in cmd.recipients.iter().cloned() {
            let log_id = self.ids.next_id();
            let service = self.clone();
            let cmd = cmd.clone();
            let variables = variables.clone();
            tasks.spawn(async move {
                let work = service.dispatch_one(log_id, &recipient, ty, &cmd, &variables);
                let result = match tokio::time::timeout(timeout, work).await {
                    Ok(result) => result,
                    Err(_) => {
                        let err = Error::Timeout(format!(
                            "dispatch exceeded {} ms",
                            timeout.as_millis()
                        ));
                        service.mark_dispatch_error(log_id, &err).await;
                        Err(err)
                    }
                };
                (recipient, result)
            });
        }

        let mut outcome = DispatchOutcome::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok((job_id, log_id)))) => {
                    outcome.job_ids.push(job_id);
                    outcome.log_ids.push(log_id);
                }
                Ok((recipient, Err(e))) => {
                    warn!(recipient = %recipient, error = %e, "Dispatch failed for recipient");
                    outcome.errors.push(format!("{}: {}", recipient, e));
                }
                Err(e) => {
                    error!(error = ?e, "Dispatch task aborted");
                    outcome.errors.push(format!("dispatch task failed: {}", e));
                }
            }
        }
        outcome.success = outcome.errors.is_empty();
        info!(
            notification_type = %ty,
            queued = outcome.log_ids.len(),
            failed = outcome.errors.len(),
            "Dispatch finished"
        );
        Ok(outcome)
    }

    async fn dispatch_one(
        &self,
        log_id: Uuid,
        recipient: &str,
        ty: NotificationType,
        cmd: &DispatchCommand,
        variables: &Map<String, JsonValue>,
    ) -> Result<(JobId, Uuid)> {
        let mut vars = variables.clone();
        vars.entry("recipient")
            .or_insert_with(|| JsonValue::String(recipient.to_string()));
        let content = self.renderer.render(ty, &vars)?;

        let payload = StoredPayload::new(content.clone(), cmd.data.clone(), cmd.envelope.clone());
        let mut metadata = cmd.metadata.clone();
        metadata.insert("source".into(), json!(cmd.source));
        metadata.insert("priority".into(), json!(cmd.priority));
        metadata.insert("channel".into(), json!(cmd.envelope.channel));
        if let Some(user) = &cmd.requested_by {
            metadata.insert("requested_by".into(), json!(user));
        }
        if let Some(at) = cmd.scheduled_time {
            metadata.insert("scheduled_time".into(), json!(to_rfc3339(at)));
        }

        let assigned = self.retry.next_job_id();
        let mut log = NotificationLog::queued(
            log_id,
            recipient,
            ty,
            payload.to_value(),
            metadata.clone(),
            self.clock.now(),
        );
        log.job_id = Some(assigned.clone());
        self.repo.create(log).await?;

        let job = DeliveryJob {
            log_id,
            notification_type: ty,
            message: OutboundMessage::new(&cmd.envelope, recipient, &self.settings.default_from, content),
            metadata,
        };
        let options = EnqueueOptions::new(cmd.priority)
            .scheduled(cmd.scheduled_time)
            .job_id(assigned.clone());
        let job_id = match self.queue.enqueue(job, options).await {
            Ok(id) => id,
            Err(e) => {
                self.mark_dispatch_error(log_id, &e).await;
                return Err(e);
            }
        };

        if job_id != assigned {
            let mut patch = LogPatch::new().job_id(job_id.clone());
            if is_degraded_job_id(&job_id) {
                patch = patch.merge("degraded", json!(true));
            }
            self.repo.update(log_id, patch).await?;
        }
        Ok((job_id, log_id))
    }

    /// Marks a log whose dispatch did not complete as ERROR and withdraws its job.
    /// A log a worker has already picked up is left to the worker.
    async fn mark_dispatch_error(&self, log_id: Uuid, err: &Error) {
        let message = err.to_string();
        let result = self
            .repo
            .modify(
                log_id,
                Box::new(move |log, now| {
                    if !matches!(
                        log.status,
                        NotificationStatus::Queued | NotificationStatus::Retrying
                    ) {
                        return Err(Error::InvalidStateTransition {
                            from: log.status,
                            to: NotificationStatus::Error,
                        });
                    }
                    log.transition(NotificationStatus::Error, now)?;
                    log.push_error(message);
                    Ok(())
                }),
            )
            .await;
        match result {
            Ok(log) => {
                if let Some(job_id) = &log.job_id {
                    if let Err(e) = self.queue.remove(job_id).await {
                        warn!(log_id = %log_id, job_id = %job_id, error = ?e, "Could not withdraw job");
                    }
                }
            }
            // the log was never written
            Err(Error::NotFound(_)) => {}
            Err(Error::InvalidStateTransition { from, .. }) => {
                debug!(log_id = %log_id, status = %from, "Dispatch error not recorded; log already moved on");
            }
            Err(e) => warn!(log_id = %log_id, error = ?e, "Could not mark log as errored"),
        }
    }

    pub async fn get_status(&self, job_id: &str) -> Result<JobStatusView> {
        let logs = self.repo.find_by_job_id(job_id).await?;
        let queue_state = self.queue.get_job(job_id).await?.map(|j| j.state);

        let status = match (overall_status(&logs), queue_state) {
            (Some(s), _) => s.to_string(),
            (None, Some(state)) => match state {
                JobState::Waiting | JobState::Delayed => "waiting".to_string(),
                other => other.as_str().to_string(),
            },
            (None, None) => return Err(Error::NotFound(format!("Job {} not found", job_id))),
        };
        let progress = if logs.is_empty() {
            if status == "completed" { 100.0 } else { 0.0 }
        } else {
            let settled = logs.iter().filter(|l| !l.status.is_pending()).count();
            round2(settled as f64 * 100.0 / logs.len() as f64)
        };

        Ok(JobStatusView {
            job_id: job_id.to_string(),
            status,
            progress,
            queue_state,
            logs,
        })
    }

    /// Operator retry of one FAILED/ERROR log: RETRYING now, re-enqueued at high priority.
    ///
    /// Eligibility is checked under the record lock, so of two concurrent retries
    /// exactly one wins and the other sees RETRYING.
    pub async fn retry(&self, log_id: Uuid, requested_by: Option<&str>) -> Result<RetryOutcome> {
        let job_id = self.retry.next_job_id();
        let assigned = job_id.clone();
        let requested_by = requested_by.map(str::to_string);
        let log = self
            .repo
            .modify(
                log_id,
                Box::new(move |log, now| {
                    if !log.status.is_retriable_by_operator() {
                        return Err(Error::InvalidStateTransition {
                            from: log.status,
                            to: NotificationStatus::Retrying,
                        });
                    }
                    let entry = json!({
                        "at": to_rfc3339(now),
                        "requested_by": requested_by,
                        "previous_status": log.status,
                    });
                    log.apply_patch(
                        LogPatch::new()
                            .status(NotificationStatus::Retrying)
                            .next_retry_at(Some(now))
                            .job_id(assigned)
                            .append("retry_history", entry.clone())
                            .merge("last_retry", entry),
                        now,
                    )
                }),
            )
            .await?;

        match self
            .retry
            .enqueue_for(&log, job_id, Priority::High, None)
            .await
        {
            Ok(job_id) => {
                info!(log_id = %log_id, job_id = %job_id, "Notification re-queued by operator");
                Ok(RetryOutcome { log_id, job_id })
            }
            Err(e) => {
                self.mark_dispatch_error(log_id, &e).await;
                Err(e)
            }
        }
    }

    pub async fn retry_bulk(&self, cmd: RetryBulkCommand) -> Result<RetryBulkOutcome> {
        let limit = cmd.limit.clamp(1, PageRequest::MAX_PER_PAGE as usize);
        let ids: Vec<Uuid> = if !cmd.ids.is_empty() {
            cmd.ids.iter().copied().take(limit).collect()
        } else if let Some(filter) = cmd.filter {
            let filter = restrict_to_retriable(filter)?;
            let page = PageRequest {
                page: 1,
                per_page: limit as u32,
                sort_by: SortField::CreatedAt,
                order: SortOrder::Asc,
            };
            self.repo
                .find_all(&filter, &page)
                .await?
                .into_iter()
                .map(|l| l.id)
                .collect()
        } else {
            self.repo
                .find_failed_for_retry(limit)
                .await?
                .into_iter()
                .map(|l| l.id)
                .collect()
        };

        let mut outcome = RetryBulkOutcome::default();
        for id in ids {
            match self.retry(id, cmd.requested_by.as_deref()).await {
                Ok(r) => {
                    outcome.retried_count += 1;
                    outcome.job_ids.push(r.job_id);
                }
                Err(e) => {
                    outcome.errors.insert(id.to_string(), e.to_string());
                }
            }
        }
        Ok(outcome)
    }

    /// Cancels a pending log; removing its queue job is best-effort.
    pub async fn cancel(&self, log_id: Uuid, requested_by: Option<&str>) -> Result<CancelOutcome> {
        let requested_by = requested_by.map(str::to_string);
        let log = self
            .repo
            .modify(
                log_id,
                Box::new(move |log, now| {
                    if !log.status.is_cancelable() {
                        return Err(Error::InvalidStateTransition {
                            from: log.status,
                            to: NotificationStatus::Canceled,
                        });
                    }
                    log.apply_patch(
                        LogPatch::new().status(NotificationStatus::Canceled).merge(
                            "canceled",
                            json!({ "at": to_rfc3339(now), "by": requested_by }),
                        ),
                        now,
                    )
                }),
            )
            .await?;

        let mut job_removed = false;
        if let Some(job_id) = &log.job_id {
            match self.queue.remove(job_id).await {
                Ok(removed) => job_removed = removed,
                Err(e) => warn!(log_id = %log_id, job_id = %job_id, error = ?e, "Could not remove canceled job"),
            }
        }
        info!(log_id = %log_id, job_removed, "Notification canceled");
        Ok(CancelOutcome {
            canceled: true,
            job_removed,
        })
    }
}

fn validate_addressing(recipients: &[String], envelope: &Envelope) -> Result<()> {
    let mut errors = Vec::new();
    if recipients.is_empty() {
        errors.push(FieldError::new("recipients", "must contain at least one recipient"));
    }
    for (i, to) in recipients.iter().enumerate() {
        if let Some(msg) = envelope.channel.check_address(to) {
            errors.push(FieldError::new(format!("recipients[{}]", i), msg));
        }
    }
    let email_lists = [("cc", &envelope.cc), ("bcc", &envelope.bcc)];
    for (field, list) in email_lists {
        for (i, addr) in list.iter().enumerate() {
            if let Some(msg) = Channel::Email.check_address(addr) {
                errors.push(FieldError::new(format!("{}[{}]", field, i), msg));
            }
        }
    }
    for (field, addr) in [("from", &envelope.from), ("reply_to", &envelope.reply_to)] {
        if let Some(msg) = addr.as_deref().and_then(|a| Channel::Email.check_address(a)) {
            errors.push(FieldError::new(field, msg));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(errors))
    }
}

fn restrict_to_retriable(mut filter: LogFilter) -> Result<LogFilter> {
    let retriable = [NotificationStatus::Failed, NotificationStatus::Error];
    if filter.statuses.is_empty() {
        filter.statuses = retriable.to_vec();
    } else {
        filter.statuses.retain(|s| s.is_retriable_by_operator());
        if filter.statuses.is_empty() {
            return Err(Error::validation(
                "status",
                "only failed or error logs can be retried",
            ));
        }
    }
    Ok(filter)
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::delivery_job::JobSnapshot;
    use crate::repository::InMemoryLogRepository;
    use crate::services::queue_service::MockDeliveryQueue;
    use crate::services::retry_service::{PatternClassifier, RetryPolicy};
    use crate::utils::ids::SequentialIds;
    use crate::utils::time::ManualClock;
    use async_trait::async_trait;
    use crate::models::delivery_job::QueueMetrics;

    fn service_with(
        queue: Arc<dyn DeliveryQueue>,
        settings: DispatchSettings,
    ) -> (Arc<InMemoryLogRepository>, NotificationService) {
        let clock = Arc::new(ManualClock::default());
        let repo = Arc::new(InMemoryLogRepository::new(clock.clone()));
        let renderer = Arc::new(TemplateRenderer::with_defaults());
        let retry = RetryEngine::new(
            repo.clone(),
            queue.clone(),
            renderer.clone(),
            Arc::new(PatternClassifier::default()),
            RetryPolicy::default(),
            "no-reply@example.com",
        );
        let service = NotificationService::new(
            repo.clone(),
            queue,
            renderer,
            retry,
            clock,
            Arc::new(SequentialIds::default()),
            settings,
        );
        (repo, service)
    }

    fn welcome(recipients: &[&str]) -> DispatchCommand {
        DispatchCommand {
            notification_type: "welcome".into(),
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            data: json!({ "user_name": "Ada" }),
            source: "test".into(),
            ..DispatchCommand::default()
        }
    }

    #[tokio::test]
    async fn invalid_recipients_are_reported_per_index() {
        let mut queue = MockDeliveryQueue::new();
        queue.expect_enqueue().never();
        let (repo, service) = service_with(Arc::new(queue), DispatchSettings::default());

        let err = service
            .dispatch(welcome(&["ok@example.com", "not-an-email"]))
            .await
            .unwrap_err();
        match err {
            Error::Validation(fields) => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].field, "recipients[1]");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn production_refuses_when_queue_is_down() {
        let mut queue = MockDeliveryQueue::new();
        queue.expect_is_available().return_const(false);
        queue.expect_enqueue().never();
        let settings = DispatchSettings {
            environment: AppEnv::Production,
            ..DispatchSettings::default()
        };
        let (repo, service) = service_with(Arc::new(queue), settings);

        let err = service.dispatch(welcome(&["a@example.com"])).await.unwrap_err();
        assert!(matches!(err, Error::QueueUnavailable(_)));
        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn enqueue_failure_marks_only_that_log_errored() {
        let mut queue = MockDeliveryQueue::new();
        queue.expect_enqueue().returning(|job, _| {
            if job.message.to == "b@example.com" {
                Err(Error::QueueUnavailable("redis down".into()))
            } else {
                Ok(format!("job-{}", job.message.to))
            }
        });
        queue.expect_remove().times(1).returning(|_| Ok(false));
        let (repo, service) = service_with(Arc::new(queue), DispatchSettings::default());

        let outcome = service
            .dispatch(welcome(&["a@example.com", "b@example.com"]))
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.job_ids, vec!["job-a@example.com".to_string()]);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].starts_with("b@example.com"));

        let errored = repo
            .count(&LogFilter::with_statuses([NotificationStatus::Error]))
            .await
            .unwrap();
        assert_eq!(errored, 1);
    }

    struct StuckQueue;

    #[async_trait]
    impl DeliveryQueue for StuckQueue {
        async fn enqueue(&self, _job: DeliveryJob, _options: EnqueueOptions) -> Result<JobId> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("never".into())
        }
        async fn get_job(&self, _job_id: &str) -> Result<Option<JobSnapshot>> {
            Ok(None)
        }
        async fn remove(&self, _job_id: &str) -> Result<bool> {
            Ok(false)
        }
        fn is_available(&self) -> bool {
            true
        }
        async fn close(&self) {}
        async fn metrics(&self) -> Result<QueueMetrics> {
            Ok(QueueMetrics::default())
        }
        async fn retry_failed(&self) -> Result<usize> {
            Ok(0)
        }
        async fn clean_completed(&self, _older_than: Duration, _limit: usize) -> Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn slow_recipient_times_out_alone() {
        let settings = DispatchSettings {
            dispatch_timeout: Duration::from_millis(50),
            ..DispatchSettings::default()
        };
        let (repo, service) = service_with(Arc::new(StuckQueue), settings);

        let outcome = service.dispatch(welcome(&["a@example.com"])).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.log_ids.is_empty());
        assert!(outcome.errors[0].contains("Timed out"));

        let logs = repo
            .find_all(&LogFilter::default(), &PageRequest::default())
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, NotificationStatus::Error);
    }

    #[test]
    fn overall_status_precedence() {
        let clock = ManualClock::default();
        let mk = |n: u128, status: NotificationStatus| {
            let mut log = NotificationLog::queued(
                Uuid::from_u128(n),
                "a@example.com",
                NotificationType::Welcome,
                json!({}),
                Map::new(),
                clock.now(),
            );
            log.status = status;
            log
        };
        use NotificationStatus as S;
        assert_eq!(overall_status(&[]), None);
        assert_eq!(overall_status(&[mk(1, S::Sent), mk(2, S::Sent)]), Some("completed"));
        assert_eq!(overall_status(&[mk(1, S::Failed), mk(2, S::Retrying)]), Some("retrying"));
        assert_eq!(overall_status(&[mk(1, S::Sent), mk(2, S::Queued)]), Some("waiting"));
        assert_eq!(overall_status(&[mk(1, S::Sent), mk(2, S::Error)]), Some("failed"));
        assert_eq!(overall_status(&[mk(1, S::Canceled)]), Some("canceled"));
    }
}
