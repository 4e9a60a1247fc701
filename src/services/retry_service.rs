use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::RegexSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::delivery_job::{
    DeliveryJob, EnqueueOptions, JobId, OutboundMessage, Priority, RenderedContent, StoredPayload,
};
use crate::models::notification::NotificationKind;
use crate::models::notification_log::{
    backoff_delay, LogPatch, NotificationLog, NotificationStatus,
};
use crate::repository::NotificationLogRepository;
use crate::services::queue_service::DeliveryQueue;
use crate::services::template_service::TemplateRenderer;
use crate::transport::SendError;
use crate::utils::ids::{IdGenerator, UuidGenerator};

/// Business-level retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// When off, RETRYING logs wait for an operator instead of being re-enqueued.
    pub auto_reschedule: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(60_000),
            auto_reschedule: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the `attempt`-th retry (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_delay, attempt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

/// Decides whether a send error is worth retrying.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &str) -> FailureClass;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&str) -> FailureClass + Send + Sync,
{
    fn classify(&self, error: &str) -> FailureClass {
        self(error)
    }
}

pub const DEFAULT_PERMANENT_PATTERNS: &[&str] = &[
    r"(?i)invalid\s+(e-?mail|address|recipient|mailbox)",
    r"(?i)(address|recipient)\s+(rejected|not\s+found|does\s+not\s+exist)",
    r"(?i)user\s+unknown",
    r"(?i)no\s+such\s+user",
    r"(?i)mailbox\s+(unavailable|not\s+found|disabled)",
    r"(?i)policy\s+(violation|rejection)|rejected\s+by\s+policy",
    r"(?i)account\s+(suspended|disabled)|suspended\s+account",
    r"(?i)authentication\s+(failed|required)|invalid\s+credentials|unauthori[sz]ed",
    r"^\s*55[0-4]\b",
];

/// Regex-backed classifier: any match means permanent.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    patterns: RegexSet,
}

impl PatternClassifier {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = RegexSet::new(patterns)
            .map_err(|e| Error::Config(format!("invalid permanent error pattern: {}", e)))?;
        Ok(Self { patterns })
    }

    /// Default patterns plus `extra`.
    pub fn with_extra(extra: &[String]) -> Result<Self> {
        let all = DEFAULT_PERMANENT_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .chain(extra.iter().filter(|p| !p.trim().is_empty()).cloned());
        Self::new(all)
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::with_extra(&[]).unwrap_or_else(|_| Self {
            patterns: RegexSet::empty(),
        })
    }
}

impl ErrorClassifier for PatternClassifier {
    fn classify(&self, error: &str) -> FailureClass {
        if self.patterns.is_match(error) {
            FailureClass::Permanent
        } else {
            FailureClass::Transient
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Classified permanent; the log is ERROR and the retry budget is untouched.
    PermanentlyFailed,
    /// Log is RETRYING until `at`; `job_id` is set when a delayed job was enqueued.
    RetryScheduled {
        at: DateTime<Utc>,
        job_id: Option<JobId>,
    },
    /// Retry budget used up; the log is FAILED.
    Exhausted,
    /// The log is no longer pending, belongs to another job, or is gone.
    Ignored,
}

/// Business-level failure handling on top of the log store and the queue.
#[derive(Clone)]
pub struct RetryEngine {
    repo: Arc<dyn NotificationLogRepository>,
    queue: Arc<dyn DeliveryQueue>,
    renderer: Arc<TemplateRenderer>,
    classifier: Arc<dyn ErrorClassifier>,
    policy: RetryPolicy,
    default_from: String,
    ids: Arc<dyn IdGenerator>,
}

impl RetryEngine {
    pub fn new(
        repo: Arc<dyn NotificationLogRepository>,
        queue: Arc<dyn DeliveryQueue>,
        renderer: Arc<TemplateRenderer>,
        classifier: Arc<dyn ErrorClassifier>,
        policy: RetryPolicy,
        default_from: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            queue,
            renderer,
            classifier,
            policy,
            default_from: default_from.into(),
            ids: Arc::new(UuidGenerator),
        }
    }

    /// Source of job ids assigned to logs before they are enqueued.
    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn next_job_id(&self) -> JobId {
        self.ids.next_id().to_string()
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn classify(&self, error: &SendError) -> FailureClass {
        if error.is_permanent() {
            return FailureClass::Permanent;
        }
        self.classifier.classify(error.message())
    }

    /// Business-level handling of a failed delivery by job `job_id`.
    ///
    /// Only applies while the log is still pending and still owned by that job; a log
    /// bounced, canceled or handed to another job in the meantime is left alone.
    pub async fn handle_failure(
        &self,
        log_id: Uuid,
        job_id: &str,
        error: &SendError,
    ) -> Result<FailureOutcome> {
        let permanent = self.classify(error) == FailureClass::Permanent;
        let message = error.message().to_string();
        let owner = job_id.to_string();
        let next_job = (!permanent && self.policy.auto_reschedule).then(|| self.next_job_id());
        let assigned = next_job.clone();
        let policy = self.policy;

        let result = self
            .repo
            .modify(
                log_id,
                Box::new(move |log, now| {
                    let to = if permanent {
                        NotificationStatus::Error
                    } else {
                        NotificationStatus::Retrying
                    };
                    if !log.status.is_pending() || log.job_id.as_deref() != Some(owner.as_str()) {
                        return Err(Error::InvalidStateTransition {
                            from: log.status,
                            to,
                        });
                    }
                    if permanent {
                        log.transition(NotificationStatus::Error, now)?;
                        log.push_error(message);
                        return Ok(());
                    }
                    log.record_failure(message, policy.max_retries, policy.base_delay, now)?;
                    if log.status == NotificationStatus::Retrying {
                        if let Some(next) = assigned {
                            log.job_id = Some(next);
                        }
                    }
                    Ok(())
                }),
            )
            .await;

        let updated = match result {
            Ok(log) => log,
            Err(Error::NotFound(_)) | Err(Error::InvalidStateTransition { .. }) => {
                debug!(log_id = %log_id, job_id = %job_id, "Failure ignored; log settled or reassigned");
                return Ok(FailureOutcome::Ignored);
            }
            Err(e) => return Err(e),
        };

        if permanent {
            warn!(log_id = %log_id, error = %error.message(), "Permanent delivery failure");
            return Ok(FailureOutcome::PermanentlyFailed);
        }

        match (updated.status, updated.next_retry_at) {
            (NotificationStatus::Retrying, Some(at)) => {
                let job_id = match next_job {
                    Some(next) => {
                        match self.enqueue_for(&updated, next, Priority::Normal, Some(at)).await {
                            Ok(id) => Some(id),
                            Err(e) => {
                                // nothing will pick the log up; leave it for an operator retry
                                let reason = format!("retry enqueue failed: {}", e);
                                if let Err(mark) = self
                                    .repo
                                    .update_status(log_id, NotificationStatus::Error, Some(reason))
                                    .await
                                {
                                    warn!(log_id = %log_id, error = ?mark, "Could not mark log as errored");
                                }
                                return Err(e);
                            }
                        }
                    }
                    None => None,
                };
                info!(
                    log_id = %log_id,
                    retry_count = updated.retry_count,
                    next_retry_at = %at,
                    "Delivery retry scheduled"
                );
                Ok(FailureOutcome::RetryScheduled { at, job_id })
            }
            _ => {
                warn!(log_id = %log_id, retry_count = updated.retry_count, "Retry budget exhausted");
                Ok(FailureOutcome::Exhausted)
            }
        }
    }

    /// Rebuilds the outbound message for `log`: re-rendered from the stored data when
    /// it still validates, else the stored rendering, else a minimal stand-in.
    pub fn rebuild_job(&self, log: &NotificationLog) -> DeliveryJob {
        let stored = StoredPayload::from_value(&log.payload);
        let content = NotificationKind::parse(log.notification_type, stored.data.clone())
            .ok()
            .and_then(|kind| {
                self.renderer
                    .render(log.notification_type, &kind.template_variables())
                    .ok()
            })
            .or_else(|| stored.content())
            .unwrap_or_else(|| minimal_content(log));

        DeliveryJob {
            log_id: log.id,
            notification_type: log.notification_type,
            message: OutboundMessage::new(&stored.envelope, log.to.clone(), &self.default_from, content),
            metadata: log.metadata.clone(),
        }
    }

    /// Enqueues a delivery job for `log` under `job_id`, which the caller has already
    /// recorded on the log. A queue that hands back a different id (degraded mode)
    /// gets that id back-filled.
    pub async fn enqueue_for(
        &self,
        log: &NotificationLog,
        job_id: JobId,
        priority: Priority,
        scheduled: Option<DateTime<Utc>>,
    ) -> Result<JobId> {
        let job = self.rebuild_job(log);
        let options = EnqueueOptions::new(priority)
            .scheduled(scheduled)
            .job_id(job_id.clone());
        let queued = self.queue.enqueue(job, options).await?;
        if queued != job_id {
            self.repo
                .update(log.id, LogPatch::new().job_id(queued.clone()))
                .await?;
        }
        Ok(queued)
    }
}

fn minimal_content(log: &NotificationLog) -> RenderedContent {
    let subject = log.notification_type.as_str().replace('_', " ");
    RenderedContent {
        html: format!("<p>{}</p>", subject),
        text: subject.clone(),
        subject,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::delivery_job::Envelope;
    use crate::models::notification::NotificationType;
    use crate::repository::InMemoryLogRepository;
    use crate::services::queue_service::MockDeliveryQueue;
    use crate::utils::ids::SequentialIds;
    use crate::utils::time::{Clock, ManualClock};
    use serde_json::{json, Map};

    fn engine(
        queue: MockDeliveryQueue,
    ) -> (Arc<ManualClock>, Arc<InMemoryLogRepository>, RetryEngine) {
        let clock = Arc::new(ManualClock::default());
        let repo = Arc::new(InMemoryLogRepository::new(clock.clone()));
        let engine = RetryEngine::new(
            repo.clone(),
            Arc::new(queue),
            Arc::new(TemplateRenderer::with_defaults()),
            Arc::new(PatternClassifier::default()),
            RetryPolicy::default(),
            "no-reply@example.com",
        )
        .with_ids(Arc::new(SequentialIds::default()));
        (clock, repo, engine)
    }

    async fn sending_log(repo: &InMemoryLogRepository, clock: &ManualClock) -> NotificationLog {
        let payload = StoredPayload::new(
            RenderedContent {
                subject: "old".into(),
                html: "old".into(),
                text: "old".into(),
            },
            json!({ "user_name": "Ada", "login_url": "https://app.test" }),
            Envelope::default(),
        );
        let mut log = NotificationLog::queued(
            Uuid::from_u128(1),
            "ada@example.com",
            NotificationType::Welcome,
            payload.to_value(),
            Map::new(),
            clock.now(),
        );
        log.job_id = Some("job-1".into());
        let log = repo.create(log).await.unwrap();
        repo.update_status(log.id, NotificationStatus::Sending, None)
            .await
            .unwrap()
    }

    #[test]
    fn pattern_classifier_flags_permanent_errors() {
        let c = PatternClassifier::default();
        assert_eq!(c.classify("550 5.1.1 User unknown"), FailureClass::Permanent);
        assert_eq!(c.classify("Recipient address rejected"), FailureClass::Permanent);
        assert_eq!(c.classify("Authentication failed"), FailureClass::Permanent);
        assert_eq!(c.classify("Account suspended"), FailureClass::Permanent);
        assert_eq!(c.classify("connection timed out"), FailureClass::Transient);
        assert_eq!(c.classify("421 try again later"), FailureClass::Transient);
    }

    #[test]
    fn closures_are_classifiers() {
        let never: Arc<dyn ErrorClassifier> = Arc::new(|_: &str| FailureClass::Transient);
        assert_eq!(never.classify("user unknown"), FailureClass::Transient);
    }

    #[test]
    fn extra_patterns_extend_defaults() {
        let c = PatternClassifier::with_extra(&["(?i)quota exceeded".to_string()]).unwrap();
        assert_eq!(c.classify("Quota exceeded for domain"), FailureClass::Permanent);
        assert!(PatternClassifier::with_extra(&["(".to_string()]).is_err());
    }

    #[test]
    fn policy_delay_doubles() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(1), Duration::from_secs(60));
        assert_eq!(p.delay_for(3), Duration::from_secs(240));
    }

    #[tokio::test]
    async fn permanent_failure_goes_to_error_without_consuming_budget() {
        let mut queue = MockDeliveryQueue::new();
        queue.expect_enqueue().never();
        let (clock, repo, engine) = engine(queue);
        let log = sending_log(&repo, &clock).await;

        let outcome = engine
            .handle_failure(log.id, "job-1", &SendError::Transient("550 user unknown".into()))
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::PermanentlyFailed);

        let stored = repo.find_by_id(log.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Error);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.error_log, vec!["550 user unknown".to_string()]);
    }

    #[tokio::test]
    async fn transient_failure_reschedules_with_rerendered_content() {
        let mut queue = MockDeliveryQueue::new();
        queue
            .expect_enqueue()
            .withf(|job, opts| {
                job.message.subject == "Welcome, Ada!"
                    && opts.scheduled_time.is_some()
                    && opts.job_id.is_some()
            })
            .times(1)
            .returning(|_, opts| Ok(opts.job_id.unwrap_or_default()));
        let (clock, repo, engine) = engine(queue);
        let log = sending_log(&repo, &clock).await;

        let outcome = engine
            .handle_failure(log.id, "job-1", &SendError::Transient("connection reset".into()))
            .await
            .unwrap();
        let expected_at = clock.now() + chrono::Duration::seconds(60);
        let next = Uuid::from_u128(1).to_string();
        assert_eq!(
            outcome,
            FailureOutcome::RetryScheduled {
                at: expected_at,
                job_id: Some(next.clone())
            }
        );
        let stored = repo.find_by_id(log.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Retrying);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.job_id, Some(next));
    }

    #[tokio::test]
    async fn manual_retry_mode_leaves_retrying_logs_unqueued() {
        let mut queue = MockDeliveryQueue::new();
        queue.expect_enqueue().never();
        let (clock, repo, engine) = engine(queue);
        let engine = RetryEngine {
            policy: RetryPolicy {
                auto_reschedule: false,
                ..RetryPolicy::default()
            },
            ..engine
        };
        let log = sending_log(&repo, &clock).await;

        let outcome = engine
            .handle_failure(log.id, "job-1", &SendError::Transient("connection reset".into()))
            .await
            .unwrap();
        assert!(matches!(outcome, FailureOutcome::RetryScheduled { job_id: None, .. }));
        let stored = repo.find_by_id(log.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Retrying);
        assert_eq!(stored.job_id.as_deref(), Some("job-1"));
    }

    #[tokio::test]
    async fn failures_from_a_replaced_job_are_ignored() {
        let mut queue = MockDeliveryQueue::new();
        queue.expect_enqueue().never();
        let (clock, repo, engine) = engine(queue);
        let log = sending_log(&repo, &clock).await;

        let outcome = engine
            .handle_failure(log.id, "job-0", &SendError::Transient("connection reset".into()))
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Ignored);
        let stored = repo.find_by_id(log.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Sending);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn settled_logs_are_ignored() {
        let mut queue = MockDeliveryQueue::new();
        queue.expect_enqueue().never();
        let (clock, repo, engine) = engine(queue);
        let log = sending_log(&repo, &clock).await;
        repo.mark_as_sent(log.id).await.unwrap();

        let outcome = engine
            .handle_failure(log.id, "job-1", &SendError::Transient("late".into()))
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Ignored);

        let bounced = repo
            .update_status(log.id, NotificationStatus::Failed, Some("bounce".into()))
            .await
            .unwrap();
        let outcome = engine
            .handle_failure(bounced.id, "job-1", &SendError::Transient("late".into()))
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Ignored);
        let stored = repo.find_by_id(log.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
    }

    #[tokio::test]
    async fn unreadable_payload_falls_back_to_minimal_content() {
        let queue = MockDeliveryQueue::new();
        let (clock, _, engine) = engine(queue);
        let log = NotificationLog::queued(
            Uuid::from_u128(9),
            "ada@example.com",
            NotificationType::PasswordReset,
            json!("garbage"),
            Map::new(),
            clock.now(),
        );
        let job = engine.rebuild_job(&log);
        assert_eq!(job.message.subject, "PASSWORD RESET");
        assert_eq!(job.message.from, "no-reply@example.com");
    }
}
