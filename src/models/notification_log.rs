use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::notification::NotificationType;
use crate::utils::time::add_saturating;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Queued,
    Sending,
    Sent,
    Failed,
    Error,
    Retrying,
    Canceled,
}

impl NotificationStatus {
    pub const ALL: [NotificationStatus; 7] = [
        NotificationStatus::Queued,
        NotificationStatus::Sending,
        NotificationStatus::Sent,
        NotificationStatus::Failed,
        NotificationStatus::Error,
        NotificationStatus::Retrying,
        NotificationStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Queued => "queued",
            NotificationStatus::Sending => "sending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Error => "error",
            NotificationStatus::Retrying => "retrying",
            NotificationStatus::Canceled => "canceled",
        }
    }

    /// Still waiting for (or in the middle of) a delivery attempt.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Queued | NotificationStatus::Sending | NotificationStatus::Retrying
        )
    }

    pub fn is_cancelable(&self) -> bool {
        self.is_pending()
    }

    pub fn is_retriable_by_operator(&self) -> bool {
        matches!(self, NotificationStatus::Failed | NotificationStatus::Error)
    }

    pub fn can_transition_to(&self, to: NotificationStatus) -> bool {
        use NotificationStatus as S;
        match self {
            S::Queued | S::Sending | S::Retrying => to != S::Queued,
            // late delivery confirmation from the provider
            S::Failed => matches!(to, S::Retrying | S::Sent | S::Failed),
            S::Error => to == S::Retrying,
            // late provider bounce
            S::Sent => to == S::Failed,
            S::Canceled => false,
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        NotificationStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| Error::validation("status", format!("unknown status '{}'", wanted)))
    }
}

/// One delivery attempt record per recipient per notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationLog {
    pub id: Uuid,
    pub to: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub payload: JsonValue,
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_log: Vec<String>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub job_id: Option<String>,
    pub metadata: Map<String, JsonValue>,
}

impl NotificationLog {
    pub fn queued(
        id: Uuid,
        to: impl Into<String>,
        notification_type: NotificationType,
        payload: JsonValue,
        metadata: Map<String, JsonValue>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            to: to.into(),
            notification_type,
            payload,
            status: NotificationStatus::Queued,
            created_at: now,
            updated_at: now,
            sent_at: None,
            error_log: Vec::new(),
            retry_count: 0,
            next_retry_at: None,
            job_id: None,
            metadata,
        }
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Moves to `to`, enforcing the transition table.
    pub fn transition(&mut self, to: NotificationStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidStateTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        if to == NotificationStatus::Sent && self.sent_at.is_none() {
            self.sent_at = Some(now);
        }
        if to != NotificationStatus::Retrying {
            self.next_retry_at = None;
        }
        Ok(())
    }

    pub fn push_error(&mut self, error: impl Into<String>) {
        self.error_log.push(error.into());
    }

    /// Business-level failure bookkeeping.
    ///
    /// Appends the error and bumps `retry_count` (never past `max_retries + 1`).
    /// While the budget lasts the log goes to RETRYING with
    /// `next_retry_at = now + base_delay * 2^(retry_count - 1)`; afterwards it is FAILED.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        max_retries: u32,
        base_delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if matches!(
            self.status,
            NotificationStatus::Sent | NotificationStatus::Canceled
        ) {
            return Err(Error::InvalidStateTransition {
                from: self.status,
                to: NotificationStatus::Failed,
            });
        }
        self.push_error(error);
        if self.retry_count <= max_retries {
            self.retry_count += 1;
        }
        self.updated_at = now;
        if self.retry_count <= max_retries {
            self.status = NotificationStatus::Retrying;
            self.next_retry_at = Some(add_saturating(now, backoff_delay(base_delay, self.retry_count)));
        } else {
            self.status = NotificationStatus::Failed;
            self.next_retry_at = None;
        }
        Ok(())
    }

    pub fn apply_patch(&mut self, patch: LogPatch, now: DateTime<Utc>) -> Result<()> {
        if let Some(status) = patch.status {
            if status != self.status {
                self.transition(status, now)?;
            }
        }
        if let Some(payload) = patch.payload {
            self.payload = payload;
        }
        if let Some(job_id) = patch.job_id {
            self.job_id = Some(job_id);
        }
        if let Some(next_retry_at) = patch.next_retry_at {
            self.next_retry_at = next_retry_at;
        }
        merge_map(&mut self.metadata, patch.metadata);
        for (key, value) in patch.append {
            match self.metadata.get_mut(&key) {
                Some(JsonValue::Array(items)) => items.push(value),
                _ => {
                    self.metadata.insert(key, JsonValue::Array(vec![value]));
                }
            }
        }
        if let Some(error) = patch.error {
            self.push_error(error);
        }
        self.updated_at = now;
        Ok(())
    }
}

/// `base * 2^(attempt - 1)`, saturating.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent).unwrap_or(Duration::MAX)
}

fn merge_map(target: &mut Map<String, JsonValue>, source: Map<String, JsonValue>) {
    for (key, value) in source {
        match (target.get_mut(&key), value) {
            (Some(JsonValue::Object(existing)), JsonValue::Object(incoming)) => {
                merge_map(existing, incoming)
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

/// Partial update with merge semantics; untouched fields keep their stored values.
#[derive(Debug, Clone, Default)]
pub struct LogPatch {
    pub status: Option<NotificationStatus>,
    pub payload: Option<JsonValue>,
    pub job_id: Option<String>,
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    /// Merged key-wise into the stored metadata (objects recursively).
    pub metadata: Map<String, JsonValue>,
    /// Pushed onto metadata arrays, creating them when absent.
    pub append: Vec<(String, JsonValue)>,
    /// Appended to `error_log`.
    pub error: Option<String>,
}

impl LogPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: NotificationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn next_retry_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    pub fn payload(mut self, payload: JsonValue) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn merge(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn append(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.append.push((key.into(), value));
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogFilter {
    /// Empty means any status.
    pub statuses: Vec<NotificationStatus>,
    pub notification_type: Option<NotificationType>,
    pub to: Option<String>,
    pub job_id: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl LogFilter {
    pub fn with_statuses(statuses: impl IntoIterator<Item = NotificationStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn matches(&self, log: &NotificationLog) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&log.status) {
            return false;
        }
        if let Some(ty) = self.notification_type {
            if log.notification_type != ty {
                return false;
            }
        }
        if let Some(to) = &self.to {
            if !log.to.eq_ignore_ascii_case(to) {
                return false;
            }
        }
        if let Some(job_id) = &self.job_id {
            if log.job_id.as_deref() != Some(job_id.as_str()) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if log.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if log.created_at >= before {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    RetryCount,
    Status,
    To,
}

impl SortField {
    pub fn column(&self) -> &'static str {
        match self {
            SortField::CreatedAt => "created_at",
            SortField::UpdatedAt => "updated_at",
            SortField::RetryCount => "retry_count",
            SortField::Status => "status",
            SortField::To => "recipient",
        }
    }

    pub fn compare(&self, a: &NotificationLog, b: &NotificationLog) -> Ordering {
        let primary = match self {
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            SortField::RetryCount => a.retry_count.cmp(&b.retry_count),
            SortField::Status => a.status.as_str().cmp(b.status.as_str()),
            SortField::To => a.to.cmp(&b.to),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn keyword(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based.
    pub page: u32,
    pub per_page: u32,
    pub sort_by: SortField,
    pub order: SortOrder,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 20,
            sort_by: SortField::default(),
            order: SortOrder::default(),
        }
    }
}

impl PageRequest {
    pub const MAX_PER_PAGE: u32 = 100;

    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            per_page: self.per_page.clamp(1, Self::MAX_PER_PAGE),
            ..self
        }
    }

    pub fn offset(&self) -> usize {
        (self.page.max(1) as usize - 1) * self.per_page as usize
    }

    pub fn sort(&self, logs: &mut [NotificationLog]) {
        logs.sort_by(|a, b| {
            let ord = self.sort_by.compare(a, b);
            match self.order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::time::to_chrono;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_800_000_000 + secs, 0).unwrap()
    }

    fn fresh() -> NotificationLog {
        NotificationLog::queued(
            Uuid::from_u128(7),
            "ada@example.com",
            NotificationType::Welcome,
            json!({}),
            Map::new(),
            at(0),
        )
    }

    #[test]
    fn backoff_doubles_from_base() {
        let base = Duration::from_secs(60);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(60));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(120));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(240));
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(60));
        assert_eq!(backoff_delay(Duration::MAX, 40), Duration::MAX);
    }

    #[test]
    fn record_failure_schedules_then_exhausts() {
        let mut log = fresh();
        let base = Duration::from_millis(60_000);
        for k in 1..=3u32 {
            log.record_failure(format!("attempt {}", k), 3, base, at(10)).unwrap();
            assert_eq!(log.retry_count, k);
            assert_eq!(log.status, NotificationStatus::Retrying);
            let expected = at(10) + to_chrono(backoff_delay(base, k));
            assert_eq!(log.next_retry_at, Some(expected));
        }
        log.record_failure("attempt 4", 3, base, at(20)).unwrap();
        assert_eq!(log.status, NotificationStatus::Failed);
        assert_eq!(log.retry_count, 4);
        assert!(log.next_retry_at.is_none());

        log.record_failure("attempt 5", 3, base, at(30)).unwrap();
        assert_eq!(log.retry_count, 4);
        assert_eq!(log.status, NotificationStatus::Failed);
        assert_eq!(log.error_log.len(), 5);
        assert_eq!(log.error_log[0], "attempt 1");
    }

    #[test]
    fn record_failure_rejects_sent_logs() {
        let mut log = fresh();
        log.transition(NotificationStatus::Sent, at(1)).unwrap();
        assert!(log.record_failure("late", 3, Duration::from_secs(1), at(2)).is_err());
    }

    #[test]
    fn sent_at_is_set_once() {
        let mut log = fresh();
        log.transition(NotificationStatus::Sending, at(1)).unwrap();
        log.transition(NotificationStatus::Sent, at(2)).unwrap();
        assert_eq!(log.sent_at, Some(at(2)));
        log.transition(NotificationStatus::Failed, at(3)).unwrap();
        assert_eq!(log.sent_at, Some(at(2)));
    }

    #[test]
    fn canceled_and_sent_are_closed_for_cancel() {
        assert!(!NotificationStatus::Sent.can_transition_to(NotificationStatus::Canceled));
        assert!(!NotificationStatus::Canceled.can_transition_to(NotificationStatus::Sending));
        assert!(NotificationStatus::Queued.can_transition_to(NotificationStatus::Canceled));
        assert!(NotificationStatus::Retrying.can_transition_to(NotificationStatus::Canceled));
        assert!(!NotificationStatus::Error.can_transition_to(NotificationStatus::Sending));
    }

    #[test]
    fn patch_merges_metadata_and_appends_history() {
        let mut log = fresh();
        log.metadata.insert("source".into(), json!("api"));
        log.metadata.insert("engagement".into(), json!({ "opened": true }));

        let patch = LogPatch::new()
            .merge("engagement", json!({ "clicked": true }))
            .append("webhook_events", json!({ "event": "open" }))
            .append("webhook_events", json!({ "event": "click" }))
            .error("boom");
        log.apply_patch(patch, at(5)).unwrap();

        assert_eq!(log.metadata["source"], "api");
        assert_eq!(log.metadata["engagement"], json!({ "opened": true, "clicked": true }));
        assert_eq!(log.metadata["webhook_events"].as_array().unwrap().len(), 2);
        assert_eq!(log.error_log, vec!["boom".to_string()]);
        assert_eq!(log.updated_at, at(5));
    }

    #[test]
    fn filter_and_sort_compose() {
        let mut a = fresh();
        a.id = Uuid::from_u128(1);
        a.retry_count = 2;
        let mut b = fresh();
        b.id = Uuid::from_u128(2);
        b.created_at = at(50);
        b.status = NotificationStatus::Failed;

        let filter = LogFilter::with_statuses([NotificationStatus::Failed]);
        assert!(!filter.matches(&a));
        assert!(filter.matches(&b));

        let mut logs = vec![a.clone(), b.clone()];
        let page = PageRequest {
            sort_by: SortField::RetryCount,
            order: SortOrder::Asc,
            ..PageRequest::default()
        };
        page.sort(&mut logs);
        assert_eq!(logs[0].id, b.id);
    }

    #[test]
    fn page_request_is_clamped() {
        let page = PageRequest {
            page: 0,
            per_page: 1000,
            ..PageRequest::default()
        }
        .normalized();
        assert_eq!(page.page, 1);
        assert_eq!(page.per_page, 100);
        assert_eq!(page.offset(), 0);
    }
}
