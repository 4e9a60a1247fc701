use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::notification::{Channel, NotificationType};

pub type JobId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Queue rank; lower is served first.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    /// Inverse of [`Priority::rank`]; unknown ranks fall back to normal.
    pub fn from_rank(rank: i64) -> Self {
        match rank {
            1 => Priority::High,
            3 => Priority::Low,
            _ => Priority::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(Error::validation(
                "priority",
                format!("unknown priority '{}'", other),
            )),
        }
    }
}

/// Rendered subject/html/text for one notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedContent {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// A fully addressed, rendered message as handed to the mail transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: Channel,
    pub to: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub subject: String,
    pub html: String,
    pub text: String,
}

impl OutboundMessage {
    pub fn new(envelope: &Envelope, to: impl Into<String>, default_from: &str, content: RenderedContent) -> Self {
        Self {
            channel: envelope.channel,
            to: to.into(),
            cc: envelope.cc.clone(),
            bcc: envelope.bcc.clone(),
            from: envelope
                .from
                .clone()
                .unwrap_or_else(|| default_from.to_string()),
            reply_to: envelope.reply_to.clone(),
            subject: content.subject,
            html: content.html,
            text: content.text,
        }
    }

    pub fn content(&self) -> RenderedContent {
        RenderedContent {
            subject: self.subject.clone(),
            html: self.html.clone(),
            text: self.text.clone(),
        }
    }
}

/// Addressing shared by every recipient of one dispatch request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    pub channel: Channel,
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    pub reply_to: Option<String>,
}

/// Shape of `NotificationLog::payload`: rendered content plus everything needed to
/// re-render and re-address the message on retry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredPayload {
    pub subject: String,
    pub html: String,
    pub text: String,
    pub data: JsonValue,
    pub envelope: Envelope,
}

impl StoredPayload {
    pub fn new(content: RenderedContent, data: JsonValue, envelope: Envelope) -> Self {
        Self {
            subject: content.subject,
            html: content.html,
            text: content.text,
            data,
            envelope,
        }
    }

    /// Lenient: anything unreadable comes back as an empty payload.
    pub fn from_value(value: &JsonValue) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn to_value(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or_default()
    }

    pub fn content(&self) -> Option<RenderedContent> {
        if self.subject.is_empty() && self.html.is_empty() && self.text.is_empty() {
            return None;
        }
        Some(RenderedContent {
            subject: self.subject.clone(),
            html: self.html.clone(),
            text: self.text.clone(),
        })
    }
}

/// Queue payload. Links back to the notification log it delivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub log_id: Uuid,
    pub notification_type: NotificationType,
    pub message: OutboundMessage,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
    pub priority: Priority,
    /// Held in the delayed set until this instant; past instants run immediately.
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Caller-assigned id, already recorded on the log. The queue generates one when unset.
    pub job_id: Option<JobId>,
}

impl EnqueueOptions {
    pub fn new(priority: Priority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    pub fn scheduled(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.scheduled_time = at;
        self
    }

    pub fn job_id(mut self, id: impl Into<JobId>) -> Self {
        self.job_id = Some(id.into());
        self
    }
}

/// One execution of a queue job, as handed to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRun {
    pub id: JobId,
    /// 1-based, counted within the current attempt budget.
    pub attempt: u32,
    /// Set once `retry_failed` has moved the job back out of the failed set.
    pub revived: bool,
}

impl JobRun {
    pub fn new(id: impl Into<JobId>, attempt: u32) -> Self {
        Self {
            id: id.into(),
            attempt,
            revived: false,
        }
    }

    pub fn revived(mut self, revived: bool) -> Self {
        self.revived = revived;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a queue job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub state: JobState,
    pub priority: Priority,
    pub attempts_made: u32,
    pub created_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub job: DeliveryJob,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    pub queue: String,
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    /// Enqueues accepted in degraded (log-only) mode.
    pub degraded: u64,
}
