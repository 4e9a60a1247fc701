use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;
use validator::Validate;

use crate::error::Result;
use crate::models::delivery_job::{Envelope, Priority};
use crate::models::notification::{Channel, NotificationType};
use crate::models::notification_log::{
    LogFilter, NotificationStatus, PageRequest, SortField, SortOrder,
};
use crate::services::history_service::CleanupCommand;
use crate::services::notification_service::{DispatchCommand, RetryBulkCommand};

pub const HTTP_SOURCE: &str = "api";

/// Accepts `"a@x"` as well as `["a@x", "b@x"]`.
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
        None => Vec::new(),
    })
}

#[derive(Debug, Deserialize, Validate)]
pub struct DispatchRequest {
    #[serde(rename = "type")]
    #[validate(length(min = 1, message = "type is required"))]
    pub notification_type: String,
    #[serde(default, alias = "to", deserialize_with = "one_or_many")]
    #[validate(length(max = 500, message = "at most 500 recipients per request"))]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub data: JsonValue,
    #[serde(default)]
    pub channel: Channel,
    #[serde(default)]
    pub priority: Priority,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub from: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub cc: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub bcc: Vec<String>,
    pub reply_to: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
}

impl DispatchRequest {
    pub fn into_command(self, requested_by: Option<String>) -> DispatchCommand {
        DispatchCommand {
            notification_type: self.notification_type,
            recipients: self.recipients,
            data: self.data,
            envelope: Envelope {
                channel: self.channel,
                from: self.from,
                cc: self.cc,
                bcc: self.bcc,
                reply_to: self.reply_to,
            },
            priority: self.priority,
            scheduled_time: self.scheduled_time,
            source: HTTP_SOURCE.to_string(),
            requested_by,
            metadata: self.metadata,
        }
    }
}

/// `?status=failed,error`
fn parse_statuses(raw: Option<&str>) -> Result<Vec<NotificationStatus>> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<_>>>()
    })
    .transpose()
    .map(Option::unwrap_or_default)
}

fn parse_type(raw: Option<&str>) -> Result<Option<NotificationType>> {
    raw.filter(|s| !s.trim().is_empty()).map(str::parse).transpose()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LogQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub notification_type: Option<String>,
    pub to: Option<String>,
    pub job_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub sort_by: Option<SortField>,
    pub order: Option<SortOrder>,
}

impl LogQuery {
    pub fn filter(&self) -> Result<LogFilter> {
        Ok(LogFilter {
            statuses: parse_statuses(self.status.as_deref())?,
            notification_type: parse_type(self.notification_type.as_deref())?,
            to: self.to.clone().filter(|s| !s.trim().is_empty()),
            job_id: self.job_id.clone().filter(|s| !s.trim().is_empty()),
            created_after: self.from,
            created_before: self.to_date,
        })
    }

    pub fn page(&self) -> PageRequest {
        let defaults = PageRequest::default();
        PageRequest {
            page: self.page.unwrap_or(defaults.page),
            per_page: self.per_page.unwrap_or(defaults.per_page),
            sort_by: self.sort_by.unwrap_or(defaults.sort_by),
            order: self.order.unwrap_or(defaults.order),
        }
        .normalized()
    }
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(default)]
pub struct RetryBulkRequest {
    pub ids: Vec<Uuid>,
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub notification_type: Option<String>,
    pub to: Option<String>,
    #[validate(range(min = 1, max = 100))]
    pub limit: Option<usize>,
}

impl RetryBulkRequest {
    pub fn into_command(self, requested_by: Option<String>) -> Result<RetryBulkCommand> {
        let has_filter =
            self.status.is_some() || self.notification_type.is_some() || self.to.is_some();
        let filter = if has_filter {
            Some(LogFilter {
                statuses: parse_statuses(self.status.as_deref())?,
                notification_type: parse_type(self.notification_type.as_deref())?,
                to: self.to,
                ..LogFilter::default()
            })
        } else {
            None
        };
        Ok(RetryBulkCommand {
            ids: self.ids,
            filter,
            limit: self.limit.unwrap_or(PageRequest::MAX_PER_PAGE as usize),
            requested_by,
        })
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CleanupRequest {
    #[serde(default = "default_cleanup_days")]
    #[validate(range(min = 1, message = "older_than_days must be at least 1"))]
    pub older_than_days: u32,
    pub include_statuses: Option<Vec<String>>,
    pub exclude_statuses: Option<Vec<String>>,
    pub limit: Option<usize>,
}

fn default_cleanup_days() -> u32 {
    30
}

impl CleanupRequest {
    pub fn into_command(self) -> Result<CleanupCommand> {
        let parse = |list: Option<Vec<String>>| -> Result<Option<Vec<NotificationStatus>>> {
            list.map(|items| items.iter().map(|s| s.parse()).collect())
                .transpose()
        };
        Ok(CleanupCommand {
            older_than_days: self.older_than_days,
            include: parse(self.include_statuses)?,
            exclude: parse(self.exclude_statuses)?,
            limit: self.limit,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StatsQuery {
    pub since_days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct QueueCleanRequest {
    /// Completed jobs finished longer ago than this are dropped.
    pub older_than_secs: Option<u64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_to_is_accepted() {
        let req: DispatchRequest = serde_json::from_value(json!({
            "type": "WELCOME",
            "to": "ada@example.com",
            "data": { "name": "Ada" },
            "priority": "high"
        }))
        .unwrap();
        assert_eq!(req.recipients, vec!["ada@example.com"]);
        let cmd = req.into_command(Some("ops".into()));
        assert_eq!(cmd.priority, Priority::High);
        assert_eq!(cmd.source, HTTP_SOURCE);
        assert_eq!(cmd.requested_by.as_deref(), Some("ops"));
    }

    #[test]
    fn log_query_parses_status_lists() {
        let q = LogQuery {
            status: Some("FAILED, error".into()),
            per_page: Some(1_000),
            ..LogQuery::default()
        };
        let filter = q.filter().unwrap();
        assert_eq!(
            filter.statuses,
            vec![NotificationStatus::Failed, NotificationStatus::Error]
        );
        assert_eq!(q.page().per_page, PageRequest::MAX_PER_PAGE);

        let bad = LogQuery {
            status: Some("lost".into()),
            ..LogQuery::default()
        };
        assert!(bad.filter().is_err());
    }

    #[test]
    fn cleanup_request_defaults() {
        let req: CleanupRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(req.older_than_days, 30);
        let cmd = req.into_command().unwrap();
        assert!(cmd.exclude.is_none());
    }
}
