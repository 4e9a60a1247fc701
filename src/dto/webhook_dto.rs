//! Inbound delivery-status payloads, one shape per provider.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// One element of a SendGrid event webhook batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SendGridEvent {
    pub email: Option<String>,
    pub event: Option<String>,
    pub sg_message_id: Option<String>,
    pub reason: Option<String>,
    /// Custom arg attached at send time.
    pub notification_log_id: Option<String>,
    /// `bounce` or `blocked` on bounce events.
    #[serde(rename = "type")]
    pub bounce_type: Option<String>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MailgunWebhook {
    #[serde(rename = "event-data")]
    pub event_data: MailgunEventData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MailgunEventData {
    pub event: Option<String>,
    pub recipient: Option<String>,
    /// `permanent` or `temporary` on `failed` events.
    pub severity: Option<String>,
    pub reason: Option<String>,
    #[serde(rename = "delivery-status")]
    pub delivery_status: Option<MailgunDeliveryStatus>,
    pub message: Option<MailgunMessage>,
    #[serde(rename = "user-variables")]
    pub user_variables: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MailgunDeliveryStatus {
    pub message: Option<String>,
    pub description: Option<String>,
    pub code: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MailgunMessage {
    pub headers: MailgunHeaders,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MailgunHeaders {
    #[serde(rename = "message-id")]
    pub message_id: Option<String>,
}

/// SNS envelope around SES notifications.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct SnsEnvelope {
    #[serde(rename = "Type")]
    pub kind: Option<String>,
    pub message: Option<String>,
    #[serde(rename = "SubscribeURL")]
    pub subscribe_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SesNotification {
    #[serde(alias = "eventType")]
    pub notification_type: Option<String>,
    pub mail: SesMail,
    pub bounce: Option<SesBounce>,
    pub complaint: Option<SesComplaint>,
    pub delivery: Option<JsonValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SesMail {
    pub message_id: Option<String>,
    pub destination: Vec<String>,
    /// SES message tags; `notification_log_id` is set at send time when available.
    pub tags: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SesBounce {
    /// `Permanent`, `Transient` or `Undetermined`.
    pub bounce_type: Option<String>,
    pub bounce_sub_type: Option<String>,
    pub bounced_recipients: Vec<SesRecipient>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SesComplaint {
    pub complaint_feedback_type: Option<String>,
    pub complained_recipients: Vec<SesRecipient>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SesRecipient {
    pub email_address: Option<String>,
    pub diagnostic_code: Option<String>,
}

/// Loose shape for providers without a dedicated parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenericEvent {
    pub event: Option<String>,
    pub status: Option<String>,
    pub to: Option<String>,
    pub email: Option<String>,
    pub recipient: Option<String>,
    pub message_id: Option<String>,
    pub log_id: Option<String>,
    pub notification_log_id: Option<String>,
    pub reason: Option<String>,
    pub metadata: Map<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookAck {
    pub success: bool,
    pub processed: usize,
}
