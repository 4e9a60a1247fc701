use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppEnv;
use crate::dto::webhook_dto::{
    GenericEvent, MailgunWebhook, SendGridEvent, SesNotification, SnsEnvelope, WebhookAck,
};
use crate::error::{Error, Result};
use crate::models::notification_log::{NotificationLog, NotificationStatus};
use crate::repository::NotificationLogRepository;
use crate::services::retry_service::RetryPolicy;
use crate::utils::crypto;
use crate::utils::time::{to_rfc3339, Clock};

/// Provider-agnostic delivery event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CanonicalEvent {
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Blocked,
    SpamComplaint,
    Deferred,
    Delayed,
    Dropped,
    Unknown,
}

impl CanonicalEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalEvent::Delivered => "delivered",
            CanonicalEvent::Opened => "opened",
            CanonicalEvent::Clicked => "clicked",
            CanonicalEvent::Bounced => "bounced",
            CanonicalEvent::Blocked => "blocked",
            CanonicalEvent::SpamComplaint => "spam-complaint",
            CanonicalEvent::Deferred => "deferred",
            CanonicalEvent::Delayed => "delayed",
            CanonicalEvent::Dropped => "dropped",
            CanonicalEvent::Unknown => "unknown",
        }
    }

    /// Ends delivery for good; no business retry follows.
    pub fn is_permanent_failure(&self) -> bool {
        matches!(
            self,
            CanonicalEvent::Bounced
                | CanonicalEvent::Blocked
                | CanonicalEvent::SpamComplaint
                | CanonicalEvent::Dropped
        )
    }

    pub fn is_transient_failure(&self) -> bool {
        matches!(self, CanonicalEvent::Deferred | CanonicalEvent::Delayed)
    }
}

impl fmt::Display for CanonicalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a provider's `event`/`status` pair onto [`CanonicalEvent`].
///
/// Both fields are compared case-insensitively. Checks run in a fixed order:
/// delivery, engagement, soft failures, permanent failures, delays.
pub fn normalize(event: Option<&str>, status: Option<&str>) -> CanonicalEvent {
    let fields: Vec<String> = [event, status]
        .into_iter()
        .flatten()
        .map(|f| f.trim().to_ascii_lowercase())
        .filter(|f| !f.is_empty())
        .collect();
    let has = |needles: &[&str]| fields.iter().any(|f| needles.iter().any(|n| f.contains(n)));
    let is = |words: &[&str]| fields.iter().any(|f| words.contains(&f.as_str()));

    if !has(&["undeliver", "not delivered", "not_delivered"])
        && (has(&["delivered"]) || is(&["delivery", "success", "succeeded", "sent"]))
    {
        return CanonicalEvent::Delivered;
    }
    if has(&["open"]) {
        return CanonicalEvent::Opened;
    }
    if has(&["click"]) {
        return CanonicalEvent::Clicked;
    }
    // soft bounces are temporary, checked before the bounce keywords
    if has(&["defer", "temporary", "soft"]) {
        return CanonicalEvent::Deferred;
    }
    if has(&["bounce", "undeliver", "not delivered", "not_delivered"]) {
        return CanonicalEvent::Bounced;
    }
    if has(&["block", "reject"]) {
        return CanonicalEvent::Blocked;
    }
    if has(&["spam", "complain", "abuse"]) {
        return CanonicalEvent::SpamComplaint;
    }
    if has(&["drop"]) {
        return CanonicalEvent::Dropped;
    }
    if has(&["delay"]) {
        return CanonicalEvent::Delayed;
    }
    // bare "failed" without a qualifier
    if has(&["fail"]) {
        return CanonicalEvent::Bounced;
    }
    CanonicalEvent::Unknown
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    SendGrid,
    Mailgun,
    Ses,
    Generic,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::SendGrid => "sendgrid",
            Provider::Mailgun => "mailgun",
            Provider::Ses => "ses",
            Provider::Generic => "generic",
        }
    }

    pub fn parse_events(&self, payload: JsonValue) -> Result<Vec<ProviderEvent>> {
        match self {
            Provider::SendGrid => parse_sendgrid(payload),
            Provider::Mailgun => parse_mailgun(payload),
            Provider::Ses => parse_ses(payload),
            Provider::Generic => parse_generic(payload),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sendgrid" => Ok(Provider::SendGrid),
            "mailgun" => Ok(Provider::Mailgun),
            "ses" | "aws-ses" | "amazon-ses" => Ok(Provider::Ses),
            "generic" => Ok(Provider::Generic),
            other => Err(Error::NotFound(format!("Unknown webhook provider '{}'", other))),
        }
    }
}

/// One delivery-status event, already normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEvent {
    pub event: CanonicalEvent,
    pub raw_event: Option<String>,
    pub raw_status: Option<String>,
    pub recipient: Option<String>,
    pub message_id: Option<String>,
    pub log_id: Option<Uuid>,
    pub reason: Option<String>,
}

impl ProviderEvent {
    fn new(raw_event: Option<String>, raw_status: Option<String>) -> Self {
        Self {
            event: normalize(raw_event.as_deref(), raw_status.as_deref()),
            raw_event,
            raw_status,
            recipient: None,
            message_id: None,
            log_id: None,
            reason: None,
        }
    }
}

fn parse_log_id(raw: Option<&str>) -> Option<Uuid> {
    raw.and_then(|s| Uuid::parse_str(s.trim()).ok())
}

fn as_list(payload: JsonValue) -> Result<Vec<JsonValue>> {
    match payload {
        JsonValue::Array(items) => Ok(items),
        obj @ JsonValue::Object(_) => Ok(vec![obj]),
        _ => Err(Error::BadRequest("webhook payload must be a JSON object or array".into())),
    }
}

fn parse_sendgrid(payload: JsonValue) -> Result<Vec<ProviderEvent>> {
    as_list(payload)?
        .into_iter()
        .map(|item| {
            let e: SendGridEvent = serde_json::from_value(item)?;
            // bounce events carry `type: blocked` for policy rejections
            let status = e.bounce_type.filter(|t| t.eq_ignore_ascii_case("blocked"));
            let mut ev = ProviderEvent::new(e.event, status);
            ev.recipient = e.email;
            ev.message_id = e.sg_message_id;
            ev.log_id = parse_log_id(e.notification_log_id.as_deref());
            ev.reason = e.reason;
            Ok(ev)
        })
        .collect()
}

fn parse_mailgun(payload: JsonValue) -> Result<Vec<ProviderEvent>> {
    let hook: MailgunWebhook = serde_json::from_value(payload)?;
    let data = hook.event_data;
    let mut ev = ProviderEvent::new(data.event.clone(), data.severity.clone());
    if data
        .event
        .as_deref()
        .map_or(false, |e| e.eq_ignore_ascii_case("failed"))
    {
        let permanent = data
            .severity
            .as_deref()
            .map_or(true, |s| s.eq_ignore_ascii_case("permanent"));
        ev.event = if permanent {
            CanonicalEvent::Bounced
        } else {
            CanonicalEvent::Deferred
        };
    }
    ev.recipient = data.recipient;
    ev.message_id = data.message.and_then(|m| m.headers.message_id);
    ev.log_id = parse_log_id(
        data.user_variables
            .get("notification_log_id")
            .and_then(|v| v.as_str()),
    );
    ev.reason = data.reason.or_else(|| {
        data.delivery_status
            .and_then(|d| d.description.filter(|s| !s.is_empty()).or(d.message))
    });
    Ok(vec![ev])
}

fn parse_ses(payload: JsonValue) -> Result<Vec<ProviderEvent>> {
    let payload = match serde_json::from_value::<SnsEnvelope>(payload.clone()) {
        Ok(SnsEnvelope {
            kind: Some(kind),
            subscribe_url,
            ..
        }) if kind == "SubscriptionConfirmation" => {
            info!(subscribe_url = ?subscribe_url, "SES subscription confirmation received");
            return Ok(Vec::new());
        }
        Ok(SnsEnvelope {
            message: Some(inner),
            ..
        }) => serde_json::from_str(&inner)?,
        _ => payload,
    };
    let n: SesNotification = serde_json::from_value(payload)?;

    let mut ev = ProviderEvent::new(n.notification_type.clone(), None);
    let mut recipient = n.mail.destination.first().cloned();
    if let Some(bounce) = &n.bounce {
        let transient = bounce
            .bounce_type
            .as_deref()
            .map_or(false, |t| t.eq_ignore_ascii_case("transient"));
        ev.event = if transient {
            CanonicalEvent::Deferred
        } else {
            CanonicalEvent::Bounced
        };
        ev.raw_status = bounce.bounce_type.clone();
        if let Some(first) = bounce.bounced_recipients.first() {
            recipient = first.email_address.clone().or(recipient);
            ev.reason = first.diagnostic_code.clone();
        }
        if ev.reason.is_none() {
            ev.reason = bounce.bounce_sub_type.clone();
        }
    }
    if let Some(complaint) = &n.complaint {
        ev.event = CanonicalEvent::SpamComplaint;
        ev.reason = complaint.complaint_feedback_type.clone();
        if let Some(first) = complaint.complained_recipients.first() {
            recipient = first.email_address.clone().or(recipient);
        }
    }
    ev.recipient = recipient;
    ev.message_id = n.mail.message_id;
    ev.log_id = parse_log_id(first_tag(&n.mail.tags, "notification_log_id"));
    Ok(vec![ev])
}

/// SES tags arrive as `{name: [value]}`.
fn first_tag<'a>(tags: &'a Map<String, JsonValue>, name: &str) -> Option<&'a str> {
    match tags.get(name)? {
        JsonValue::Array(values) => values.first().and_then(|v| v.as_str()),
        JsonValue::String(s) => Some(s),
        _ => None,
    }
}

fn parse_generic(payload: JsonValue) -> Result<Vec<ProviderEvent>> {
    as_list(payload)?
        .into_iter()
        .map(|item| {
            let e: GenericEvent = serde_json::from_value(item)?;
            let mut ev = ProviderEvent::new(e.event, e.status);
            ev.recipient = e.to.or(e.email).or(e.recipient);
            ev.message_id = e.message_id;
            ev.log_id = parse_log_id(
                e.log_id
                    .as_deref()
                    .or(e.notification_log_id.as_deref())
                    .or_else(|| e.metadata.get("log_id").and_then(|v| v.as_str())),
            );
            ev.reason = e.reason;
            Ok(ev)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    LogId,
    MessageId,
    Recipient,
}

/// Applies one canonical event to a log, in place. Status changes that the
/// transition table forbids are skipped; the event is recorded regardless.
pub fn apply_event(
    log: &mut NotificationLog,
    event: &ProviderEvent,
    record: JsonValue,
    policy: RetryPolicy,
    now: DateTime<Utc>,
) -> Result<()> {
    let reason = event
        .reason
        .clone()
        .unwrap_or_else(|| "no reason given".to_string());
    match event.event {
        CanonicalEvent::Delivered => {
            if log.status != NotificationStatus::Sent
                && log.status.can_transition_to(NotificationStatus::Sent)
            {
                log.transition(NotificationStatus::Sent, now)?;
            }
        }
        CanonicalEvent::Opened | CanonicalEvent::Clicked => {
            let key = event.event.as_str();
            let engagement = log
                .metadata
                .entry("engagement")
                .or_insert_with(|| JsonValue::Object(Map::new()));
            if let JsonValue::Object(flags) = engagement {
                flags.insert(key.to_string(), JsonValue::Bool(true));
                flags
                    .entry(format!("{}_at", key))
                    .or_insert_with(|| json!(to_rfc3339(now)));
                let count_key = format!("{}_count", key);
                let count = flags.get(&count_key).and_then(|v| v.as_u64()).unwrap_or(0);
                flags.insert(count_key, json!(count + 1));
            }
        }
        e if e.is_permanent_failure() => {
            if log.status != NotificationStatus::Failed
                && log.status.can_transition_to(NotificationStatus::Failed)
            {
                log.transition(NotificationStatus::Failed, now)?;
            }
            log.push_error(format!("{}: {}", e, reason));
        }
        e if e.is_transient_failure() => {
            let settled = !log.status.is_pending() || log.status == NotificationStatus::Retrying;
            if !settled {
                log.record_failure(
                    format!("{}: {}", e, reason),
                    policy.max_retries,
                    policy.base_delay,
                    now,
                )?;
            }
        }
        _ => {}
    }

    match log.metadata.get_mut("webhook_events") {
        Some(JsonValue::Array(items)) => items.push(record),
        _ => {
            log.metadata
                .insert("webhook_events".into(), JsonValue::Array(vec![record]));
        }
    }
    log.updated_at = now;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub secret: Option<String>,
    /// Fall back to the recipient's most recent log when nothing else correlates.
    pub allow_recipient_fallback: bool,
    pub environment: AppEnv,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            secret: None,
            allow_recipient_fallback: true,
            environment: AppEnv::Development,
        }
    }
}

#[derive(Clone)]
pub struct WebhookService {
    repo: Arc<dyn NotificationLogRepository>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    settings: WebhookSettings,
}

impl WebhookService {
    pub fn new(
        repo: Arc<dyn NotificationLogRepository>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        settings: WebhookSettings,
    ) -> Self {
        Self {
            repo,
            policy,
            clock,
            settings,
        }
    }

    /// No secret configured means signatures are not checked at all.
    pub fn is_insecure(&self) -> bool {
        self.settings.secret.is_none()
    }

    pub fn verify_signature(&self, raw: &[u8], signature: Option<&str>) -> Result<()> {
        let Some(secret) = &self.settings.secret else {
            return Ok(());
        };
        let Some(signature) = signature else {
            return Err(Error::Unauthorized("missing_webhook_signature".into()));
        };
        if crypto::verify_signature(secret, raw, signature) {
            Ok(())
        } else {
            Err(Error::Unauthorized("invalid_webhook_signature".into()))
        }
    }

    /// Verifies, then processes. Only a bad signature is reported back; every
    /// other failure is logged and acknowledged so the provider does not retry.
    pub async fn handle(
        &self,
        provider: &str,
        raw: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookAck> {
        self.verify_signature(raw, signature)?;
        if self.is_insecure() && self.settings.environment.is_production() {
            warn!(provider, "Processing unsigned webhook: WEBHOOK_SECRET is not set");
        }
        let processed = match self.process(provider, raw).await {
            Ok(n) => n,
            Err(e) => {
                error!(provider, error = ?e, "Webhook processing failed");
                0
            }
        };
        Ok(WebhookAck {
            success: true,
            processed,
        })
    }

    async fn process(&self, provider: &str, raw: &[u8]) -> Result<usize> {
        let provider: Provider = provider.parse()?;
        let payload: JsonValue = serde_json::from_slice(raw)?;
        let events = provider.parse_events(payload)?;

        let mut applied = 0;
        for event in &events {
            match self.apply(provider, event).await {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => error!(
                    provider = %provider,
                    event = %event.event,
                    error = ?e,
                    "Failed to apply webhook event"
                ),
            }
        }
        Ok(applied)
    }

    async fn apply(&self, provider: Provider, event: &ProviderEvent) -> Result<bool> {
        let Some((log_id, matched_by)) = self.resolve(event).await? else {
            debug!(
                provider = %provider,
                event = %event.event,
                recipient = ?event.recipient,
                "Webhook event matched no notification log"
            );
            return Ok(false);
        };

        let now = self.clock.now();
        let record = json!({
            "event": event.event,
            "provider": provider.as_str(),
            "raw_event": event.raw_event,
            "raw_status": event.raw_status,
            "reason": event.reason,
            "message_id": event.message_id,
            "matched_by": matched_by,
            "received_at": to_rfc3339(now),
        });
        let ev = event.clone();
        let policy = self.policy;
        let log = self
            .repo
            .modify(
                log_id,
                Box::new(move |log, at| apply_event(log, &ev, record, policy, at)),
            )
            .await?;
        info!(
            log_id = %log_id,
            event = %event.event,
            status = %log.status,
            "Webhook event applied"
        );
        Ok(true)
    }

    async fn resolve(&self, event: &ProviderEvent) -> Result<Option<(Uuid, MatchedBy)>> {
        if let Some(id) = event.log_id {
            if self.repo.find_by_id(id).await?.is_some() {
                return Ok(Some((id, MatchedBy::LogId)));
            }
        }
        if let Some(message_id) = &event.message_id {
            for candidate in message_id_candidates(message_id) {
                if let Some(log) = self.repo.find_by_provider_message_id(&candidate).await? {
                    return Ok(Some((log.id, MatchedBy::MessageId)));
                }
            }
        }
        if self.settings.allow_recipient_fallback {
            if let Some(to) = &event.recipient {
                if let Some(log) = self.repo.find_latest_by_recipient(to).await? {
                    warn!(
                        log_id = %log.id,
                        recipient = %to,
                        event = %event.event,
                        "Webhook matched by recipient only; ambiguous under concurrent sends"
                    );
                    return Ok(Some((log.id, MatchedBy::Recipient)));
                }
            }
        }
        Ok(None)
    }
}

/// Provider ids as seen in callbacks vs. at send time: `<id@host>` brackets and
/// SendGrid's `.filter…` suffix are stripped.
fn message_id_candidates(raw: &str) -> Vec<String> {
    let trimmed = raw.trim().trim_start_matches('<').trim_end_matches('>');
    let mut out = vec![trimmed.to_string()];
    if let Some((head, _)) = trimmed.split_once('.') {
        if !head.is_empty() && !trimmed.contains('@') {
            out.push(head.to_string());
        }
    }
    if trimmed != raw {
        out.push(raw.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::notification::NotificationType;
    use crate::models::notification_log::LogPatch;
    use crate::repository::InMemoryLogRepository;
    use crate::utils::time::ManualClock;

    #[test]
    fn delivered_vocabulary() {
        assert_eq!(normalize(Some("delivered"), None), CanonicalEvent::Delivered);
        assert_eq!(normalize(None, Some("Delivered")), CanonicalEvent::Delivered);
        assert_eq!(normalize(Some("send"), Some("success")), CanonicalEvent::Delivered);
        assert_eq!(normalize(Some("Delivery"), None), CanonicalEvent::Delivered);
        assert_eq!(normalize(Some("send"), None), CanonicalEvent::Unknown);
    }

    #[test]
    fn failure_vocabulary() {
        assert_eq!(normalize(Some("bounce"), None), CanonicalEvent::Bounced);
        assert_eq!(normalize(None, Some("bounced")), CanonicalEvent::Bounced);
        assert_eq!(normalize(Some("undelivered"), None), CanonicalEvent::Bounced);
        assert_eq!(normalize(Some("bounce"), Some("blocked")), CanonicalEvent::Bounced);
        assert_eq!(normalize(Some("blocked"), None), CanonicalEvent::Blocked);
        assert_eq!(normalize(Some("spamreport"), None), CanonicalEvent::SpamComplaint);
        assert_eq!(normalize(Some("complained"), None), CanonicalEvent::SpamComplaint);
        assert_eq!(normalize(Some("dropped"), None), CanonicalEvent::Dropped);
        assert_eq!(normalize(Some("deferred"), None), CanonicalEvent::Deferred);
        assert_eq!(normalize(Some("soft_bounce"), None), CanonicalEvent::Deferred);
        assert_eq!(normalize(Some("bounce"), Some("temporary")), CanonicalEvent::Deferred);
        assert_eq!(normalize(Some("hard_bounce"), None), CanonicalEvent::Bounced);
        assert_eq!(normalize(Some("failed"), Some("permanent")), CanonicalEvent::Bounced);
        assert_eq!(normalize(Some("DeliveryDelay"), None), CanonicalEvent::Delayed);
        assert_eq!(normalize(Some("opened"), None), CanonicalEvent::Opened);
        assert_eq!(normalize(Some("click"), None), CanonicalEvent::Clicked);
        assert_eq!(normalize(Some("failed"), None), CanonicalEvent::Bounced);
        assert_eq!(normalize(Some("processed"), None), CanonicalEvent::Unknown);
        assert_eq!(normalize(None, None), CanonicalEvent::Unknown);
    }

    #[test]
    fn mailgun_failed_uses_severity() {
        let payload = json!({
            "event-data": {
                "event": "failed",
                "severity": "temporary",
                "recipient": "ada@example.com",
                "message": { "headers": { "message-id": "abc@mg.example.com" } },
                "user-variables": { "notification_log_id": "00000000-0000-0000-0000-000000000001" }
            }
        });
        let events = Provider::Mailgun.parse_events(payload).unwrap();
        assert_eq!(events[0].event, CanonicalEvent::Deferred);
        assert_eq!(events[0].log_id, Some(Uuid::from_u128(1)));
        assert_eq!(events[0].message_id.as_deref(), Some("abc@mg.example.com"));
    }

    #[test]
    fn ses_bounce_inside_sns_envelope() {
        let inner = json!({
            "notificationType": "Bounce",
            "mail": { "messageId": "ses-1", "destination": ["ada@example.com"] },
            "bounce": {
                "bounceType": "Permanent",
                "bouncedRecipients": [{ "emailAddress": "ada@example.com", "diagnosticCode": "550 user unknown" }]
            }
        });
        let payload = json!({ "Type": "Notification", "Message": inner.to_string() });
        let events = Provider::Ses.parse_events(payload).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, CanonicalEvent::Bounced);
        assert_eq!(events[0].reason.as_deref(), Some("550 user unknown"));
        assert_eq!(events[0].message_id.as_deref(), Some("ses-1"));
    }

    #[test]
    fn sendgrid_batches_parse_each_event() {
        let payload = json!([
            { "email": "a@example.com", "event": "delivered", "sg_message_id": "m1.filter0001" },
            { "email": "b@example.com", "event": "bounce", "type": "blocked", "reason": "policy" }
        ]);
        let events = Provider::SendGrid.parse_events(payload).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, CanonicalEvent::Delivered);
        assert_eq!(events[1].event, CanonicalEvent::Bounced);
        assert_eq!(message_id_candidates("m1.filter0001"), vec!["m1.filter0001", "m1"]);
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        repo: Arc<InMemoryLogRepository>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::default());
            let repo = Arc::new(InMemoryLogRepository::new(clock.clone()));
            Self { clock, repo }
        }

        fn service(&self, settings: WebhookSettings) -> WebhookService {
            WebhookService::new(
                self.repo.clone(),
                RetryPolicy::default(),
                self.clock.clone(),
                settings,
            )
        }

        async fn log(&self, n: u128, status: NotificationStatus) -> NotificationLog {
            let log = NotificationLog::queued(
                Uuid::from_u128(n),
                format!("user{}@example.com", n),
                NotificationType::Welcome,
                json!({}),
                Map::new(),
                self.clock.now(),
            );
            let log = self.repo.create(log).await.unwrap();
            if status != NotificationStatus::Queued {
                self.repo.update_status(log.id, status, None).await.unwrap();
            }
            log
        }
    }

    #[tokio::test]
    async fn bounce_on_sending_log_fails_it_without_spending_retries() {
        let f = Fixture::new();
        let log = f.log(1, NotificationStatus::Sending).await;
        let service = f.service(WebhookSettings::default());

        let body = json!({ "event": "bounce", "log_id": log.id, "reason": "mailbox full" });
        let ack = service
            .handle("generic", body.to_string().as_bytes(), None)
            .await
            .unwrap();
        assert_eq!(ack, WebhookAck { success: true, processed: 1 });

        let stored = f.repo.find_by_id(log.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
        assert_eq!(stored.retry_count, 0);
        assert!(stored.error_log.iter().any(|e| e.contains("bounced") && e.contains("mailbox full")));
        assert_eq!(stored.metadata["webhook_events"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deferred_is_not_double_counted_while_retrying() {
        let f = Fixture::new();
        let log = f.log(1, NotificationStatus::Sending).await;
        let service = f.service(WebhookSettings::default());
        let body = json!({ "event": "deferred", "log_id": log.id }).to_string();

        service.handle("generic", body.as_bytes(), None).await.unwrap();
        let first = f.repo.find_by_id(log.id).await.unwrap().unwrap();
        assert_eq!(first.status, NotificationStatus::Retrying);
        assert_eq!(first.retry_count, 1);

        service.handle("generic", body.as_bytes(), None).await.unwrap();
        let second = f.repo.find_by_id(log.id).await.unwrap().unwrap();
        assert_eq!(second.retry_count, 1);
        assert_eq!(second.metadata["webhook_events"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn engagement_flags_do_not_change_status() {
        let f = Fixture::new();
        let log = f.log(1, NotificationStatus::Sent).await;
        f.repo
            .update(log.id, LogPatch::new().merge("provider_message_id", json!("pm-1")))
            .await
            .unwrap();
        let service = f.service(WebhookSettings::default());

        for event in ["open", "open", "click"] {
            let body = json!({ "event": event, "message_id": "pm-1" }).to_string();
            service.handle("generic", body.as_bytes(), None).await.unwrap();
        }
        let stored = f.repo.find_by_id(log.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Sent);
        assert_eq!(stored.metadata["engagement"]["opened"], json!(true));
        assert_eq!(stored.metadata["engagement"]["opened_count"], json!(2));
        assert_eq!(stored.metadata["engagement"]["clicked"], json!(true));
    }

    #[tokio::test]
    async fn recipient_fallback_can_be_disabled() {
        let f = Fixture::new();
        let log = f.log(1, NotificationStatus::Sending).await;
        let body = json!({ "event": "delivered", "email": log.to }).to_string();

        let strict = f.service(WebhookSettings {
            allow_recipient_fallback: false,
            ..WebhookSettings::default()
        });
        let ack = strict.handle("generic", body.as_bytes(), None).await.unwrap();
        assert_eq!(ack.processed, 0);

        let lenient = f.service(WebhookSettings::default());
        lenient.handle("generic", body.as_bytes(), None).await.unwrap();
        let stored = f.repo.find_by_id(log.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Sent);
        assert_eq!(stored.metadata["webhook_events"][0]["matched_by"], json!("recipient"));
    }

    #[tokio::test]
    async fn signature_is_enforced_when_secret_is_set() {
        let f = Fixture::new();
        let service = f.service(WebhookSettings {
            secret: Some("whsec".into()),
            ..WebhookSettings::default()
        });
        let body = br#"{"event":"delivered"}"#;

        let err = service.handle("generic", body, Some("deadbeef")).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
        assert!(service.handle("generic", body, None).await.is_err());

        let sig = crypto::sign_payload("whsec", body);
        assert!(service.handle("generic", body, Some(&sig)).await.unwrap().success);
    }

    #[tokio::test]
    async fn garbage_is_acknowledged() {
        let f = Fixture::new();
        let service = f.service(WebhookSettings::default());
        let ack = service.handle("generic", b"not json", None).await.unwrap();
        assert!(ack.success);
        let ack = service.handle("carrier-pigeon", b"{}", None).await.unwrap();
        assert!(ack.success);
    }
}
