use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use notification_dispatch::{
    middleware::auth::AuthKeys,
    models::{
        notification::NotificationType,
        notification_log::{LogPatch, NotificationLog, NotificationStatus},
    },
    repository::{InMemoryLogRepository, NotificationLogRepository},
    router,
    services::{
        notification_service::DispatchSettings,
        queue_service::{MemoryQueue, QueueSettings},
        retry_service::{PatternClassifier, RetryPolicy},
        webhook_service::WebhookSettings,
    },
    utils::{
        crypto::sign_payload,
        ids::SequentialIds,
        time::{Clock, ManualClock},
    },
    AppState, Components,
};
use serde_json::{json, Map, Value as JsonValue};
use tower::ServiceExt;
use uuid::Uuid;

const WEBHOOK_SECRET: &str = "whsec_test";

async fn setup_app() -> (Router, Arc<InMemoryLogRepository>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let ids = Arc::new(SequentialIds::default());
    let repo = Arc::new(InMemoryLogRepository::new(clock.clone()));
    let queue = Arc::new(MemoryQueue::new(
        QueueSettings::default(),
        clock.clone(),
        ids.clone(),
    ));
    let components = Components::new(
        repo.clone(),
        queue,
        Arc::new(PatternClassifier::default()),
        RetryPolicy::default(),
        "no-reply@example.com",
        clock.clone(),
        ids,
    );
    let state = AppState::new(
        &components,
        DispatchSettings::default(),
        WebhookSettings {
            secret: Some(WEBHOOK_SECRET.to_string()),
            ..WebhookSettings::default()
        },
        AuthKeys::new("test_secret_key"),
    );
    (router(state), repo, clock)
}

async fn seed(
    repo: &InMemoryLogRepository,
    clock: &ManualClock,
    n: u128,
    status: NotificationStatus,
    message_id: &str,
) -> NotificationLog {
    let log = NotificationLog::queued(
        Uuid::from_u128(n),
        format!("user{}@example.com", n),
        NotificationType::Welcome,
        json!({}),
        Map::new(),
        clock.now(),
    );
    let log = repo.create(log).await.unwrap();
    repo.update(
        log.id,
        LogPatch::new()
            .status(status)
            .merge("provider_message_id", json!(message_id)),
    )
    .await
    .unwrap()
}

async fn post(app: &Router, provider: &str, body: &str, signature: Option<&str>) -> (StatusCode, JsonValue) {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/api/webhooks/{}", provider))
        .header("content-type", "application/json");
    if let Some(sig) = signature {
        builder = builder.header("x-webhook-signature", sig);
    }
    let resp = app
        .clone()
        .oneshot(builder.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(JsonValue::Null))
}

#[tokio::test]
async fn bad_or_missing_signature_is_rejected() {
    let (app, repo, clock) = setup_app().await;
    let log = seed(&repo, &clock, 1, NotificationStatus::Sending, "m-1").await;
    let body = json!({ "event": "delivered", "log_id": log.id }).to_string();

    let (status, _) = post(&app, "generic", &body, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = post(&app, "generic", &body, Some("sha256=00ff")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let stored = repo.find_by_id(log.id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Sending);
}

#[tokio::test]
async fn bounce_for_sending_log_marks_it_failed() {
    let (app, repo, clock) = setup_app().await;
    let log = seed(&repo, &clock, 1, NotificationStatus::Sending, "m-1").await;
    let body = json!({
        "event": "bounce",
        "log_id": log.id,
        "reason": "550 5.1.1 mailbox does not exist"
    })
    .to_string();

    let (status, ack) = post(&app, "generic", &body, Some(&sign_payload(WEBHOOK_SECRET, body.as_bytes()))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack, json!({ "success": true, "processed": 1 }));

    let stored = repo.find_by_id(log.id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Failed);
    assert_eq!(stored.retry_count, log.retry_count);
    assert!(stored
        .error_log
        .iter()
        .any(|e| e.contains("mailbox does not exist")));
}

#[tokio::test]
async fn sendgrid_batch_is_correlated_by_message_id() {
    let (app, repo, clock) = setup_app().await;
    let a = seed(&repo, &clock, 1, NotificationStatus::Sending, "sg-a").await;
    let b = seed(&repo, &clock, 2, NotificationStatus::Sent, "sg-b").await;
    let body = json!([
        { "email": a.to, "event": "delivered", "sg_message_id": "sg-a.filter001" },
        { "email": b.to, "event": "open", "sg_message_id": "sg-b.filter002" },
        { "email": "nobody@example.com", "event": "processed" }
    ])
    .to_string();

    let (status, ack) = post(&app, "sendgrid", &body, Some(&sign_payload(WEBHOOK_SECRET, body.as_bytes()))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["processed"], json!(2));

    let a = repo.find_by_id(a.id).await.unwrap().unwrap();
    assert_eq!(a.status, NotificationStatus::Sent);
    assert!(a.sent_at.is_some());
    let b = repo.find_by_id(b.id).await.unwrap().unwrap();
    assert_eq!(b.status, NotificationStatus::Sent);
    assert_eq!(b.metadata["engagement"]["opened"], json!(true));
}

#[tokio::test]
async fn late_bounce_after_sent_is_recorded() {
    let (app, repo, clock) = setup_app().await;
    let log = seed(&repo, &clock, 1, NotificationStatus::Sent, "ses-1").await;
    let inner = json!({
        "notificationType": "Bounce",
        "mail": { "messageId": "ses-1", "destination": [log.to] },
        "bounce": { "bounceType": "Permanent", "bouncedRecipients": [{ "emailAddress": log.to }] }
    });
    let body = json!({ "Type": "Notification", "Message": inner.to_string() }).to_string();

    let (status, _) = post(&app, "ses", &body, Some(&sign_payload(WEBHOOK_SECRET, body.as_bytes()))).await;
    assert_eq!(status, StatusCode::OK);
    let stored = repo.find_by_id(log.id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Failed);
}

#[tokio::test]
async fn malformed_payload_is_still_acknowledged() {
    let (app, _, _) = setup_app().await;
    let body = "{not json";
    let (status, ack) = post(&app, "mailgun", body, Some(&sign_payload(WEBHOOK_SECRET, body.as_bytes()))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["success"], json!(true));
    assert_eq!(ack["processed"], json!(0));
}
