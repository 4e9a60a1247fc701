use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use notification_dispatch::{
    models::{
        notification::NotificationType,
        notification_log::{LogPatch, NotificationLog, NotificationStatus},
    },
    repository::{InMemoryLogRepository, NotificationLogRepository},
    utils::time::{Clock, ManualClock},
};
use serde_json::{json, Map};
use uuid::Uuid;

fn store() -> (Arc<ManualClock>, Arc<InMemoryLogRepository>) {
    let clock = Arc::new(ManualClock::default());
    let repo = Arc::new(InMemoryLogRepository::new(clock.clone()));
    (clock, repo)
}

fn log(n: u128, clock: &ManualClock) -> NotificationLog {
    NotificationLog::queued(
        Uuid::from_u128(n),
        format!("user{}@example.com", n),
        NotificationType::PasswordReset,
        json!({}),
        Map::new(),
        clock.now(),
    )
}

#[tokio::test]
async fn retry_budget_caps_at_one_past_max() {
    let (clock, repo) = store();
    let id = repo.create(log(1, &clock)).await.unwrap().id;
    let base = Duration::from_secs(60);

    for k in 1..=3u32 {
        let now = clock.now();
        let updated = repo
            .record_failed_attempt(id, format!("attempt {}", k), 3, base)
            .await
            .unwrap();
        assert_eq!(updated.status, NotificationStatus::Retrying);
        assert_eq!(updated.retry_count, k);
        let expected = now + ChronoDuration::seconds(60 * 2i64.pow(k - 1));
        assert_eq!(updated.next_retry_at, Some(expected));
    }

    let last = repo
        .record_failed_attempt(id, "attempt 4".into(), 3, base)
        .await
        .unwrap();
    assert_eq!(last.status, NotificationStatus::Failed);
    assert_eq!(last.retry_count, 4);
    assert_eq!(last.next_retry_at, None);

    let again = repo
        .record_failed_attempt(id, "attempt 5".into(), 3, base)
        .await
        .unwrap();
    assert_eq!(again.retry_count, 4);
    assert_eq!(again.error_log.len(), 5);
}

#[tokio::test]
async fn failed_for_retry_skips_future_and_orders_by_starvation() {
    let (clock, repo) = store();
    for (n, retries, next_in) in [(1, 2, None), (2, 0, Some(3600)), (3, 0, None), (4, 1, Some(-5))] {
        let mut l = log(n, &clock);
        l.status = NotificationStatus::Failed;
        l.retry_count = retries;
        l.next_retry_at = next_in.map(|s| clock.now() + ChronoDuration::seconds(s));
        repo.create(l).await.unwrap();
        clock.advance(ChronoDuration::seconds(1));
    }

    let due = repo.find_failed_for_retry(10).await.unwrap();
    let ids: Vec<u128> = due.iter().map(|l| l.id.as_u128()).collect();
    assert_eq!(ids, vec![3, 4, 1]);
    assert!(due
        .iter()
        .all(|l| l.next_retry_at.map_or(true, |at| at <= clock.now())));

    assert_eq!(repo.find_failed_for_retry(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_metadata_appends_are_not_lost() {
    let (clock, repo) = store();
    let id = repo.create(log(1, &clock)).await.unwrap().id;

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..50 {
        let repo = repo.clone();
        tasks.spawn(async move {
            repo.update(
                id,
                LogPatch::new()
                    .append("webhook_events", json!({ "n": i }))
                    .merge(format!("key_{}", i), json!(i)),
            )
            .await
        });
    }
    while let Some(res) = tasks.join_next().await {
        res.unwrap().unwrap();
    }

    let stored = repo.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.metadata["webhook_events"].as_array().unwrap().len(), 50);
    assert_eq!(stored.metadata.len(), 51);
}

#[tokio::test]
async fn sent_logs_cannot_be_canceled_or_requeued() {
    let (clock, repo) = store();
    let id = repo.create(log(1, &clock)).await.unwrap().id;
    repo.mark_as_sent(id).await.unwrap();
    let first = repo.find_by_id(id).await.unwrap().unwrap().sent_at;

    clock.advance(ChronoDuration::minutes(5));
    let again = repo.mark_as_sent(id).await.unwrap();
    assert_eq!(again.sent_at, first);

    let err = repo
        .update_status(id, NotificationStatus::Canceled, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("sent -> canceled"));
    let err = repo
        .update_status(id, NotificationStatus::Queued, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Invalid state transition"));
}
