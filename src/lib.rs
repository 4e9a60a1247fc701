pub mod config;
pub mod database;
pub mod dto;
pub mod error;
pub mod middleware;
pub mod models;
pub mod repository;
pub mod routes;
pub mod services;
pub mod transport;
pub mod utils;

use std::sync::Arc;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post},
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;

use crate::middleware::auth::{require_admin, require_bearer_auth, AuthKeys};
use crate::repository::NotificationLogRepository;
use crate::services::{
    delivery_service::DeliveryProcessor,
    history_service::HistoryService,
    notification_service::{DispatchSettings, NotificationService},
    queue_service::DeliveryQueue,
    retry_service::{ErrorClassifier, RetryEngine, RetryPolicy},
    template_service::TemplateRenderer,
    webhook_service::{WebhookService, WebhookSettings},
};
use crate::transport::MailTransport;
use crate::utils::{ids::IdGenerator, time::Clock};

const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Shared collaborators every service is built from.
#[derive(Clone)]
pub struct Components {
    pub repo: Arc<dyn NotificationLogRepository>,
    pub queue: Arc<dyn DeliveryQueue>,
    pub renderer: Arc<TemplateRenderer>,
    pub retry: RetryEngine,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
}

impl Components {
    pub fn new(
        repo: Arc<dyn NotificationLogRepository>,
        queue: Arc<dyn DeliveryQueue>,
        classifier: Arc<dyn ErrorClassifier>,
        policy: RetryPolicy,
        default_from: &str,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let renderer = Arc::new(TemplateRenderer::with_defaults());
        let retry = RetryEngine::new(
            repo.clone(),
            queue.clone(),
            renderer.clone(),
            classifier,
            policy,
            default_from,
        )
        .with_ids(ids.clone());
        Self {
            repo,
            queue,
            renderer,
            retry,
            clock,
            ids,
        }
    }

    pub fn delivery_processor(&self, transport: Arc<dyn MailTransport>) -> DeliveryProcessor {
        DeliveryProcessor::new(
            self.repo.clone(),
            transport,
            self.retry.clone(),
            self.clock.clone(),
        )
    }
}

#[derive(Clone)]
pub struct AppState {
    pub notification_service: NotificationService,
    pub history_service: HistoryService,
    pub webhook_service: WebhookService,
    pub queue: Arc<dyn DeliveryQueue>,
    pub auth: AuthKeys,
}

impl AppState {
    pub fn new(
        components: &Components,
        dispatch: DispatchSettings,
        webhook: WebhookSettings,
        auth: AuthKeys,
    ) -> Self {
        let c = components;
        let notification_service = NotificationService::new(
            c.repo.clone(),
            c.queue.clone(),
            c.renderer.clone(),
            c.retry.clone(),
            c.clock.clone(),
            c.ids.clone(),
            dispatch,
        );
        let history_service = HistoryService::new(c.repo.clone(), c.clock.clone());
        let webhook_service =
            WebhookService::new(c.repo.clone(), c.retry.policy(), c.clock.clone(), webhook);

        Self {
            notification_service,
            history_service,
            webhook_service,
            queue: c.queue.clone(),
            auth,
        }
    }
}

pub fn router(state: AppState) -> Router {
    use crate::routes::{health, notifications, queue, webhook};

    let admin = || from_fn(require_admin);

    let api = Router::new()
        .route("/api/notifications", post(notifications::dispatch))
        .route(
            "/api/notifications/jobs/:job_id",
            get(notifications::get_job_status),
        )
        .route("/api/notifications/logs", get(notifications::list_logs))
        .route(
            "/api/notifications/logs/:id",
            get(notifications::get_log)
                .merge(delete(notifications::delete_log).route_layer(admin())),
        )
        .route(
            "/api/notifications/logs/:id/retry",
            post(notifications::retry_log),
        )
        .route(
            "/api/notifications/logs/:id/cancel",
            post(notifications::cancel_log),
        )
        .route("/api/notifications/logs/retry", post(notifications::retry_bulk))
        .route(
            "/api/notifications/logs/cleanup",
            post(notifications::cleanup).route_layer(admin()),
        )
        .route("/api/notifications/stats", get(notifications::stats))
        .route("/api/notifications/queue/metrics", get(queue::metrics))
        .route(
            "/api/notifications/queue/retry-failed",
            post(queue::retry_failed),
        )
        .route(
            "/api/notifications/queue/clean",
            post(queue::clean).route_layer(admin()),
        )
        .route_layer(from_fn_with_state(state.auth.clone(), require_bearer_auth));

    let public = Router::new()
        .route("/health", get(health::health))
        .route("/api/webhooks/:provider", post(webhook::handle_provider_event));

    public
        .merge(api)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}
