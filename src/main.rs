use std::net::SocketAddr;
use std::sync::Arc;

use notification_dispatch::{
    config::{get_config, init_config, Config, LogFormat},
    database::pool::create_pool,
    middleware::auth::AuthKeys,
    repository::{InMemoryLogRepository, NotificationLogRepository, PgLogRepository},
    router,
    services::{
        maintenance_service::MaintenanceService,
        pg_queue_service::PgDeliveryQueue,
        queue_service::{join_workers, spawn_workers, DegradingQueue, DeliveryQueue, MemoryQueue, WorkerQueue},
        retry_service::PatternClassifier,
    },
    transport::{HttpRelayTransport, LogTransport, MailTransport},
    utils::{
        ids::{IdGenerator, UuidGenerator},
        time::{Clock, SystemClock},
    },
    AppState, Components,
};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio_cron_scheduler::{Job, JobScheduler};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn build_repository(
    config: &Config,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<(Arc<dyn NotificationLogRepository>, Option<PgPool>)> {
    match &config.database_url {
        Some(url) => {
            let pool = create_pool(url).await?;
            let repo = PgLogRepository::new(pool.clone(), clock);
            repo.migrate().await?;
            info!("Using PostgreSQL notification log store");
            Ok((Arc::new(repo), Some(pool)))
        }
        None => {
            warn!("DATABASE_URL not set; notification logs are kept in memory only");
            Ok((Arc::new(InMemoryLogRepository::new(clock)), None))
        }
    }
}

/// Durable queue when a database is configured, in-process otherwise. Outside
/// production an unreachable queue degrades to log-only instead of failing dispatch.
async fn build_queue(
    config: &Config,
    pool: Option<PgPool>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
) -> anyhow::Result<(Arc<dyn DeliveryQueue>, Arc<dyn WorkerQueue>)> {
    let (queue, workers): (Arc<dyn DeliveryQueue>, Arc<dyn WorkerQueue>) = match pool {
        Some(pool) => {
            let pg = Arc::new(PgDeliveryQueue::new(pool, config.queue_settings(), clock, ids.clone()));
            let recovered = pg.recover_stalled().await?;
            info!(recovered, "Using PostgreSQL delivery queue");
            (pg.clone() as Arc<dyn DeliveryQueue>, pg as Arc<dyn WorkerQueue>)
        }
        None => {
            warn!("DATABASE_URL not set; queued jobs are lost on restart");
            let memory = Arc::new(MemoryQueue::new(config.queue_settings(), clock, ids.clone()));
            (memory.clone() as Arc<dyn DeliveryQueue>, memory as Arc<dyn WorkerQueue>)
        }
    };
    let queue: Arc<dyn DeliveryQueue> = if config.app_env.is_production() {
        queue
    } else {
        Arc::new(DegradingQueue::new(queue, ids))
    };
    Ok((queue, workers))
}

fn build_transport(
    config: &Config,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
) -> anyhow::Result<Arc<dyn MailTransport>> {
    match &config.mail_relay_url {
        Some(url) => {
            info!(relay = %url, "Delivering through HTTP mail relay");
            Ok(Arc::new(HttpRelayTransport::new(
                url.clone(),
                config.mail_relay_secret.clone(),
                clock,
            )?))
        }
        None => {
            warn!("MAIL_RELAY_URL not set; messages are logged, not sent");
            Ok(Arc::new(LogTransport::new(clock, ids)))
        }
    }
}

async fn start_maintenance(config: &Config, service: MaintenanceService) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;
    let job = Job::new_async(config.maintenance_cron.as_str(), move |_id, _scheduler| {
        let service = service.clone();
        Box::pin(async move {
            if let Err(e) = service.run_once().await {
                error!(error = ?e, "Maintenance run failed");
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;
    info!(cron = %config.maintenance_cron, "Maintenance scheduler started");
    Ok(scheduler)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = ?e, "Could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_config()?;
    let config = get_config()?;
    init_tracing(config.log_format);
    info!(env = %config.app_env, "Starting notification dispatch service");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ids: Arc<dyn IdGenerator> = Arc::new(UuidGenerator);

    let (repo, pool) = build_repository(config, clock.clone()).await?;
    let transport = build_transport(config, clock.clone(), ids.clone())?;
    let (queue, worker_queue) = build_queue(config, pool, clock.clone(), ids.clone()).await?;

    let classifier = Arc::new(PatternClassifier::with_extra(&config.permanent_error_patterns)?);
    let components = Components::new(
        repo.clone(),
        queue.clone(),
        classifier,
        config.retry_policy(),
        &config.mail_from,
        clock.clone(),
        ids.clone(),
    );

    let workers = spawn_workers(
        worker_queue.clone(),
        Arc::new(components.delivery_processor(transport)),
    );

    let maintenance = MaintenanceService::new(
        repo.clone(),
        Some(worker_queue.clone()),
        clock.clone(),
        config.log_retention_days,
    );
    let mut scheduler = start_maintenance(config, maintenance).await?;

    let state = AppState::new(
        &components,
        config.dispatch_settings(),
        config.webhook_settings(),
        AuthKeys::new(&config.jwt_secret),
    );
    if state.webhook_service.is_insecure() {
        if config.app_env.is_production() {
            warn!("WEBHOOK_SECRET is not set: provider webhooks are accepted WITHOUT signature verification");
        } else {
            info!("WEBHOOK_SECRET is not set; webhook signatures are not checked");
        }
    }

    let app = router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.server_address.parse()?;
    info!("Server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    queue.close().await;
    let panicked = join_workers(workers).await;
    if panicked > 0 {
        error!(panicked, "Delivery workers did not shut down cleanly");
    }
    scheduler.shutdown().await?;
    info!("Notification dispatch service stopped");
    Ok(())
}
