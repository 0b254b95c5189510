use audience_verify::{
    config::AppConfig,
    db::{self, PgProgressStore},
    services::{
        encryption::{EncryptedCredentials, EncryptionService},
        job::{JobSettings, PipelineContext},
        queue::{AdmissionAction, AdmissionQueue, AdmissionRequest},
        rate_limiter::RateLimiter,
        scheduler::{Admission, Scheduler},
        telegram::TelegramClient,
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting audience verification worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let metrics_addr: SocketAddr = config
        .worker_metrics_addr
        .parse()
        .expect("Invalid WORKER_METRICS_ADDR");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");
    describe_metrics();

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");
    let store = Arc::new(PgProgressStore::new(db_pool));

    tracing::info!("Initializing services");
    let encryption =
        EncryptionService::new(&config.encryption_key).expect("Failed to initialize encryption");
    let credentials = EncryptedCredentials::new(store.clone(), Arc::new(encryption));

    let pinger = TelegramClient::new(
        &config.telegram_api_base,
        Duration::from_secs(config.ping_timeout_secs),
    )
    .expect("Failed to initialize Bot API client");

    let queue = AdmissionQueue::new(&config.redis_url).expect("Failed to initialize admission queue");

    let ctx = PipelineContext {
        store,
        pinger: Arc::new(pinger),
        limiter: Arc::new(RateLimiter::per_second(config.ping_rate_per_second)),
        credentials: Arc::new(credentials),
        settings: JobSettings {
            max_attempts: config.max_ping_attempts,
            max_retry_after: Duration::from_secs(config.max_retry_after_secs),
        },
    };
    let scheduler = Scheduler::start(ctx, config.worker_concurrency);

    match queue.recover_in_flight().await {
        Ok(0) => {}
        Ok(moved) => tracing::info!(moved, "Recovered in-flight admission signals"),
        Err(e) => tracing::error!(error = %e, "Failed to recover in-flight admission signals"),
    }
    if let Err(e) = scheduler.resume_incomplete().await {
        tracing::error!(error = %e, "Failed to resume incomplete jobs");
    }

    tracing::info!(
        rate = config.ping_rate_per_second,
        concurrency = config.worker_concurrency,
        "Worker ready, polling admission queue"
    );

    let poll_interval = Duration::from_millis(config.admission_poll_interval_ms);
    tokio::select! {
        _ = admission_loop(&queue, &scheduler, poll_interval) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    scheduler.shutdown().await;
    tracing::info!("Worker stopped");
}

async fn admission_loop(queue: &AdmissionQueue, scheduler: &Scheduler, poll_interval: Duration) {
    loop {
        match process_next_signal(queue, scheduler).await {
            Ok(true) => {
                tracing::debug!("Signal processed, checking for next signal");
            }
            Ok(false) => {
                tracing::trace!("No signals available, sleeping");
                if let Ok(depth) = queue.queue_depth().await {
                    metrics::gauge!("verification_admission_queue_depth").set(depth as f64);
                }
                sleep(poll_interval).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Error processing admission signal, will retry");
                sleep(poll_interval).await;
            }
        }
    }
}

/// Apply the next start/cancel signal.
/// Returns Ok(true) if a signal was handled, Ok(false) if the queue was empty.
async fn process_next_signal(
    queue: &AdmissionQueue,
    scheduler: &Scheduler,
) -> Result<bool, Box<dyn std::error::Error>> {
    let request: AdmissionRequest = match queue.dequeue().await? {
        Some(request) => request,
        None => return Ok(false),
    };

    let bot_id = request.bot_id;
    match request.action {
        AdmissionAction::Start => match scheduler.admit(bot_id).await {
            Admission::Failed(reason) => {
                tracing::warn!(bot_id, reason = %reason, "Job failed before starting");
            }
            admission => {
                tracing::info!(bot_id, ?admission, "Start signal handled");
            }
        },
        AdmissionAction::Cancel => {
            let was_active = scheduler.cancel(bot_id);
            tracing::info!(bot_id, was_active, "Cancel signal handled");
        }
    }

    queue.complete(&request).await?;
    Ok(true)
}

fn describe_metrics() {
    metrics::describe_counter!(
        "verification_pings_total",
        "Reachability pings sent, by classification"
    );
    metrics::describe_counter!(
        "verification_records_total",
        "Audience records persisted with a terminal status"
    );
    metrics::describe_counter!(
        "verification_jobs_started_total",
        "Verification jobs admitted to the worker pool"
    );
    metrics::describe_counter!(
        "verification_jobs_completed_total",
        "Verification jobs that verified every record"
    );
    metrics::describe_counter!(
        "verification_jobs_failed_total",
        "Verification jobs stopped by an unrecoverable error"
    );
    metrics::describe_counter!(
        "verification_persist_failures_total",
        "Progress store writes that failed and left a record pending"
    );
    metrics::describe_gauge!(
        "verification_active_jobs",
        "Jobs currently interleaved by the worker pool"
    );
    metrics::describe_gauge!(
        "verification_admission_queue_depth",
        "Start/cancel signals waiting for the worker"
    );
    metrics::describe_histogram!(
        "verification_ping_seconds",
        "Latency of one Bot API reachability call"
    );
}
