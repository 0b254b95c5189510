use audience_verify::{
    app_state::AppState,
    config::AppConfig,
    db::{self, PgProgressStore},
    routes,
    services::queue::AdmissionQueue,
};
use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
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

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing audience-verify API server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!(
        "audience_records_ingested_total",
        "Audience records registered as PENDING"
    );

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Connecting to Redis admission queue");
    let queue = AdmissionQueue::new(&config.redis_url).expect("Failed to initialize admission queue");

    let state = AppState::new(
        Arc::new(PgProgressStore::new(db_pool)),
        queue,
        f64::from(config.ping_rate_per_second),
    );

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route(
            "/api/v1/bots/{bot_id}/audience",
            post(routes::audience::ingest_audience),
        )
        .route(
            "/api/v1/bots/{bot_id}/verification/status",
            get(routes::verify::get_verification_status),
        )
        .route(
            "/api/v1/bots/{bot_id}/verification/start",
            post(routes::verify::start_verification),
        )
        .route(
            "/api/v1/bots/{bot_id}/verification/cancel",
            post(routes::verify::cancel_verification),
        )
        .with_state(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(16 * 1024 * 1024));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
