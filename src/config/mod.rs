use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// API bind address (e.g., "0.0.0.0:3000"). Unused by the worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the admission queue
    pub redis_url: String,

    /// AES-256-GCM key for stored bot tokens (base64-encoded, 32 bytes)
    pub encryption_key: String,

    /// Telegram Bot API base URL
    #[serde(default = "default_telegram_api_base")]
    pub telegram_api_base: String,

    /// Global ping budget shared by every job; also the ETA divisor
    #[serde(default = "default_ping_rate")]
    pub ping_rate_per_second: u32,

    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,

    /// Attempts per record before transient failures become OTHER_ERROR
    #[serde(default = "default_max_ping_attempts")]
    pub max_ping_attempts: u32,

    #[serde(default = "default_max_retry_after_secs")]
    pub max_retry_after_secs: u64,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_admission_poll_interval_ms")]
    pub admission_poll_interval_ms: u64,

    /// Prometheus listener of the worker process
    #[serde(default = "default_worker_metrics_addr")]
    pub worker_metrics_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_ping_rate() -> u32 {
    15
}

fn default_ping_timeout_secs() -> u64 {
    10
}

fn default_max_ping_attempts() -> u32 {
    3
}

fn default_max_retry_after_secs() -> u64 {
    30
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_admission_poll_interval_ms() -> u64 {
    1000
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
