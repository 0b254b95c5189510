use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::models::audience::{AudienceRecord, NewAudienceRecord, OutcomeUpdate};
use crate::models::job::{Completion, RecordOutcome, VerificationJob};
use crate::models::verification::{LocaleStats, StatusSnapshot};
use crate::models::{BotId, UserId};

pub mod memory;
pub mod queries;

pub use memory::MemoryStore;
pub use queries::PgProgressStore;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Durable per-bot cursor, counters and audience statuses.
///
/// Every mutation a job makes for one record goes through
/// [`ProgressStore::record_outcome`], which must apply the record status, the
/// counter and the cursor as one atomic unit. Read methods never block on the
/// rate limiter.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Insert PENDING rows, skipping `user_id`s the bot already has.
    /// Returns the number of rows actually inserted.
    async fn insert_audience(
        &self,
        bot_id: BotId,
        records: &[NewAudienceRecord],
    ) -> Result<u64, StoreError>;

    /// Create, resume or restart the bot's job and return it in RUNNING state.
    async fn start_job(&self, bot_id: BotId) -> Result<VerificationJob, StoreError>;

    async fn get_job(&self, bot_id: BotId) -> Result<Option<VerificationJob>, StoreError>;

    /// RUNNING jobs of bots that have not been deleted.
    async fn running_jobs(&self) -> Result<Vec<VerificationJob>, StoreError>;

    /// First PENDING record with `user_id > after`, in ascending `user_id` order.
    async fn next_pending(
        &self,
        bot_id: BotId,
        after: Option<UserId>,
    ) -> Result<Option<AudienceRecord>, StoreError>;

    /// Atomically persist one classification and advance the cursor.
    async fn record_outcome(
        &self,
        bot_id: BotId,
        update: &OutcomeUpdate,
    ) -> Result<RecordOutcome, StoreError>;

    /// Close the current pass once no PENDING record follows the cursor.
    async fn complete_job(&self, bot_id: BotId) -> Result<Completion, StoreError>;

    /// Mark a RUNNING job FAILED with a reason.
    async fn fail_job(&self, bot_id: BotId, reason: &str) -> Result<(), StoreError>;

    async fn pending_count(&self, bot_id: BotId) -> Result<i64, StoreError>;

    async fn locale_breakdown(&self, bot_id: BotId) -> Result<Vec<LocaleStats>, StoreError>;

    /// Job, pending count and locale breakdown from one consistent read.
    /// `None` when the bot has never had a job.
    async fn status_snapshot(&self, bot_id: BotId) -> Result<Option<StatusSnapshot>, StoreError>;

    /// Encrypted bot token, or `None` when the bot is unknown or deleted.
    async fn bot_token(&self, bot_id: BotId) -> Result<Option<String>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Bot {0} does not exist or was deleted")]
    UnknownBot(BotId),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
