//! One bot's verification run, advanced one audience record at a time.
//!
//! A [`JobRunner`] holds only what can be rebuilt from the progress store
//! (cursor) plus the bot credential. Each [`JobRunner::step`] selects the
//! next PENDING record after the cursor, pings it under the shared rate
//! limiter, classifies the result and persists record, counter and cursor
//! in a single store call.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use crate::db::{ProgressStore, StoreError};
use crate::models::audience::{Outcome, OutcomeUpdate};
use crate::models::job::{Completion, JobState, RecordOutcome};
use crate::models::{BotId, UserId};
use crate::services::classifier::{classify, outcome_after_retries, Classification};
use crate::services::encryption::{CredentialError, CredentialSource};
use crate::services::rate_limiter::RateLimiter;
use crate::services::telegram::PingClient;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct JobSettings {
    /// Ping attempts per record, first try included.
    pub max_attempts: u32,
    /// Upper bound on a server-requested back-off before a retry.
    pub max_retry_after: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self { max_attempts: DEFAULT_MAX_ATTEMPTS, max_retry_after: DEFAULT_MAX_RETRY_AFTER }
    }
}

/// Collaborators every job draws on. Cloning shares them.
#[derive(Clone)]
pub struct PipelineContext {
    pub store: Arc<dyn ProgressStore>,
    pub pinger: Arc<dyn PingClient>,
    pub limiter: Arc<RateLimiter>,
    pub credentials: Arc<dyn CredentialSource>,
    pub settings: JobSettings,
}

/// What a single step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Verified { user_id: UserId, outcome: Outcome },
    /// Nothing persisted this turn (lost a race, or new work appeared).
    Skipped,
    /// A fresh pass started from the lowest PENDING record.
    Restarted,
    Completed,
    /// The job is no longer RUNNING in the store.
    Stopped,
}

/// Result of setting a job up before its first ping.
pub enum Preparation {
    Ready(JobRunner),
    NotRunning,
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Credential rejected for bot {bot_id}: {reason}")]
    CredentialRejected { bot_id: BotId, reason: String },

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("Progress store error: {0}")]
    Store(#[from] StoreError),
}

impl JobError {
    /// Errors after which the job must be marked FAILED instead of retried.
    pub fn is_unrecoverable(&self) -> bool {
        match self {
            JobError::CredentialRejected { .. } => true,
            JobError::Credential(e) => !e.is_transient(),
            JobError::Store(_) => false,
        }
    }
}

pub struct JobRunner {
    bot_id: BotId,
    token: String,
    cursor: Option<UserId>,
}

impl JobRunner {
    /// Load a RUNNING job and validate its credential.
    ///
    /// Unrecoverable credential problems mark the job FAILED here, before any
    /// ping is sent.
    pub async fn prepare(ctx: &PipelineContext, bot_id: BotId) -> Result<Preparation, JobError> {
        let job = match ctx.store.get_job(bot_id).await? {
            Some(job) if job.state == JobState::Running => job,
            _ => return Ok(Preparation::NotRunning),
        };

        let token = match ctx.credentials.credential(bot_id).await {
            Ok(token) => token,
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
                let reason = e.to_string();
                mark_failed(ctx, bot_id, &reason).await?;
                return Ok(Preparation::Failed(reason));
            }
        };

        if let Err(failure) = ctx.pinger.check_credential(&token).await {
            match classify(&Err(failure.clone())) {
                Classification::Transient { .. } => {
                    tracing::warn!(
                        bot_id,
                        error = %failure,
                        "Credential check inconclusive, starting anyway"
                    );
                }
                _ => {
                    let reason = format!("credential rejected: {failure}");
                    mark_failed(ctx, bot_id, &reason).await?;
                    return Ok(Preparation::Failed(reason));
                }
            }
        }

        tracing::info!(
            bot_id,
            cursor = ?job.cursor,
            total = job.total,
            verified = job.counters.sum(),
            "Verification job ready"
        );

        Ok(Preparation::Ready(Self { bot_id, token, cursor: job.cursor }))
    }

    pub fn bot_id(&self) -> BotId {
        self.bot_id
    }

    pub fn cursor(&self) -> Option<UserId> {
        self.cursor
    }

    /// Process at most one audience record.
    pub async fn step(&mut self, ctx: &PipelineContext) -> Result<Step, JobError> {
        let Some(record) = ctx.store.next_pending(self.bot_id, self.cursor).await? else {
            return self.close_pass(ctx).await;
        };

        let (outcome, attempts) = self.verify(ctx, record.user_id).await?;
        let update = OutcomeUpdate {
            user_id: record.user_id,
            outcome,
            attempts: attempts as i32,
            attempted_at: Utc::now(),
        };

        match ctx.store.record_outcome(self.bot_id, &update).await {
            Ok(RecordOutcome::Applied(job)) => {
                debug_assert!(job.cursor >= self.cursor);
                self.cursor = job.cursor;
                metrics::counter!("verification_records_total", "status" => outcome.to_string())
                    .increment(1);
                tracing::debug!(
                    bot_id = self.bot_id,
                    user_id = record.user_id,
                    outcome = %outcome,
                    attempts,
                    "Record verified"
                );
                Ok(Step::Verified { user_id: record.user_id, outcome })
            }
            Ok(RecordOutcome::Duplicate) => {
                tracing::warn!(
                    bot_id = self.bot_id,
                    user_id = record.user_id,
                    "Record already classified, skipping"
                );
                self.cursor = ctx.store.get_job(self.bot_id).await?.and_then(|job| job.cursor);
                Ok(Step::Skipped)
            }
            Ok(RecordOutcome::Inactive) => Ok(Step::Stopped),
            Err(e) => {
                metrics::counter!("verification_persist_failures_total").increment(1);
                Err(e.into())
            }
        }
    }

    /// Ping with bounded retries for transient failures. Every attempt waits
    /// on the rate limiter.
    async fn verify(&self, ctx: &PipelineContext, user_id: UserId) -> Result<(Outcome, u32), JobError> {
        let max_attempts = ctx.settings.max_attempts.max(1);
        let mut attempts = 0;

        loop {
            ctx.limiter.acquire().await;
            attempts += 1;

            let started = Instant::now();
            let result = ctx.pinger.ping(&self.token, user_id).await;
            metrics::histogram!("verification_ping_seconds").record(started.elapsed().as_secs_f64());

            match classify(&result) {
                Classification::Terminal(outcome) => {
                    metrics::counter!("verification_pings_total", "result" => outcome.to_string())
                        .increment(1);
                    return Ok((outcome, attempts));
                }
                Classification::CredentialRejected(reason) => {
                    return Err(JobError::CredentialRejected { bot_id: self.bot_id, reason });
                }
                Classification::Transient { retry_after } => {
                    metrics::counter!("verification_pings_total", "result" => "TRANSIENT")
                        .increment(1);

                    if attempts >= max_attempts {
                        tracing::warn!(
                            bot_id = self.bot_id,
                            user_id,
                            attempts,
                            "Transient ping failures exhausted retries"
                        );
                        return Ok((outcome_after_retries(&result), attempts));
                    }

                    tracing::debug!(
                        bot_id = self.bot_id,
                        user_id,
                        attempt = attempts,
                        retry_after_secs = retry_after.map(|d| d.as_secs()),
                        "Transient ping failure, retrying"
                    );
                    if let Some(delay) = retry_after {
                        sleep(delay.min(ctx.settings.max_retry_after)).await;
                    }
                }
            }
        }
    }

    async fn close_pass(&mut self, ctx: &PipelineContext) -> Result<Step, JobError> {
        match ctx.store.complete_job(self.bot_id).await? {
            Completion::Completed => {
                metrics::counter!("verification_jobs_completed_total").increment(1);
                tracing::info!(bot_id = self.bot_id, "Verification job completed");
                Ok(Step::Completed)
            }
            Completion::Restarted => {
                tracing::info!(
                    bot_id = self.bot_id,
                    previous_cursor = ?self.cursor,
                    "Records added behind the cursor, starting a new pass"
                );
                self.cursor = None;
                Ok(Step::Restarted)
            }
            Completion::MoreWork => Ok(Step::Skipped),
            Completion::Inactive => Ok(Step::Stopped),
        }
    }
}

/// Mark a job FAILED and count it.
pub async fn mark_failed(ctx: &PipelineContext, bot_id: BotId, reason: &str) -> Result<(), StoreError> {
    ctx.store.fail_job(bot_id, reason).await?;
    metrics::counter!("verification_jobs_failed_total").increment(1);
    tracing::warn!(bot_id, reason, "Verification job failed");
    Ok(())
}
