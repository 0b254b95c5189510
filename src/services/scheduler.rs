//! Worker pool interleaving active verification jobs.
//!
//! Each active job owns exactly one ticket. Workers pop a ticket from the
//! ready queue, advance that job by one record and push the ticket to the
//! back of the queue, which gives round-robin fairness across bots while
//! keeping every bot's own records strictly ordered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::BotId;
use crate::services::job::{mark_failed, JobError, JobRunner, PipelineContext, Preparation, Step};

const PERSIST_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Result of asking the scheduler to run a bot's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Started,
    AlreadyActive,
    /// A cancelled run is still finishing its current record. The job
    /// restarts from the persisted cursor once it has stopped.
    RestartPending,
    /// Preparation hit a transient error and is retried after the backoff.
    Retrying(String),
    /// The store has no RUNNING job for this bot.
    NotRunning,
    Failed(String),
}

struct Ticket {
    bot_id: BotId,
    generation: u64,
    cancel: CancellationToken,
    /// `None` until the job has been prepared.
    runner: Option<JobRunner>,
}

struct ActiveJob {
    generation: u64,
    cancel: CancellationToken,
    restart_requested: bool,
}

struct Shared {
    ctx: PipelineContext,
    ready_tx: mpsc::UnboundedSender<Ticket>,
    ready_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Ticket>>,
    active: Mutex<HashMap<BotId, ActiveJob>>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
    retry_backoff: Duration,
}

impl Shared {
    fn active(&self) -> MutexGuard<'_, HashMap<BotId, ActiveJob>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a fresh generation for `bot_id` and hand back its unprepared ticket.
    fn activate(&self, active: &mut HashMap<BotId, ActiveJob>, bot_id: BotId) -> Ticket {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        active.insert(
            bot_id,
            ActiveJob { generation, cancel: cancel.clone(), restart_requested: false },
        );
        Ticket { bot_id, generation, cancel, runner: None }
    }

    /// Drop a generation that has stopped, or replace it when a restart was requested.
    fn retire(&self, bot_id: BotId, generation: u64) {
        let restart = {
            let mut active = self.active();
            let current = active
                .get(&bot_id)
                .filter(|job| job.generation == generation)
                .map(|job| job.restart_requested);
            let restart = match current {
                Some(true) if !self.shutdown.is_cancelled() => Some(self.activate(&mut active, bot_id)),
                Some(_) => {
                    active.remove(&bot_id);
                    None
                }
                None => None,
            };
            metrics::gauge!("verification_active_jobs").set(active.len() as f64);
            restart
        };

        if let Some(ticket) = restart {
            tracing::info!(bot_id, generation = ticket.generation, "Restarting cancelled verification job");
            self.requeue(ticket);
        }
    }

    fn requeue(&self, ticket: Ticket) {
        let (bot_id, generation) = (ticket.bot_id, ticket.generation);
        if self.ready_tx.send(ticket).is_err() {
            self.retire(bot_id, generation);
        }
    }

    fn requeue_after(self: &Arc<Self>, ticket: Ticket, delay: Duration) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => shared.requeue(ticket),
            }
        });
    }

    /// Prepare an unprepared ticket and put it on the ready queue.
    async fn launch(self: &Arc<Self>, mut ticket: Ticket) -> Admission {
        let (bot_id, generation) = (ticket.bot_id, ticket.generation);

        match JobRunner::prepare(&self.ctx, bot_id).await {
            Ok(Preparation::Ready(runner)) => {
                ticket.runner = Some(runner);
                metrics::counter!("verification_jobs_started_total").increment(1);
                metrics::gauge!("verification_active_jobs").set(self.active().len() as f64);
                tracing::info!(bot_id, generation, "Verification job admitted");
                self.requeue(ticket);
                Admission::Started
            }
            Ok(Preparation::NotRunning) => {
                self.retire(bot_id, generation);
                Admission::NotRunning
            }
            Ok(Preparation::Failed(reason)) => {
                self.retire(bot_id, generation);
                Admission::Failed(reason)
            }
            Err(e) if e.is_unrecoverable() => {
                let reason = e.to_string();
                if let Err(store_err) = mark_failed(&self.ctx, bot_id, &reason).await {
                    tracing::error!(bot_id, error = %store_err, "Could not mark job failed");
                }
                self.retire(bot_id, generation);
                Admission::Failed(reason)
            }
            Err(e) => {
                tracing::warn!(bot_id, generation, error = %e, "Job preparation failed, will retry");
                self.requeue_after(ticket, self.retry_backoff);
                Admission::Retrying(e.to_string())
            }
        }
    }

    async fn next_ticket(&self) -> Option<Ticket> {
        let mut ready = tokio::select! {
            _ = self.shutdown.cancelled() => return None,
            ready = self.ready_rx.lock() => ready,
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            ticket = ready.recv() => ticket,
        }
    }
}

pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn `concurrency` workers draining the ready queue.
    pub fn start(ctx: PipelineContext, concurrency: usize) -> Self {
        Self::start_with_backoff(ctx, concurrency, PERSIST_RETRY_BACKOFF)
    }

    pub fn start_with_backoff(ctx: PipelineContext, concurrency: usize, retry_backoff: Duration) -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            ctx,
            ready_tx,
            ready_rx: tokio::sync::Mutex::new(ready_rx),
            active: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            retry_backoff,
        });

        let workers = (0..concurrency.max(1))
            .map(|worker_id| tokio::spawn(run_worker(Arc::clone(&shared), worker_id)))
            .collect();

        Self { shared, workers: Mutex::new(workers) }
    }

    /// Start running a bot's RUNNING job unless it is already active.
    ///
    /// A job that was cancelled but has not stopped yet keeps its slot; the
    /// admission is remembered and the job restarts once the old run retires.
    pub async fn admit(&self, bot_id: BotId) -> Admission {
        let ticket = {
            let mut active = self.shared.active();
            if let Some(job) = active.get_mut(&bot_id) {
                if !job.cancel.is_cancelled() {
                    return Admission::AlreadyActive;
                }
                job.restart_requested = true;
                tracing::info!(bot_id, "Cancelled job still stopping, restart queued");
                return Admission::RestartPending;
            }
            self.shared.activate(&mut active, bot_id)
        };

        self.shared.launch(ticket).await
    }

    /// Reload every RUNNING job from the store. Returns how many were started
    /// or scheduled for another preparation attempt.
    pub async fn resume_incomplete(&self) -> Result<usize, JobError> {
        let jobs = self.shared.ctx.store.running_jobs().await?;
        let mut resumed = 0;

        for job in jobs {
            match self.admit(job.bot_id).await {
                Admission::Started | Admission::Retrying(_) => resumed += 1,
                admission => {
                    tracing::info!(bot_id = job.bot_id, ?admission, "Job not resumed");
                }
            }
        }

        tracing::info!(resumed, "Resumed incomplete verification jobs");
        Ok(resumed)
    }

    /// Ask a job to stop after its current record. Returns false if it was not active.
    pub fn cancel(&self, bot_id: BotId) -> bool {
        let mut active = self.shared.active();
        match active.get_mut(&bot_id) {
            Some(job) => {
                job.restart_requested = false;
                job.cancel.cancel();
                tracing::info!(bot_id, "Verification job cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, bot_id: BotId) -> bool {
        self.shared.active().contains_key(&bot_id)
    }

    pub fn active_jobs(&self) -> Vec<BotId> {
        let mut bots: Vec<BotId> = self.shared.active().keys().copied().collect();
        bots.sort_unstable();
        bots
    }

    /// Stop all workers between records and wait for them.
    ///
    /// Jobs stay RUNNING in the store and are picked up by the next
    /// [`Scheduler::resume_incomplete`].
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Verification worker panicked");
            }
        }
        self.shared.active().clear();
        tracing::info!("Scheduler stopped");
    }
}

async fn run_worker(shared: Arc<Shared>, worker_id: usize) {
    tracing::debug!(worker_id, "Verification worker started");

    while let Some(mut ticket) = shared.next_ticket().await {
        let (bot_id, generation) = (ticket.bot_id, ticket.generation);

        if ticket.cancel.is_cancelled() {
            let cursor = ticket.runner.as_ref().and_then(JobRunner::cursor);
            tracing::info!(bot_id, ?cursor, "Verification job cancelled");
            shared.retire(bot_id, generation);
            continue;
        }

        let Some(mut runner) = ticket.runner.take() else {
            shared.launch(ticket).await;
            continue;
        };
        let step = runner.step(&shared.ctx).await;
        ticket.runner = Some(runner);

        match step {
            Ok(Step::Verified { .. } | Step::Skipped | Step::Restarted) => shared.requeue(ticket),
            Ok(Step::Completed | Step::Stopped) => shared.retire(bot_id, generation),
            Err(e) if e.is_unrecoverable() => {
                if let Err(store_err) = mark_failed(&shared.ctx, bot_id, &e.to_string()).await {
                    tracing::error!(bot_id, error = %store_err, "Could not mark job failed");
                }
                shared.retire(bot_id, generation);
            }
            Err(e) => {
                tracing::error!(
                    bot_id,
                    worker_id,
                    error = %e,
                    "Verification step failed, record stays pending"
                );
                shared.requeue_after(ticket, shared.retry_backoff);
            }
        }
    }

    tracing::debug!(worker_id, "Verification worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, ProgressStore};
    use crate::models::audience::NewAudienceRecord;
    use crate::models::job::JobState;
    use crate::services::encryption::{CredentialError, CredentialSource};
    use crate::services::job::JobSettings;
    use crate::services::rate_limiter::RateLimiter;
    use crate::services::telegram::{PingClient, PingFailure};
    use async_trait::async_trait;

    struct AlwaysOk;

    #[async_trait]
    impl PingClient for AlwaysOk {
        async fn check_credential(&self, _token: &str) -> Result<(), PingFailure> {
            Ok(())
        }

        async fn ping(&self, _token: &str, _user_id: i64) -> Result<(), PingFailure> {
            Ok(())
        }
    }

    struct PlainCredentials;

    #[async_trait]
    impl CredentialSource for PlainCredentials {
        async fn credential(&self, bot_id: BotId) -> Result<String, CredentialError> {
            Ok(format!("{bot_id}:token"))
        }
    }

    fn context(store: Arc<MemoryStore>) -> PipelineContext {
        PipelineContext {
            store,
            pinger: Arc::new(AlwaysOk),
            limiter: Arc::new(RateLimiter::per_second(15)),
            credentials: Arc::new(PlainCredentials),
            settings: JobSettings::default(),
        }
    }

    async fn seeded_store(bot_id: BotId, count: i64) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.register_bot(bot_id, "sealed");
        let records: Vec<NewAudienceRecord> = (1..=count)
            .map(|user_id| NewAudienceRecord { user_id, locale: "en".to_string() })
            .collect();
        store.insert_audience(bot_id, &records).await.unwrap();
        store
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_without_running_job_is_refused() {
        let store = seeded_store(1, 3).await;
        let scheduler = Scheduler::start(context(store), 2);

        assert_eq!(scheduler.admit(1).await, Admission::NotRunning);
        assert!(!scheduler.is_active(1));
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_admit_is_already_active() {
        let store = seeded_store(1, 40).await;
        store.start_job(1).await.unwrap();
        let scheduler = Scheduler::start(context(store.clone()), 1);

        assert_eq!(scheduler.admit(1).await, Admission::Started);
        assert_eq!(scheduler.admit(1).await, Admission::AlreadyActive);
        assert_eq!(scheduler.active_jobs(), vec![1]);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_runs_to_completion_and_retires() {
        let store = seeded_store(1, 20).await;
        store.start_job(1).await.unwrap();
        let scheduler = Scheduler::start(context(store.clone()), 3);

        scheduler.admit(1).await;
        while scheduler.is_active(1) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let job = store.get_job(1).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.counters.ok, 20);
        assert_eq!(job.cursor, Some(20));
        scheduler.shutdown().await;
    }
}
