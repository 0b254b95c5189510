//! In-process [`ProgressStore`] used by tests and local runs without Postgres.
//!
//! Every trait method takes the single state lock once, so each call is as
//! atomic as the matching Postgres transaction.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{ProgressStore, StoreError};
use crate::models::audience::{AudienceRecord, NewAudienceRecord, Outcome, OutcomeUpdate, RecordStatus};
use crate::models::job::{Completion, JobState, OutcomeCounters, RecordOutcome, VerificationJob};
use crate::models::verification::{LocaleStats, StatusSnapshot};
use crate::models::{BotId, UserId};

#[derive(Debug, Clone)]
struct BotEntry {
    token_encrypted: String,
    deleted: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    bots: HashMap<BotId, BotEntry>,
    audience: HashMap<BotId, BTreeMap<UserId, AudienceRecord>>,
    jobs: HashMap<BotId, VerificationJob>,
}

impl MemoryState {
    fn totals(&self, bot_id: BotId) -> (i64, OutcomeCounters) {
        let mut counters = OutcomeCounters::default();
        let mut total = 0;
        for record in self.audience.get(&bot_id).into_iter().flat_map(|r| r.values()) {
            total += 1;
            if let Ok(outcome) = Outcome::try_from(record.status) {
                counters.increment(outcome);
            }
        }
        (total, counters)
    }

    fn first_pending(&self, bot_id: BotId, after: Option<UserId>) -> Option<&AudienceRecord> {
        let records = self.audience.get(&bot_id)?;
        let mut candidates: Box<dyn Iterator<Item = &AudienceRecord>> = match after {
            Some(cursor) => Box::new(
                records
                    .range((std::ops::Bound::Excluded(cursor), std::ops::Bound::Unbounded))
                    .map(|(_, r)| r),
            ),
            None => Box::new(records.values()),
        };
        candidates.find(|r| r.status == RecordStatus::Pending)
    }

    fn pending(&self, bot_id: BotId) -> i64 {
        self.audience
            .get(&bot_id)
            .map(|r| r.values().filter(|r| r.status == RecordStatus::Pending).count())
            .unwrap_or(0) as i64
    }

    fn locales(&self, bot_id: BotId) -> Vec<LocaleStats> {
        let mut by_locale: BTreeMap<&str, LocaleStats> = BTreeMap::new();
        for record in self.audience.get(&bot_id).into_iter().flat_map(|r| r.values()) {
            let stats = by_locale.entry(record.locale.as_str()).or_insert_with(|| LocaleStats {
                locale: record.locale.clone(),
                ok: 0,
                blocked: 0,
                not_started: 0,
                other_error: 0,
                total: 0,
            });
            stats.total += 1;
            match record.status {
                RecordStatus::Ok => stats.ok += 1,
                RecordStatus::Blocked => stats.blocked += 1,
                RecordStatus::NotStarted => stats.not_started += 1,
                RecordStatus::OtherError => stats.other_error += 1,
                RecordStatus::Pending => {}
            }
        }

        let mut locales: Vec<LocaleStats> = by_locale.into_values().collect();
        locales.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.locale.cmp(&b.locale)));
        locales
    }
}

/// Mutex-guarded progress store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    failing_writes: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bot the way the onboarding flow would.
    pub fn register_bot(&self, bot_id: BotId, token_encrypted: impl Into<String>) {
        self.lock().bots.insert(
            bot_id,
            BotEntry { token_encrypted: token_encrypted.into(), deleted: false },
        );
    }

    pub fn delete_bot(&self, bot_id: BotId) {
        if let Some(bot) = self.lock().bots.get_mut(&bot_id) {
            bot.deleted = true;
        }
    }

    /// Make the next `count` calls to `record_outcome` fail without writing.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn record(&self, bot_id: BotId, user_id: UserId) -> Option<AudienceRecord> {
        self.lock().audience.get(&bot_id)?.get(&user_id).cloned()
    }

    pub fn records(&self, bot_id: BotId) -> Vec<AudienceRecord> {
        self.lock()
            .audience
            .get(&bot_id)
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_write_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn insert_audience(
        &self,
        bot_id: BotId,
        records: &[NewAudienceRecord],
    ) -> Result<u64, StoreError> {
        let mut state = self.lock();
        if !state.bots.get(&bot_id).is_some_and(|b| !b.deleted) {
            return Err(StoreError::UnknownBot(bot_id));
        }

        let audience = state.audience.entry(bot_id).or_default();
        let mut inserted = 0;
        for record in records {
            if audience.contains_key(&record.user_id) {
                continue;
            }
            audience.insert(
                record.user_id,
                AudienceRecord {
                    bot_id,
                    user_id: record.user_id,
                    locale: record.locale.clone(),
                    status: RecordStatus::Pending,
                    attempts: 0,
                    last_attempted_at: None,
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn start_job(&self, bot_id: BotId) -> Result<VerificationJob, StoreError> {
        let mut state = self.lock();
        if !state.bots.get(&bot_id).is_some_and(|b| !b.deleted) {
            return Err(StoreError::UnknownBot(bot_id));
        }

        let (total, seeded) = state.totals(bot_id);
        let now = Utc::now();
        if let Some(job) = state.jobs.get_mut(&bot_id).filter(|j| j.state == JobState::Running) {
            job.total = total;
            job.updated_at = now;
            return Ok(job.clone());
        }

        let job = VerificationJob {
            bot_id,
            cursor: None,
            state: JobState::Running,
            total,
            counters: seeded,
            error: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
        };
        state.jobs.insert(bot_id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, bot_id: BotId) -> Result<Option<VerificationJob>, StoreError> {
        Ok(self.lock().jobs.get(&bot_id).cloned())
    }

    async fn running_jobs(&self) -> Result<Vec<VerificationJob>, StoreError> {
        let state = self.lock();
        let mut jobs: Vec<VerificationJob> = state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Running)
            .filter(|job| state.bots.get(&job.bot_id).is_some_and(|b| !b.deleted))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.started_at, job.bot_id));
        Ok(jobs)
    }

    async fn next_pending(
        &self,
        bot_id: BotId,
        after: Option<UserId>,
    ) -> Result<Option<AudienceRecord>, StoreError> {
        Ok(self.lock().first_pending(bot_id, after).cloned())
    }

    async fn record_outcome(
        &self,
        bot_id: BotId,
        update: &OutcomeUpdate,
    ) -> Result<RecordOutcome, StoreError> {
        if self.take_write_failure() {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }

        let mut state = self.lock();
        let cursor = match state.jobs.get(&bot_id) {
            Some(job) if job.state == JobState::Running => job.cursor,
            _ => return Ok(RecordOutcome::Inactive),
        };
        if cursor.is_some_and(|c| c >= update.user_id) {
            return Ok(RecordOutcome::Duplicate);
        }

        let Some(record) = state
            .audience
            .get_mut(&bot_id)
            .and_then(|records| records.get_mut(&update.user_id))
            .filter(|record| record.status == RecordStatus::Pending)
        else {
            return Ok(RecordOutcome::Duplicate);
        };
        record.status = update.outcome.into();
        record.attempts += update.attempts;
        record.last_attempted_at = Some(update.attempted_at);

        let Some(job) = state.jobs.get_mut(&bot_id) else {
            return Ok(RecordOutcome::Inactive);
        };
        job.counters.increment(update.outcome);
        job.cursor = Some(update.user_id);
        job.updated_at = update.attempted_at;
        Ok(RecordOutcome::Applied(job.clone()))
    }

    async fn complete_job(&self, bot_id: BotId) -> Result<Completion, StoreError> {
        let mut state = self.lock();
        let cursor = match state.jobs.get(&bot_id) {
            Some(job) if job.state == JobState::Running => job.cursor,
            _ => return Ok(Completion::Inactive),
        };

        if state.first_pending(bot_id, cursor).is_some() {
            return Ok(Completion::MoreWork);
        }

        let restart = state.first_pending(bot_id, None).is_some();
        let (total, _) = state.totals(bot_id);
        let now = Utc::now();
        let Some(job) = state.jobs.get_mut(&bot_id) else {
            return Ok(Completion::Inactive);
        };
        job.updated_at = now;
        if restart {
            job.cursor = None;
            job.total = total;
            job.started_at = now;
            Ok(Completion::Restarted)
        } else {
            job.state = JobState::Completed;
            job.finished_at = Some(now);
            Ok(Completion::Completed)
        }
    }

    async fn fail_job(&self, bot_id: BotId, reason: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(job) = state.jobs.get_mut(&bot_id).filter(|j| j.state == JobState::Running) {
            let now = Utc::now();
            job.state = JobState::Failed;
            job.error = Some(reason.to_string());
            job.updated_at = now;
            job.finished_at = Some(now);
        }
        Ok(())
    }

    async fn pending_count(&self, bot_id: BotId) -> Result<i64, StoreError> {
        Ok(self.lock().pending(bot_id))
    }

    async fn locale_breakdown(&self, bot_id: BotId) -> Result<Vec<LocaleStats>, StoreError> {
        Ok(self.lock().locales(bot_id))
    }

    async fn status_snapshot(&self, bot_id: BotId) -> Result<Option<StatusSnapshot>, StoreError> {
        let state = self.lock();
        Ok(state.jobs.get(&bot_id).map(|job| StatusSnapshot {
            job: job.clone(),
            pending: state.pending(bot_id),
            locales: state.locales(bot_id),
        }))
    }

    async fn bot_token(&self, bot_id: BotId) -> Result<Option<String>, StoreError> {
        Ok(self
            .lock()
            .bots
            .get(&bot_id)
            .filter(|b| !b.deleted)
            .map(|b| b.token_encrypted.clone()))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(ids: &[i64]) -> Vec<NewAudienceRecord> {
        ids.iter()
            .map(|&user_id| NewAudienceRecord { user_id, locale: "en".to_string() })
            .collect()
    }

    fn update(user_id: UserId, outcome: Outcome) -> OutcomeUpdate {
        OutcomeUpdate { user_id, outcome, attempts: 1, attempted_at: Utc::now() }
    }

    #[tokio::test]
    async fn test_insert_skips_duplicates() {
        let store = MemoryStore::new();
        store.register_bot(1, "token");

        assert_eq!(store.insert_audience(1, &batch(&[3, 1, 2, 3])).await.unwrap(), 3);
        assert_eq!(store.insert_audience(1, &batch(&[2, 4])).await.unwrap(), 1);
        assert_eq!(store.pending_count(1).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_insert_rejects_unknown_bot() {
        let store = MemoryStore::new();
        let err = store.insert_audience(9, &batch(&[1])).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownBot(9)));
    }

    #[tokio::test]
    async fn test_next_pending_follows_user_id_order_after_cursor() {
        let store = MemoryStore::new();
        store.register_bot(1, "token");
        store.insert_audience(1, &batch(&[30, 10, 20])).await.unwrap();

        assert_eq!(store.next_pending(1, None).await.unwrap().unwrap().user_id, 10);
        assert_eq!(store.next_pending(1, Some(10)).await.unwrap().unwrap().user_id, 20);
        assert!(store.next_pending(1, Some(30)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_outcome_is_idempotent() {
        let store = MemoryStore::new();
        store.register_bot(1, "token");
        store.insert_audience(1, &batch(&[1, 2])).await.unwrap();
        store.start_job(1).await.unwrap();

        let first = store.record_outcome(1, &update(1, Outcome::Blocked)).await.unwrap();
        let RecordOutcome::Applied(job) = first else {
            panic!("expected the first write to apply");
        };
        assert_eq!(job.cursor, Some(1));
        assert_eq!(job.counters.blocked, 1);

        let again = store.record_outcome(1, &update(1, Outcome::Ok)).await.unwrap();
        assert_eq!(again, RecordOutcome::Duplicate);
        assert_eq!(store.record(1, 1).unwrap().status, RecordStatus::Blocked);
        assert_eq!(store.get_job(1).await.unwrap().unwrap().counters.sum(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_writes_nothing() {
        let store = MemoryStore::new();
        store.register_bot(1, "token");
        store.insert_audience(1, &batch(&[1])).await.unwrap();
        store.start_job(1).await.unwrap();
        store.fail_next_writes(1);

        assert!(store.record_outcome(1, &update(1, Outcome::Ok)).await.is_err());
        assert_eq!(store.record(1, 1).unwrap().status, RecordStatus::Pending);
        assert_eq!(store.get_job(1).await.unwrap().unwrap().cursor, None);

        assert!(matches!(
            store.record_outcome(1, &update(1, Outcome::Ok)).await.unwrap(),
            RecordOutcome::Applied(_)
        ));
    }

    #[tokio::test]
    async fn test_restart_seeds_counters_from_terminal_records() {
        let store = MemoryStore::new();
        store.register_bot(1, "token");
        store.insert_audience(1, &batch(&[1, 2])).await.unwrap();
        store.start_job(1).await.unwrap();
        store.record_outcome(1, &update(1, Outcome::Ok)).await.unwrap();
        store.record_outcome(1, &update(2, Outcome::NotStarted)).await.unwrap();
        assert_eq!(store.complete_job(1).await.unwrap(), Completion::Completed);

        store.insert_audience(1, &batch(&[3])).await.unwrap();
        let job = store.start_job(1).await.unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.cursor, None);
        assert_eq!(job.total, 3);
        assert_eq!(job.counters.ok, 1);
        assert_eq!(job.counters.not_started, 1);
    }

    #[tokio::test]
    async fn test_pending_below_cursor_restarts_pass() {
        let store = MemoryStore::new();
        store.register_bot(1, "token");
        store.insert_audience(1, &batch(&[5])).await.unwrap();
        store.start_job(1).await.unwrap();
        store.record_outcome(1, &update(5, Outcome::Ok)).await.unwrap();

        store.insert_audience(1, &batch(&[2])).await.unwrap();
        assert_eq!(store.complete_job(1).await.unwrap(), Completion::Restarted);

        let job = store.get_job(1).await.unwrap().unwrap();
        assert_eq!(job.cursor, None);
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.total, 2);
    }

    #[tokio::test]
    async fn test_running_jobs_skip_deleted_bots() {
        let store = MemoryStore::new();
        store.register_bot(1, "a");
        store.register_bot(2, "b");
        store.start_job(1).await.unwrap();
        store.start_job(2).await.unwrap();
        store.delete_bot(2);

        let running: Vec<BotId> =
            store.running_jobs().await.unwrap().iter().map(|j| j.bot_id).collect();
        assert_eq!(running, vec![1]);
    }

    #[tokio::test]
    async fn test_start_job_rejects_unknown_and_deleted_bots() {
        let store = MemoryStore::new();
        store.register_bot(1, "a");
        store.insert_audience(1, &batch(&[1, 2])).await.unwrap();
        store.delete_bot(1);

        assert!(matches!(store.start_job(1).await, Err(StoreError::UnknownBot(1))));
        assert!(matches!(store.start_job(7).await, Err(StoreError::UnknownBot(7))));
        assert!(store.get_job(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_snapshot_matches_job_and_records() {
        let store = MemoryStore::new();
        store.register_bot(1, "a");
        assert!(store.status_snapshot(1).await.unwrap().is_none());

        store.insert_audience(1, &batch(&[1, 2, 3])).await.unwrap();
        store.start_job(1).await.unwrap();
        store.record_outcome(1, &update(1, Outcome::Blocked)).await.unwrap();

        let snapshot = store.status_snapshot(1).await.unwrap().unwrap();
        assert_eq!(snapshot.job.total, 3);
        assert_eq!(snapshot.job.counters.blocked, 1);
        assert_eq!(snapshot.pending, 2);
        assert_eq!(snapshot.locales.len(), 1);
        assert_eq!(snapshot.locales[0].blocked, 1);
        assert_eq!(snapshot.locales[0].total, 3);
    }
}
