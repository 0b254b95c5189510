//! Test helpers for pipeline tests: a scripted Bot API, fixed credentials
//! and an in-memory progress store wired into a pipeline context.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use audience_verify::db::{MemoryStore, ProgressStore, StoreError};
use audience_verify::models::BotId;
use audience_verify::services::encryption::{CredentialError, CredentialSource};
use audience_verify::services::job::{JobSettings, PipelineContext};
use audience_verify::services::rate_limiter::RateLimiter;
use audience_verify::services::scheduler::Scheduler;
use audience_verify::services::telegram::{PingClient, PingFailure};

use crate::fixtures::{as_records, AudienceMember};

pub const RATE_PER_SECOND: u32 = 15;

pub fn token_for(bot_id: BotId) -> String {
    format!("{bot_id}:test-token")
}

fn bot_of(token: &str) -> BotId {
    token.split(':').next().and_then(|id| id.parse().ok()).unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct PingCall {
    pub bot_id: BotId,
    pub user_id: i64,
    pub at: Instant,
}

/// Bot API simulator. Users without a script answer OK.
#[derive(Default)]
pub struct ScriptedPinger {
    scripts: Mutex<HashMap<(BotId, i64), VecDeque<Result<(), PingFailure>>>>,
    rejected_credentials: Mutex<HashSet<BotId>>,
    calls: Mutex<Vec<PingCall>>,
    latency: Mutex<Duration>,
}

impl ScriptedPinger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answers for successive pings of one user; the last answer repeats.
    pub fn script(&self, bot_id: BotId, user_id: i64, responses: Vec<Result<(), PingFailure>>) {
        self.scripts.lock().unwrap().insert((bot_id, user_id), responses.into());
    }

    pub fn script_audience(&self, bot_id: BotId, members: &[AudienceMember]) {
        for member in members {
            self.script(bot_id, member.user_id, vec![member.response()]);
        }
    }

    /// Delay every ping answer by `latency` after the call is recorded.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Make the startup getMe check answer 401 for this bot.
    pub fn reject_credential(&self, bot_id: BotId) {
        self.rejected_credentials.lock().unwrap().insert(bot_id);
    }

    pub fn calls(&self) -> Vec<PingCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, bot_id: BotId) -> Vec<PingCall> {
        self.calls().into_iter().filter(|c| c.bot_id == bot_id).collect()
    }

    pub fn pings_of(&self, bot_id: BotId, user_id: i64) -> usize {
        self.calls().iter().filter(|c| c.bot_id == bot_id && c.user_id == user_id).count()
    }
}

#[async_trait]
impl PingClient for ScriptedPinger {
    async fn check_credential(&self, token: &str) -> Result<(), PingFailure> {
        if self.rejected_credentials.lock().unwrap().contains(&bot_of(token)) {
            return Err(PingFailure::api(401, "Unauthorized"));
        }
        Ok(())
    }

    async fn ping(&self, token: &str, user_id: i64) -> Result<(), PingFailure> {
        let bot_id = bot_of(token);
        self.calls.lock().unwrap().push(PingCall { bot_id, user_id, at: Instant::now() });

        let answer = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&(bot_id, user_id)) {
                Some(responses) if responses.len() > 1 => responses.pop_front().unwrap_or(Ok(())),
                Some(responses) => responses.front().cloned().unwrap_or(Ok(())),
                None => Ok(()),
            }
        };

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            sleep(latency).await;
        }
        answer
    }
}

/// Every bot's credential is `token_for(bot_id)`.
pub struct StaticCredentials;

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn credential(&self, bot_id: BotId) -> Result<String, CredentialError> {
        Ok(token_for(bot_id))
    }
}

/// Credential lookup whose first `failures` calls hit an unavailable store.
pub struct FlakyCredentials {
    failures: AtomicU32,
}

impl FlakyCredentials {
    pub fn failing(failures: u32) -> Arc<Self> {
        Arc::new(Self { failures: AtomicU32::new(failures) })
    }
}

#[async_trait]
impl CredentialSource for FlakyCredentials {
    async fn credential(&self, bot_id: BotId) -> Result<String, CredentialError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("connection reset".to_string()).into());
        }
        Ok(token_for(bot_id))
    }
}

pub fn pipeline(store: Arc<MemoryStore>, pinger: Arc<ScriptedPinger>) -> PipelineContext {
    pipeline_with_credentials(store, pinger, Arc::new(StaticCredentials))
}

pub fn pipeline_with_credentials(
    store: Arc<MemoryStore>,
    pinger: Arc<ScriptedPinger>,
    credentials: Arc<dyn CredentialSource>,
) -> PipelineContext {
    PipelineContext {
        store,
        pinger,
        limiter: Arc::new(RateLimiter::per_second(RATE_PER_SECOND)),
        credentials,
        settings: JobSettings::default(),
    }
}

/// Register the bot, ingest its audience and start its job.
pub async fn seed_bot(store: &MemoryStore, bot_id: BotId, members: &[AudienceMember]) {
    store.register_bot(bot_id, "sealed");
    store.insert_audience(bot_id, &as_records(members)).await.unwrap();
    store.start_job(bot_id).await.unwrap();
}

/// Wait (in virtual time) until the scheduler retired the bot's job.
pub async fn wait_until_idle(scheduler: &Scheduler, bot_id: BotId) {
    let deadline = Instant::now() + Duration::from_secs(600);
    while scheduler.is_active(bot_id) {
        assert!(Instant::now() < deadline, "job for bot {bot_id} never finished");
        sleep(Duration::from_millis(50)).await;
    }
}
