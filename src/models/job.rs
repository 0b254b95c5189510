use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::audience::Outcome;
use super::{BotId, UserId};

/// Lifecycle state of a bot's verification job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Running,
    Completed,
    Failed,
}

/// Per-outcome counters, denormalized onto the job row.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutcomeCounters {
    pub ok: i64,
    pub blocked: i64,
    pub not_started: i64,
    pub other_error: i64,
}

impl OutcomeCounters {
    pub fn increment(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Ok => self.ok += 1,
            Outcome::Blocked => self.blocked += 1,
            Outcome::NotStarted => self.not_started += 1,
            Outcome::OtherError => self.other_error += 1,
        }
    }

    pub fn get(&self, outcome: Outcome) -> i64 {
        match outcome {
            Outcome::Ok => self.ok,
            Outcome::Blocked => self.blocked,
            Outcome::NotStarted => self.not_started,
            Outcome::OtherError => self.other_error,
        }
    }

    pub fn sum(&self) -> i64 {
        self.ok + self.blocked + self.not_started + self.other_error
    }
}

/// Durable progress of one bot's verification run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationJob {
    pub bot_id: BotId,
    /// Last processed `user_id`; `None` until the first record is persisted.
    pub cursor: Option<UserId>,
    pub state: JobState,
    pub total: i64,
    pub counters: OutcomeCounters,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Result of trying to persist one classification.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// Record, counters and cursor were written together.
    Applied(VerificationJob),
    /// Already processed (cursor past it or status no longer PENDING).
    Duplicate,
    /// The job is not RUNNING any more.
    Inactive,
}

/// Result of closing a pass once no PENDING record remains after the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Completed,
    /// PENDING records appeared below the cursor; a fresh pass was started.
    Restarted,
    /// PENDING records appeared after the cursor; keep going.
    MoreWork,
    Inactive,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_track_each_outcome() {
        let mut counters = OutcomeCounters::default();
        counters.increment(Outcome::Ok);
        counters.increment(Outcome::Ok);
        counters.increment(Outcome::NotStarted);
        counters.increment(Outcome::OtherError);

        assert_eq!(counters.get(Outcome::Ok), 2);
        assert_eq!(counters.blocked, 0);
        assert_eq!(counters.sum(), 4);
    }
}
