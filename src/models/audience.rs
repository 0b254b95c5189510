use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::{BotId, UserId};

/// Reachability status of one audience member.
///
/// `Pending` is the only non-terminal value. The pipeline moves a record from
/// `Pending` to exactly one terminal status and never back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Pending,
    Ok,
    Blocked,
    NotStarted,
    OtherError,
}

impl RecordStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RecordStatus::Pending)
    }
}

/// Terminal classification of a ping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Ok,
    Blocked,
    NotStarted,
    OtherError,
}

impl From<Outcome> for RecordStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Ok => RecordStatus::Ok,
            Outcome::Blocked => RecordStatus::Blocked,
            Outcome::NotStarted => RecordStatus::NotStarted,
            Outcome::OtherError => RecordStatus::OtherError,
        }
    }
}

impl TryFrom<RecordStatus> for Outcome {
    type Error = RecordStatus;

    fn try_from(status: RecordStatus) -> Result<Self, Self::Error> {
        match status {
            RecordStatus::Ok => Ok(Outcome::Ok),
            RecordStatus::Blocked => Ok(Outcome::Blocked),
            RecordStatus::NotStarted => Ok(Outcome::NotStarted),
            RecordStatus::OtherError => Ok(Outcome::OtherError),
            RecordStatus::Pending => Err(status),
        }
    }
}

/// One row per (bot, user).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudienceRecord {
    pub bot_id: BotId,
    pub user_id: UserId,
    /// May be empty when the uploader did not know it.
    pub locale: String,
    pub status: RecordStatus,
    pub attempts: i32,
    pub last_attempted_at: Option<DateTime<Utc>>,
}

/// A validated audience row handed over by ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAudienceRecord {
    pub user_id: UserId,
    pub locale: String,
}

/// Persisted result of verifying one record.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeUpdate {
    pub user_id: UserId,
    pub outcome: Outcome,
    /// Ping attempts spent on this record in this pass (1 plus retries).
    pub attempts: i32,
    pub attempted_at: DateTime<Utc>,
}
