use garde::Validate;
use serde::{Deserialize, Serialize};

use super::job::{JobState, VerificationJob};
use super::UserId;

/// One audience row in an ingestion request.
#[derive(Debug, Deserialize, Validate)]
pub struct AudienceRow {
    #[garde(range(min = 1))]
    pub user_id: UserId,

    #[garde(length(max = 35))]
    #[serde(default)]
    pub locale: String,
}

/// Validated audience batch for one bot.
#[derive(Debug, Deserialize, Validate)]
pub struct AudienceBatchRequest {
    #[garde(length(min = 1, max = 100_000), dive)]
    pub records: Vec<AudienceRow>,
}

/// Response after registering an audience batch.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub bot_id: i64,
    pub submitted: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub job_state: JobState,
}

/// Response after a start/cancel signal.
#[derive(Debug, Serialize)]
pub struct SignalResponse {
    pub bot_id: i64,
    pub status: String,
    pub message: String,
}

/// Job status as reported to polling clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportedStatus {
    Running,
    Completed,
    Failed,
    None,
}

impl From<JobState> for ReportedStatus {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Running => ReportedStatus::Running,
            JobState::Completed => ReportedStatus::Completed,
            JobState::Failed => ReportedStatus::Failed,
        }
    }
}

/// Per-locale breakdown of a bot's audience.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocaleStats {
    pub locale: String,
    pub ok: i64,
    pub blocked: i64,
    pub not_started: i64,
    pub other_error: i64,
    pub total: i64,
}

/// Job row and audience figures read at a single point in time.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub job: VerificationJob,
    pub pending: i64,
    pub locales: Vec<LocaleStats>,
}

/// Response for the status query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationStatusResponse {
    pub status: ReportedStatus,
    pub total: i64,
    pub verified: i64,
    pub ok: i64,
    pub blocked: i64,
    pub not_started: i64,
    pub other_error: i64,
    pub eta_seconds: f64,
    pub locales: Vec<LocaleStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerificationStatusResponse {
    /// Report for a bot that never had a job.
    pub fn none() -> Self {
        Self {
            status: ReportedStatus::None,
            total: 0,
            verified: 0,
            ok: 0,
            blocked: 0,
            not_started: 0,
            other_error: 0,
            eta_seconds: 0.0,
            locales: Vec::new(),
            error: None,
        }
    }
}
