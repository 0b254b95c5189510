//! Maps a raw ping result onto the four reachability outcomes.

use std::time::Duration;

use crate::models::audience::Outcome;
use crate::services::telegram::PingFailure;

/// What the job loop should do with one ping result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Final answer for this record.
    Terminal(Outcome),
    /// Worth another attempt, optionally after the server-provided delay.
    Transient { retry_after: Option<Duration> },
    /// The bot credential itself was rejected; the job cannot continue.
    CredentialRejected(String),
}

/// Classify one ping result. Pure; persistence is the caller's job.
pub fn classify(result: &Result<(), PingFailure>) -> Classification {
    let failure = match result {
        Ok(()) => return Classification::Terminal(Outcome::Ok),
        Err(failure) => failure,
    };

    match failure {
        PingFailure::Transport(_) => Classification::Transient { retry_after: None },
        PingFailure::Api { error_code, description, retry_after } => {
            let description = description.to_lowercase();

            if *error_code == 429 || description.contains("too many requests") {
                Classification::Transient { retry_after: retry_after.map(Duration::from_secs) }
            } else if *error_code >= 500 {
                Classification::Transient { retry_after: None }
            } else if *error_code == 401 || description.contains("unauthorized") {
                Classification::CredentialRejected(description)
            } else if description.contains("blocked") {
                Classification::Terminal(Outcome::Blocked)
            } else if description.contains("chat not found") {
                Classification::Terminal(Outcome::NotStarted)
            } else {
                Classification::Terminal(Outcome::OtherError)
            }
        }
    }
}

/// Terminal outcome for a result, folding transient failures into `OtherError`.
///
/// Used once the retry budget is spent.
pub fn outcome_after_retries(result: &Result<(), PingFailure>) -> Outcome {
    match classify(result) {
        Classification::Terminal(outcome) => outcome,
        Classification::Transient { .. } | Classification::CredentialRejected(_) => {
            Outcome::OtherError
        }
    }
}
