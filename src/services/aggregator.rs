use crate::db::{ProgressStore, StoreError};
use crate::models::verification::{ReportedStatus, StatusSnapshot, VerificationStatusResponse};
use crate::models::BotId;

/// Build the live status report for a bot from persisted state.
///
/// `pace_per_second` is the global ping rate. The ETA divides the remaining
/// PENDING count by it and ignores contention from other bots verifying at
/// the same time, so it is optimistic while several jobs run.
pub async fn verification_status(
    store: &dyn ProgressStore,
    bot_id: BotId,
    pace_per_second: f64,
) -> Result<VerificationStatusResponse, StoreError> {
    let Some(StatusSnapshot { job, pending, locales }) = store.status_snapshot(bot_id).await? else {
        return Ok(VerificationStatusResponse::none());
    };

    Ok(VerificationStatusResponse {
        status: ReportedStatus::from(job.state),
        total: job.total,
        verified: (job.total - pending).max(0),
        ok: job.counters.ok,
        blocked: job.counters.blocked,
        not_started: job.counters.not_started,
        other_error: job.counters.other_error,
        eta_seconds: eta_seconds(pending, pace_per_second),
        locales,
        error: job.error,
    })
}

pub fn eta_seconds(pending: i64, pace_per_second: f64) -> f64 {
    if pending <= 0 || pace_per_second <= 0.0 {
        return 0.0;
    }
    pending as f64 / pace_per_second
}
