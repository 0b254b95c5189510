use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::models::verification::{SignalResponse, VerificationStatusResponse};
use crate::models::BotId;
use crate::routes::audience::ingest_status;
use crate::services::aggregator;
use crate::services::ingest;
use crate::services::queue::AdmissionRequest;

/// GET /api/v1/bots/{bot_id}/verification/status — live progress report.
pub async fn get_verification_status(
    State(state): State<AppState>,
    Path(bot_id): Path<BotId>,
) -> Result<Json<VerificationStatusResponse>, StatusCode> {
    aggregator::verification_status(state.store.as_ref(), bot_id, state.pace_per_second)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::error!(bot_id, error = %e, "Failed to build status report");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

/// POST /api/v1/bots/{bot_id}/verification/start — (re-)verify the audience.
pub async fn start_verification(
    State(state): State<AppState>,
    Path(bot_id): Path<BotId>,
) -> Result<(StatusCode, Json<SignalResponse>), StatusCode> {
    let job = ingest::request_verification(state.store.as_ref(), bot_id)
        .await
        .map_err(|e| ingest_status(bot_id, e))?;

    signal(&state, AdmissionRequest::start(bot_id)).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SignalResponse {
            bot_id,
            status: job.state.to_string(),
            message: format!("Verification of {} records scheduled", job.total),
        }),
    ))
}

/// POST /api/v1/bots/{bot_id}/verification/cancel — stop the job between records.
pub async fn cancel_verification(
    State(state): State<AppState>,
    Path(bot_id): Path<BotId>,
) -> Result<(StatusCode, Json<SignalResponse>), StatusCode> {
    let job = state.store.get_job(bot_id).await.map_err(|e| {
        tracing::error!(bot_id, error = %e, "Failed to load job");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let Some(job) = job else {
        return Err(StatusCode::NOT_FOUND);
    };

    signal(&state, AdmissionRequest::cancel(bot_id)).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SignalResponse {
            bot_id,
            status: job.state.to_string(),
            message: "Cancellation requested".to_string(),
        }),
    ))
}

async fn signal(state: &AppState, request: AdmissionRequest) -> Result<(), StatusCode> {
    state.queue.enqueue(&request).await.map_err(|e| {
        tracing::error!(bot_id = request.bot_id, error = %e, "Failed to signal worker");
        StatusCode::SERVICE_UNAVAILABLE
    })
}
