use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;

use crate::app_state::AppState;
use crate::db::StoreError;
use crate::models::verification::{AudienceBatchRequest, IngestResponse};
use crate::models::BotId;
use crate::services::ingest::{self, IngestError};
use crate::services::queue::AdmissionRequest;

/// POST /api/v1/bots/{bot_id}/audience — register audience rows as PENDING
/// and signal the worker to run the bot's job.
pub async fn ingest_audience(
    State(state): State<AppState>,
    Path(bot_id): Path<BotId>,
    Json(request): Json<AudienceBatchRequest>,
) -> Result<(StatusCode, Json<IngestResponse>), StatusCode> {
    if let Err(report) = request.validate() {
        tracing::info!(bot_id, errors = %report, "Rejected audience batch");
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }

    let records = ingest::to_new_records(request.records);
    let summary = ingest::register_batch(state.store.as_ref(), bot_id, &records)
        .await
        .map_err(|e| ingest_status(bot_id, e))?;

    state.queue.enqueue(&AdmissionRequest::start(bot_id)).await.map_err(|e| {
        tracing::error!(bot_id, error = %e, "Failed to signal worker");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            bot_id,
            submitted: summary.submitted,
            inserted: summary.inserted,
            duplicates: summary.duplicates,
            job_state: summary.job.state,
        }),
    ))
}

pub(crate) fn ingest_status(bot_id: BotId, error: IngestError) -> StatusCode {
    match error {
        IngestError::EmptyBatch => StatusCode::UNPROCESSABLE_ENTITY,
        IngestError::Store(StoreError::UnknownBot(_)) => StatusCode::NOT_FOUND,
        IngestError::Store(e) => {
            tracing::error!(bot_id, error = %e, "Progress store error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
