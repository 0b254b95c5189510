//! Boundary with the ingestion flow: already-validated audience rows come in
//! as PENDING records and the bot's job is registered or resumed.

use crate::db::{ProgressStore, StoreError};
use crate::models::audience::NewAudienceRecord;
use crate::models::job::VerificationJob;
use crate::models::verification::AudienceRow;
use crate::models::BotId;

#[derive(Debug, Clone)]
pub struct IngestSummary {
    pub submitted: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub job: VerificationJob,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Audience batch is empty")]
    EmptyBatch,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Canonical `xx` / `xx-YY` form of a locale tag; empty stays empty.
pub fn normalize_locale(raw: &str) -> String {
    let value = raw.trim().replace('_', "-");
    match value.split_once('-') {
        Some((language, region)) => {
            format!("{}-{}", language.to_lowercase(), region.to_uppercase())
        }
        None => value.to_lowercase(),
    }
}

pub fn to_new_records(rows: Vec<AudienceRow>) -> Vec<NewAudienceRecord> {
    rows.into_iter()
        .map(|row| NewAudienceRecord { user_id: row.user_id, locale: normalize_locale(&row.locale) })
        .collect()
}

/// Insert a batch as PENDING records and register the bot's job.
pub async fn register_batch(
    store: &dyn ProgressStore,
    bot_id: BotId,
    records: &[NewAudienceRecord],
) -> Result<IngestSummary, IngestError> {
    if records.is_empty() {
        return Err(IngestError::EmptyBatch);
    }

    let inserted = store.insert_audience(bot_id, records).await?;
    let job = store.start_job(bot_id).await?;
    let submitted = records.len() as u64;
    metrics::counter!("audience_records_ingested_total").increment(inserted);

    tracing::info!(
        bot_id,
        submitted,
        inserted,
        total = job.total,
        "Audience batch registered"
    );

    Ok(IngestSummary { submitted, inserted, duplicates: submitted - inserted, job })
}

/// Register a (re-)verification without new rows.
pub async fn request_verification(
    store: &dyn ProgressStore,
    bot_id: BotId,
) -> Result<VerificationJob, IngestError> {
    if store.bot_token(bot_id).await?.is_none() {
        return Err(StoreError::UnknownBot(bot_id).into());
    }
    let job = store.start_job(bot_id).await?;
    tracing::info!(bot_id, total = job.total, "Verification requested");
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::job::JobState;

    #[test]
    fn test_normalize_locale() {
        assert_eq!(normalize_locale(" RU "), "ru");
        assert_eq!(normalize_locale("pt_br"), "pt-BR");
        assert_eq!(normalize_locale("en-us"), "en-US");
        assert_eq!(normalize_locale(""), "");
    }

    #[tokio::test]
    async fn test_register_batch_counts_duplicates() {
        let store = MemoryStore::new();
        store.register_bot(5, "sealed");
        let rows = to_new_records(vec![
            AudienceRow { user_id: 10, locale: "en_gb".to_string() },
            AudienceRow { user_id: 11, locale: String::new() },
        ]);
        register_batch(&store, 5, &rows).await.unwrap();

        let again = register_batch(&store, 5, &rows).await.unwrap();
        assert_eq!(again.submitted, 2);
        assert_eq!(again.inserted, 0);
        assert_eq!(again.duplicates, 2);
        assert_eq!(again.job.state, JobState::Running);
        assert_eq!(again.job.total, 2);
        assert_eq!(store.record(5, 10).unwrap().locale, "en-GB");
    }

    #[tokio::test]
    async fn test_unknown_bot_is_rejected() {
        let store = MemoryStore::new();
        let rows = vec![NewAudienceRecord { user_id: 1, locale: "en".to_string() }];
        assert!(matches!(
            register_batch(&store, 3, &rows).await,
            Err(IngestError::Store(StoreError::UnknownBot(3)))
        ));
        assert!(matches!(
            request_verification(&store, 3).await,
            Err(IngestError::Store(StoreError::UnknownBot(3)))
        ));
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let store = MemoryStore::new();
        store.register_bot(1, "sealed");
        assert!(matches!(register_batch(&store, 1, &[]).await, Err(IngestError::EmptyBatch)));
    }
}
