use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use std::str::FromStr;

use super::{ProgressStore, StoreError};
use crate::models::audience::{AudienceRecord, NewAudienceRecord, Outcome, OutcomeUpdate, RecordStatus};
use crate::models::job::{Completion, JobState, OutcomeCounters, RecordOutcome, VerificationJob};
use crate::models::verification::{LocaleStats, StatusSnapshot};
use crate::models::{BotId, UserId};

const JOB_COLUMNS: &str = r#"
    bot_id, state, cursor_user_id, total, ok_count, blocked_count, not_started_count,
    other_error_count, error, started_at, updated_at, finished_at
"#;

/// PostgreSQL-backed progress store.
#[derive(Clone)]
pub struct PgProgressStore {
    pool: PgPool,
}

impl PgProgressStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn job_from_row(row: &PgRow) -> Result<VerificationJob, StoreError> {
    let state: String = row.try_get("state")?;
    let state = JobState::from_str(&state)
        .map_err(|_| StoreError::Corrupt(format!("unknown job state '{state}'")))?;

    Ok(VerificationJob {
        bot_id: row.try_get("bot_id")?,
        cursor: row.try_get("cursor_user_id")?,
        state,
        total: row.try_get("total")?,
        counters: OutcomeCounters {
            ok: row.try_get("ok_count")?,
            blocked: row.try_get("blocked_count")?,
            not_started: row.try_get("not_started_count")?,
            other_error: row.try_get("other_error_count")?,
        },
        error: row.try_get("error")?,
        started_at: row.try_get("started_at")?,
        updated_at: row.try_get("updated_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn record_from_row(row: &PgRow) -> Result<AudienceRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let status = RecordStatus::from_str(&status)
        .map_err(|_| StoreError::Corrupt(format!("unknown record status '{status}'")))?;

    Ok(AudienceRecord {
        bot_id: row.try_get("bot_id")?,
        user_id: row.try_get("user_id")?,
        locale: row.try_get("locale")?,
        status,
        attempts: row.try_get("attempts")?,
        last_attempted_at: row.try_get("last_attempted_at")?,
    })
}

fn counter_column(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Ok => "ok_count",
        Outcome::Blocked => "blocked_count",
        Outcome::NotStarted => "not_started_count",
        Outcome::OtherError => "other_error_count",
    }
}

/// Total rows and terminal counts of a bot's audience.
async fn audience_totals(
    conn: &mut PgConnection,
    bot_id: BotId,
) -> Result<(i64, OutcomeCounters), StoreError> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS total,
               COUNT(*) FILTER (WHERE status = 'OK') AS ok,
               COUNT(*) FILTER (WHERE status = 'BLOCKED') AS blocked,
               COUNT(*) FILTER (WHERE status = 'NOT_STARTED') AS not_started,
               COUNT(*) FILTER (WHERE status = 'OTHER_ERROR') AS other_error
        FROM audience_records
        WHERE bot_id = $1
        "#,
    )
    .bind(bot_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok((
        row.try_get("total")?,
        OutcomeCounters {
            ok: row.try_get("ok")?,
            blocked: row.try_get("blocked")?,
            not_started: row.try_get("not_started")?,
            other_error: row.try_get("other_error")?,
        },
    ))
}

async fn count_pending(conn: &mut PgConnection, bot_id: BotId) -> Result<i64, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS pending
        FROM audience_records
        WHERE bot_id = $1 AND status = 'PENDING'
        "#,
    )
    .bind(bot_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(row.try_get("pending")?)
}

async fn locale_stats(conn: &mut PgConnection, bot_id: BotId) -> Result<Vec<LocaleStats>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT locale,
               COUNT(*) AS total,
               COUNT(*) FILTER (WHERE status = 'OK') AS ok,
               COUNT(*) FILTER (WHERE status = 'BLOCKED') AS blocked,
               COUNT(*) FILTER (WHERE status = 'NOT_STARTED') AS not_started,
               COUNT(*) FILTER (WHERE status = 'OTHER_ERROR') AS other_error
        FROM audience_records
        WHERE bot_id = $1
        GROUP BY locale
        ORDER BY total DESC, locale ASC
        "#,
    )
    .bind(bot_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|r| -> Result<LocaleStats, StoreError> {
            Ok(LocaleStats {
                locale: r.try_get("locale")?,
                ok: r.try_get("ok")?,
                blocked: r.try_get("blocked")?,
                not_started: r.try_get("not_started")?,
                other_error: r.try_get("other_error")?,
                total: r.try_get("total")?,
            })
        })
        .collect()
}

async fn lock_job(
    conn: &mut PgConnection,
    bot_id: BotId,
) -> Result<Option<VerificationJob>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM verification_jobs WHERE bot_id = $1 FOR UPDATE"
    ))
    .bind(bot_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

async fn has_pending(
    conn: &mut PgConnection,
    bot_id: BotId,
    after: Option<UserId>,
) -> Result<bool, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM audience_records
            WHERE bot_id = $1
              AND status = 'PENDING'
              AND ($2::BIGINT IS NULL OR user_id > $2)
        ) AS found
        "#,
    )
    .bind(bot_id)
    .bind(after)
    .fetch_one(&mut *conn)
    .await?;

    Ok(row.try_get("found")?)
}

#[async_trait]
impl ProgressStore for PgProgressStore {
    async fn insert_audience(
        &self,
        bot_id: BotId,
        records: &[NewAudienceRecord],
    ) -> Result<u64, StoreError> {
        if self.bot_token(bot_id).await?.is_none() {
            return Err(StoreError::UnknownBot(bot_id));
        }

        let user_ids: Vec<i64> = records.iter().map(|r| r.user_id).collect();
        let locales: Vec<String> = records.iter().map(|r| r.locale.clone()).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO audience_records (bot_id, user_id, locale)
            SELECT $1, user_id, locale
            FROM UNNEST($2::BIGINT[], $3::TEXT[]) AS batch (user_id, locale)
            ON CONFLICT (bot_id, user_id) DO NOTHING
            "#,
        )
        .bind(bot_id)
        .bind(&user_ids)
        .bind(&locales)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn start_job(&self, bot_id: BotId) -> Result<VerificationJob, StoreError> {
        let mut tx = self.pool.begin().await?;

        let bot = sqlx::query("SELECT id FROM bots WHERE id = $1 AND deleted_at IS NULL FOR SHARE")
            .bind(bot_id)
            .fetch_optional(&mut *tx)
            .await?;
        if bot.is_none() {
            return Err(StoreError::UnknownBot(bot_id));
        }

        let existing = lock_job(&mut tx, bot_id).await?;
        let (total, seeded) = audience_totals(&mut tx, bot_id).await?;

        let row = match existing {
            Some(job) if job.state == JobState::Running => {
                sqlx::query(&format!(
                    r#"
                    UPDATE verification_jobs
                    SET total = $2, updated_at = NOW()
                    WHERE bot_id = $1
                    RETURNING {JOB_COLUMNS}
                    "#
                ))
                .bind(bot_id)
                .bind(total)
                .fetch_one(&mut *tx)
                .await?
            }
            _ => {
                sqlx::query(&format!(
                    r#"
                    INSERT INTO verification_jobs
                        (bot_id, state, cursor_user_id, total, ok_count, blocked_count,
                         not_started_count, other_error_count, error, started_at, updated_at,
                         finished_at)
                    VALUES ($1, 'RUNNING', NULL, $2, $3, $4, $5, $6, NULL, NOW(), NOW(), NULL)
                    ON CONFLICT (bot_id) DO UPDATE
                    SET state = 'RUNNING',
                        cursor_user_id = NULL,
                        total = EXCLUDED.total,
                        ok_count = EXCLUDED.ok_count,
                        blocked_count = EXCLUDED.blocked_count,
                        not_started_count = EXCLUDED.not_started_count,
                        other_error_count = EXCLUDED.other_error_count,
                        error = NULL,
                        started_at = NOW(),
                        updated_at = NOW(),
                        finished_at = NULL
                    RETURNING {JOB_COLUMNS}
                    "#
                ))
                .bind(bot_id)
                .bind(total)
                .bind(seeded.ok)
                .bind(seeded.blocked)
                .bind(seeded.not_started)
                .bind(seeded.other_error)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        let job = job_from_row(&row)?;
        tx.commit().await?;
        Ok(job)
    }

    async fn get_job(&self, bot_id: BotId) -> Result<Option<VerificationJob>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM verification_jobs WHERE bot_id = $1"
        ))
        .bind(bot_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn running_jobs(&self) -> Result<Vec<VerificationJob>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM verification_jobs
            WHERE state = 'RUNNING'
              AND bot_id IN (SELECT id FROM bots WHERE deleted_at IS NULL)
            ORDER BY started_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn next_pending(
        &self,
        bot_id: BotId,
        after: Option<UserId>,
    ) -> Result<Option<AudienceRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT bot_id, user_id, locale, status, attempts, last_attempted_at
            FROM audience_records
            WHERE bot_id = $1
              AND status = 'PENDING'
              AND ($2::BIGINT IS NULL OR user_id > $2)
            ORDER BY user_id ASC
            LIMIT 1
            "#,
        )
        .bind(bot_id)
        .bind(after)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn record_outcome(
        &self,
        bot_id: BotId,
        update: &OutcomeUpdate,
    ) -> Result<RecordOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let job = match lock_job(&mut tx, bot_id).await? {
            Some(job) if job.state == JobState::Running => job,
            _ => return Ok(RecordOutcome::Inactive),
        };
        if job.cursor.is_some_and(|cursor| cursor >= update.user_id) {
            return Ok(RecordOutcome::Duplicate);
        }

        let marked = sqlx::query(
            r#"
            UPDATE audience_records
            SET status = $3,
                attempts = attempts + $4,
                last_attempted_at = $5
            WHERE bot_id = $1 AND user_id = $2 AND status = 'PENDING'
            "#,
        )
        .bind(bot_id)
        .bind(update.user_id)
        .bind(RecordStatus::from(update.outcome).to_string())
        .bind(update.attempts)
        .bind(update.attempted_at)
        .execute(&mut *tx)
        .await?;

        if marked.rows_affected() == 0 {
            return Ok(RecordOutcome::Duplicate);
        }

        let column = counter_column(update.outcome);
        let row = sqlx::query(&format!(
            r#"
            UPDATE verification_jobs
            SET {column} = {column} + 1,
                cursor_user_id = $2,
                updated_at = $3
            WHERE bot_id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(bot_id)
        .bind(update.user_id)
        .bind(update.attempted_at)
        .fetch_one(&mut *tx)
        .await?;

        let job = job_from_row(&row)?;
        tx.commit().await?;
        Ok(RecordOutcome::Applied(job))
    }

    async fn complete_job(&self, bot_id: BotId) -> Result<Completion, StoreError> {
        let mut tx = self.pool.begin().await?;

        let job = match lock_job(&mut tx, bot_id).await? {
            Some(job) if job.state == JobState::Running => job,
            _ => return Ok(Completion::Inactive),
        };

        if has_pending(&mut tx, bot_id, job.cursor).await? {
            return Ok(Completion::MoreWork);
        }

        let completion = if has_pending(&mut tx, bot_id, None).await? {
            let (total, _) = audience_totals(&mut tx, bot_id).await?;
            sqlx::query(
                r#"
                UPDATE verification_jobs
                SET cursor_user_id = NULL, total = $2, started_at = NOW(), updated_at = NOW()
                WHERE bot_id = $1
                "#,
            )
            .bind(bot_id)
            .bind(total)
            .execute(&mut *tx)
            .await?;
            Completion::Restarted
        } else {
            sqlx::query(
                r#"
                UPDATE verification_jobs
                SET state = 'COMPLETED', updated_at = NOW(), finished_at = NOW()
                WHERE bot_id = $1
                "#,
            )
            .bind(bot_id)
            .execute(&mut *tx)
            .await?;
            Completion::Completed
        };

        tx.commit().await?;
        Ok(completion)
    }

    async fn fail_job(&self, bot_id: BotId, reason: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE verification_jobs
            SET state = 'FAILED', error = $2, updated_at = NOW(), finished_at = NOW()
            WHERE bot_id = $1 AND state = 'RUNNING'
            "#,
        )
        .bind(bot_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn pending_count(&self, bot_id: BotId) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        count_pending(&mut conn, bot_id).await
    }

    async fn locale_breakdown(&self, bot_id: BotId) -> Result<Vec<LocaleStats>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        locale_stats(&mut conn, bot_id).await
    }

    async fn status_snapshot(&self, bot_id: BotId) -> Result<Option<StatusSnapshot>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM verification_jobs WHERE bot_id = $1"
        ))
        .bind(bot_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let job = job_from_row(&row)?;
        let pending = count_pending(&mut tx, bot_id).await?;
        let locales = locale_stats(&mut tx, bot_id).await?;
        tx.commit().await?;

        Ok(Some(StatusSnapshot { job, pending, locales }))
    }

    async fn bot_token(&self, bot_id: BotId) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT token_encrypted
            FROM bots
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(bot_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(r) => Some(r.try_get("token_encrypted")?),
            None => None,
        })
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
