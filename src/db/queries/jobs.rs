//! Import job queries
//!
//! Status transitions are guarded in SQL (`WHERE status = ...`) so a row in a
//! terminal state is never rewritten by a late worker.

use anyhow::Result;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::types::{BranchHeader, ImportJob, JobStatus, JobSummary};

const JOB_COLUMNS: &str = r#"
    id, filename, status, message, company_name, cnpj,
    period_start, period_end, last_line_processed, created_at, updated_at
"#;

// =============================================================================
// SUBMISSION / READS
// =============================================================================

/// Insert a pending job (what the upload collaborator does)
pub async fn insert_pending(pool: &PgPool, id: Uuid, filename: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO import_jobs (id, filename, status, message, created_at, updated_at)
        VALUES ($1, $2, 'pending', 'Waiting for a worker', NOW(), NOW())
        "#,
    )
    .bind(id)
    .bind(filename)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_job(pool: &PgPool, id: Uuid) -> Result<Option<ImportJob>> {
    let job = sqlx::query_as::<_, ImportJob>(&format!(
        "SELECT {} FROM import_jobs WHERE id = $1",
        JOB_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(job)
}

/// Current status, read fresh for cooperative cancellation
pub async fn get_status(pool: &PgPool, id: Uuid) -> Result<Option<JobStatus>> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM import_jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(match status {
        Some(s) => Some(JobStatus::try_from(s)?),
        None => None,
    })
}

// =============================================================================
// CLAIMING / RECOVERY
// =============================================================================

/// Atomically claim the oldest pending job.
///
/// `FOR UPDATE SKIP LOCKED` lets concurrent workers pass over a row another
/// worker is claiming; the status flip commits together with the lock release.
pub async fn claim_next_pending(pool: &PgPool) -> Result<Option<ImportJob>> {
    let mut tx: Transaction<'_, Postgres> = pool.begin().await?;

    let candidate: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT id FROM import_jobs
        WHERE status = 'pending'
        ORDER BY created_at
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .fetch_optional(&mut *tx)
    .await?;

    let Some(id) = candidate else {
        tx.rollback().await?;
        return Ok(None);
    };

    let job = sqlx::query_as::<_, ImportJob>(&format!(
        r#"
        UPDATE import_jobs
        SET status = 'processing', message = 'Claimed by worker', updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        JOB_COLUMNS
    ))
    .bind(id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(job))
}

/// Startup sweep: every `processing` row goes back to `pending`, keeping its
/// checkpoint. Returns the number of rows reset.
pub async fn requeue_stuck_processing(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE import_jobs
        SET status = 'pending',
            message = 'Re-queued after worker restart (resuming at line ' || last_line_processed || ')',
            updated_at = NOW()
        WHERE status = 'processing'
        "#,
    )
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Startup sweep: a `cancelling` row whose worker died never reaches a batch
/// boundary, so it ends here as cancelled. Returns the number of rows closed.
pub async fn finish_stuck_cancelling(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE import_jobs
        SET status = 'error',
            message = 'Cancelled: worker stopped before the cancellation was observed (at line ' || last_line_processed || ')',
            updated_at = NOW()
        WHERE status = 'cancelling'
        "#,
    )
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Hand an interrupted job back to the queue
pub async fn requeue(pool: &PgPool, id: Uuid, message: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE import_jobs
        SET status = 'pending', message = $2, updated_at = NOW()
        WHERE id = $1 AND status IN ('processing', 'cancelling')
        "#,
    )
    .bind(id)
    .bind(message)
    .execute(pool)
    .await?;

    Ok(())
}

// =============================================================================
// PROGRESS
// =============================================================================

/// Record branch identity as soon as the header is parsed
pub async fn update_branch(pool: &PgPool, id: Uuid, header: &BranchHeader) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE import_jobs
        SET company_name = $2, cnpj = $3, period_start = $4, period_end = $5, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(&header.company_name)
    .bind(&header.cnpj)
    .bind(header.period_start)
    .bind(header.period_end)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn update_progress(pool: &PgPool, id: Uuid, message: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE import_jobs
        SET message = $2, updated_at = NOW()
        WHERE id = $1 AND status IN ('processing', 'cancelling')
        "#,
    )
    .bind(id)
    .bind(message)
    .execute(pool)
    .await?;

    Ok(())
}

/// Advance the checkpoint. `GREATEST` keeps it monotonic.
pub async fn set_checkpoint(pool: &PgPool, id: Uuid, line: u64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE import_jobs
        SET last_line_processed = GREATEST(last_line_processed, $2), updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(line as i64)
    .execute(pool)
    .await?;

    Ok(())
}

// =============================================================================
// TERMINAL STATES
// =============================================================================

pub async fn mark_completed(pool: &PgPool, id: Uuid, summary: &JobSummary) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE import_jobs
        SET status = 'completed', message = $2, summary = $3, updated_at = NOW()
        WHERE id = $1 AND status IN ('processing', 'cancelling')
        "#,
    )
    .bind(id)
    .bind(summary.completion_message())
    .bind(sqlx::types::Json(summary))
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn mark_error(pool: &PgPool, id: Uuid, message: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE import_jobs
        SET status = 'error', message = $2, updated_at = NOW()
        WHERE id = $1 AND status IN ('processing', 'cancelling')
        "#,
    )
    .bind(id)
    .bind(message)
    .execute(pool)
    .await?;

    Ok(())
}

/// External cancellation request.
///
/// A running job is flagged `cancelling` and stops at its next batch
/// boundary; a job nobody claimed yet ends right away. Returns the status the
/// job moved to, or `None` when it was already finished or unknown.
pub async fn request_cancel(pool: &PgPool, id: Uuid) -> Result<Option<JobStatus>> {
    let status: Option<String> = sqlx::query_scalar(
        r#"
        UPDATE import_jobs
        SET status = CASE WHEN status = 'pending' THEN 'error' ELSE 'cancelling' END,
            message = CASE WHEN status = 'pending'
                           THEN 'Cancelled: removed from queue before processing'
                           ELSE 'Cancellation requested' END,
            updated_at = NOW()
        WHERE id = $1 AND status IN ('pending', 'processing')
        RETURNING status
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(match status {
        Some(s) => Some(JobStatus::try_from(s)?),
        None => None,
    })
}
