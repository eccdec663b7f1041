//! Operator commands: submit a file, inspect a job, cancel a job.
//!
//! These stand in for the upload service and the status API, which write
//! and read the same `import_jobs` rows.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::db::queries;
use crate::types::{JobStatus, JobSummary};

/// Copy `source` into the upload directory and queue a pending job for it
pub async fn enqueue_file(pool: &PgPool, config: &Config, source: &Path) -> Result<Uuid> {
    let name = upload_name(source)?;
    let job_id = Uuid::new_v4();
    let stored_name = format!("{}_{}", job_id, name);

    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| format!("Failed to create upload directory {}", config.upload_dir.display()))?;

    let target: PathBuf = config.upload_dir.join(&stored_name);
    tokio::fs::copy(source, &target)
        .await
        .with_context(|| format!("Failed to copy {} into {}", source.display(), target.display()))?;

    queries::jobs::insert_pending(pool, job_id, &stored_name).await?;

    info!(%job_id, file = %stored_name, "Job queued");
    println!("Queued job {job_id} for {name}");
    Ok(job_id)
}

/// Print the job row and its summary
pub async fn print_status(pool: &PgPool, job_id: Uuid) -> Result<()> {
    let Some(job) = queries::jobs::get_job(pool, job_id).await? else {
        bail!("Job {job_id} not found");
    };

    println!("Job:        {}", job.id);
    println!("File:       {}", job.filename);
    println!("Status:     {}", job.status);
    println!("Message:    {}", job.message);
    if let Some(cnpj) = &job.cnpj {
        println!(
            "Branch:     {} ({})",
            cnpj,
            job.company_name.as_deref().unwrap_or("-")
        );
    }
    if let (Some(start), Some(end)) = (job.period_start, job.period_end) {
        println!("Period:     {} .. {}", start, end);
    }
    println!("Checkpoint: line {}", job.last_line_processed);

    if job.status.is_terminal() {
        let summary: Option<sqlx::types::Json<JobSummary>> =
            sqlx::query_scalar("SELECT summary FROM import_jobs WHERE id = $1")
                .bind(job_id)
                .fetch_one(pool)
                .await
                .context("Failed to read job summary")?;
        if let Some(summary) = summary {
            println!("Summary:    {}", serde_json::to_string_pretty(&summary.0)?);
        }
    }
    Ok(())
}

/// Request cancellation of a queued or running job
pub async fn cancel_job(pool: &PgPool, job_id: Uuid) -> Result<()> {
    match queries::jobs::request_cancel(pool, job_id).await? {
        Some(JobStatus::Error) => println!("Job {job_id} removed from the queue"),
        Some(status) => println!("Job {job_id} is {status}; it stops at its next batch boundary"),
        None => bail!("Job {job_id} is not pending or processing"),
    }
    Ok(())
}

/// File name part used in the stored upload name
fn upload_name(source: &Path) -> Result<String> {
    let name = source
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .with_context(|| format!("Not a file path: {}", source.display()))?;

    if !source.is_file() {
        bail!("File not found: {}", source.display());
    }
    Ok(name.replace(char::is_whitespace, "_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_name_rejects_missing_file() {
        let path = std::env::temp_dir().join(format!("absent-{}.txt", Uuid::new_v4()));
        assert!(upload_name(&path).is_err());
    }

    #[test]
    fn test_upload_name_rejects_directory_path() {
        assert!(upload_name(Path::new("/")).is_err());
    }

    #[tokio::test]
    async fn test_upload_name_replaces_whitespace() {
        let path = std::env::temp_dir().join(format!("sped jan {}.txt", Uuid::new_v4()));
        tokio::fs::write(&path, b"|0000|").await.unwrap();

        let name = upload_name(&path).unwrap();

        assert!(name.starts_with("sped_jan_"));
        assert!(!name.contains(' '));
        tokio::fs::remove_file(&path).await.unwrap();
    }
}
