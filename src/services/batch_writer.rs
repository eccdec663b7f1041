//! Checkpointed batch writer
//!
//! Postgres `RecordSink`. Rows go into one open transaction per batch, each
//! behind its own savepoint so a rejected row does not abort the batch. At a
//! boundary the writer checks for cancellation, reports progress, commits,
//! advances the checkpoint and opens the next batch.
//!
//! The checkpoint is written after the commit on a separate connection. A
//! crash between the two replays at most one batch on resume.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Connection, Executor, PgConnection, PgPool, Postgres, Transaction};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{self, queries};
use crate::defaults::{TX_RETRY_ATTEMPTS, TX_RETRY_BASE_MS, TX_RETRY_MAX_BACKOFF_MS};
use crate::error::JobError;
use crate::services::cancellation::{JobGuard, StopReason};
use crate::services::parser::{InsertOutcome, Progress, RecordSink, RowScope};
use crate::types::{BranchHeader, FiscalRecord, JobStatus};

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub pause: Duration,
    pub retry_attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl BatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pause: config.batch_pause,
            ..Self::default()
        }
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            pause: crate::defaults::default_batch_pause(),
            retry_attempts: TX_RETRY_ATTEMPTS,
            retry_base: Duration::from_millis(TX_RETRY_BASE_MS),
            retry_max: Duration::from_millis(TX_RETRY_MAX_BACKOFF_MS),
        }
    }
}

pub struct BatchWriter<'g> {
    pool: PgPool,
    job_id: Uuid,
    settings: BatchSettings,
    guard: &'g JobGuard,
    tx: Option<Transaction<'static, Postgres>>,
    batches_committed: u64,
}

impl<'g> BatchWriter<'g> {
    /// Open the first batch transaction
    pub async fn open(pool: PgPool, settings: BatchSettings, guard: &'g JobGuard) -> Result<Self, JobError> {
        let mut writer = Self {
            pool,
            job_id: guard.job_id(),
            settings,
            guard,
            tx: None,
            batches_committed: 0,
        };
        writer.tx = Some(writer.begin_batch().await?);
        Ok(writer)
    }

    /// Begin + prepare, retried with backoff. Exhausting the retries fails the job.
    async fn begin_batch(&self) -> Result<Transaction<'static, Postgres>, JobError> {
        let mut last_error = None;

        for attempt in 1..=self.settings.retry_attempts {
            match self.try_begin().await {
                Ok(tx) => return Ok(tx),
                Err(e) => {
                    warn!(
                        job_id = %self.job_id,
                        attempt,
                        "Could not open batch transaction: {}", e
                    );
                    last_error = Some(e);
                    if attempt < self.settings.retry_attempts {
                        let delay = db::retry_delay(attempt, self.settings.retry_base, self.settings.retry_max);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(JobError::Transaction(format!(
            "could not open a batch after {} attempts: {}",
            self.settings.retry_attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn try_begin(&self) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        // Prepared once per connection; the inserts below reuse the cached statements
        for sql in queries::records::INSERT_STATEMENTS {
            let _ = (&mut *tx).prepare(*sql).await?;
        }
        Ok(tx)
    }

    async fn commit(&mut self) -> Result<(), JobError> {
        if let Some(tx) = self.tx.take() {
            tx.commit()
                .await
                .map_err(|e| JobError::Transaction(format!("batch commit failed: {}", e)))?;
            self.batches_committed += 1;
        }
        Ok(())
    }

    /// Roll back the open batch, if any
    pub async fn abort(&mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                warn!(job_id = %self.job_id, "Batch rollback failed: {}", e);
            } else {
                debug!(job_id = %self.job_id, "Open batch rolled back");
            }
        }
    }

    /// Re-read the job row so an external `cancelling` reaches this worker
    async fn check_cancellation(&self, line: u64) -> Result<(), JobError> {
        if self.guard.stop_reason().is_none() {
            match queries::jobs::get_status(&self.pool, self.job_id).await {
                Ok(Some(JobStatus::Cancelling)) => self.guard.cancel(),
                Ok(_) => {}
                Err(e) => warn!(job_id = %self.job_id, "Could not read job status: {:#}", e),
            }
        }

        match self.guard.stop_reason() {
            None => Ok(()),
            Some(StopReason::Requested) => Err(JobError::Cancelled { line }),
            Some(StopReason::Shutdown) => Err(JobError::Interrupted { line }),
        }
    }

    async fn checkpoint(&self, line: u64) {
        // Rows are already committed; a failed write only costs a replayed batch
        if let Err(e) = queries::jobs::set_checkpoint(&self.pool, self.job_id, line).await {
            error!(job_id = %self.job_id, line, "Failed to record checkpoint: {:#}", e);
        }
    }
}

async fn write_row(
    conn: &mut PgConnection,
    job_id: Uuid,
    record: &FiscalRecord,
    scope: &RowScope<'_>,
) -> Result<Option<i64>> {
    let branch = scope.branch_cnpj;
    match record {
        FiscalRecord::Participant(p) => queries::records::insert_participant(conn, job_id, branch, p).await?,
        FiscalRecord::Document(doc) => {
            return Ok(Some(queries::records::insert_document(conn, job_id, branch, doc).await?));
        }
        FiscalRecord::DocumentItem(item) => {
            let parent = scope
                .parent
                .ok_or_else(|| anyhow::anyhow!("item without an open document"))?;
            queries::records::insert_item(conn, job_id, parent.id, branch, parent.direction, item).await?
        }
        FiscalRecord::Energy(doc) => queries::records::insert_energy(conn, job_id, branch, doc).await?,
        FiscalRecord::Consumption(doc) => queries::records::insert_consumption(conn, job_id, branch, doc).await?,
        FiscalRecord::Transport(doc) => queries::records::insert_transport(conn, job_id, branch, doc).await?,
        FiscalRecord::Communication(doc) => {
            queries::records::insert_communication(conn, job_id, branch, doc).await?
        }
        FiscalRecord::Header(_) | FiscalRecord::Terminator => {
            anyhow::bail!("{} is not a stored record", record.tag())
        }
    }
    Ok(None)
}

#[async_trait]
impl<'g> RecordSink for BatchWriter<'g> {
    async fn branch_identified(&mut self, header: &BranchHeader) -> Result<(), JobError> {
        queries::jobs::update_branch(&self.pool, self.job_id, header).await?;
        info!(
            job_id = %self.job_id,
            cnpj = %header.cnpj,
            company = %header.company_name,
            "Branch identified"
        );
        Ok(())
    }

    async fn insert(&mut self, record: &FiscalRecord, scope: RowScope<'_>) -> Result<InsertOutcome, JobError> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| JobError::Transaction("no open batch transaction".to_string()))?;

        let mut savepoint = Connection::begin(&mut **tx).await?;
        match write_row(&mut savepoint, self.job_id, record, &scope).await {
            Ok(id) => {
                savepoint.commit().await?;
                Ok(InsertOutcome::Stored(id))
            }
            Err(e) => {
                warn!(job_id = %self.job_id, tag = record.tag(), "Row rejected: {:#}", e);
                savepoint.rollback().await?;
                Ok(InsertOutcome::Rejected)
            }
        }
    }

    async fn batch_boundary(&mut self, progress: Progress) -> Result<(), JobError> {
        if let Err(e) = self.check_cancellation(progress.line).await {
            self.abort().await;
            return Err(e);
        }

        if let Err(e) = queries::jobs::update_progress(&self.pool, self.job_id, &progress.message()).await {
            warn!(job_id = %self.job_id, "Failed to update progress: {:#}", e);
        }

        self.commit().await?;
        self.checkpoint(progress.line).await;
        debug!(job_id = %self.job_id, line = progress.line, "Batch committed");

        tokio::time::sleep(self.settings.pause).await;
        self.tx = Some(self.begin_batch().await?);
        Ok(())
    }

    async fn finish(&mut self, progress: Progress) -> Result<(), JobError> {
        self.commit().await?;
        self.checkpoint(progress.line).await;
        info!(
            job_id = %self.job_id,
            lines = progress.line,
            batches = self.batches_committed,
            "Streaming phase complete"
        );
        Ok(())
    }
}
