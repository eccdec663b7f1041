//! Import job runner
//!
//! Takes one claimed job to a terminal state (or back to the queue):
//! integrity gate, streaming parse with checkpoints, aggregation, summary.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use sqlx::PgPool;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::{self, queries};
use crate::error::JobError;
use crate::services::aggregation;
use crate::services::batch_writer::{BatchSettings, BatchWriter};
use crate::services::cancellation::JobGuard;
use crate::services::integrity;
use crate::services::parser::{
    BranchContext, EfdParser, HandlerRegistry, OpenDocument, ParseOutcome, PgTaxRates, ResumePoint,
};
use crate::types::{ImportJob, JobSummary};

const STORE_PROBE_ATTEMPTS: u32 = 3;
const STORE_PROBE_BASE: Duration = Duration::from_millis(500);

/// Shared by every worker
pub struct IngestContext {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub registry: HandlerRegistry,
}

impl IngestContext {
    pub fn new(pool: PgPool, config: Arc<Config>) -> Self {
        let registry = HandlerRegistry::standard();
        debug!(tags = ?registry.tags(), "Record handlers registered");
        Self {
            pool,
            config,
            registry,
        }
    }
}

/// Run a claimed job and record how it ended. Errors returned here are
/// failures to write the outcome itself.
pub async fn run_job(ctx: &IngestContext, job: ImportJob, guard: &JobGuard) -> Result<()> {
    let started = Instant::now();
    let job_id = job.id;

    info!(
        %job_id,
        filename = %job.filename,
        checkpoint = job.last_line_processed,
        "Processing import job"
    );

    match execute(ctx, &job, guard).await {
        Ok(mut summary) => {
            summary.duration_ms = started.elapsed().as_millis() as u64;
            queries::jobs::mark_completed(&ctx.pool, job_id, &summary).await?;
            info!(
                %job_id,
                lines = summary.lines_processed,
                rows = summary.total_rows(),
                duration_ms = summary.duration_ms,
                "Import job completed"
            );
        }
        Err(e) if e.is_requeue() => {
            let message = format!("Re-queued: {} (resuming from last checkpoint)", e);
            queries::jobs::requeue(&ctx.pool, job_id, &message).await?;
            warn!(%job_id, "Import job re-queued: {}", e);
        }
        Err(e) => {
            queries::jobs::mark_error(&ctx.pool, job_id, &e.status_message()).await?;
            match e {
                JobError::Cancelled { line } => info!(%job_id, line, "Import job cancelled"),
                other => error!(%job_id, "Import job failed: {}", other),
            }
        }
    }

    Ok(())
}

async fn execute(ctx: &IngestContext, job: &ImportJob, guard: &JobGuard) -> Result<JobSummary, JobError> {
    let path = ctx.config.upload_dir.join(&job.filename);
    let report = integrity::validate(&path).await?;
    debug!(job_id = %job.id, bytes = report.file_size, "File passed integrity check");

    if !db::ping_with_retry(&ctx.pool, STORE_PROBE_ATTEMPTS, STORE_PROBE_BASE).await {
        return Err(JobError::StoreUnavailable("probe failed before parsing".to_string()));
    }

    let resume = load_resume_point(&ctx.pool, job).await?;
    if resume.line > 0 {
        info!(job_id = %job.id, line = resume.line, "Resuming from checkpoint");
    }

    let rates = PgTaxRates::new(ctx.pool.clone());
    let parser = EfdParser::new(&ctx.registry, &rates, ctx.config.batch_size);
    let mut writer = BatchWriter::open(ctx.pool.clone(), BatchSettings::from_config(&ctx.config), guard).await?;

    let outcome = match parser.parse_file(&path, resume, &mut writer).await {
        Ok(outcome) => outcome,
        Err(e) => {
            writer.abort().await;
            return Err(e);
        }
    };

    if let Err(e) = queries::jobs::update_progress(&ctx.pool, job.id, "Aggregating").await {
        warn!(job_id = %job.id, "Failed to update progress: {:#}", e);
    }
    aggregation::run(&ctx.pool, job.id, &outcome.rates).await?;
    debug!(job_id = %job.id, cnpj = %outcome.branch.cnpj, "Aggregates rebuilt");

    Ok(build_summary(outcome, report.terminator_in_tail))
}

/// Branch context from the job row, open document from the last stored
/// `C100`, counts from the rows already committed
async fn load_resume_point(pool: &PgPool, job: &ImportJob) -> Result<ResumePoint, JobError> {
    let line = job.checkpoint();
    if line == 0 {
        return Ok(ResumePoint::fresh());
    }

    let counts = queries::records::count_rows_by_tag(pool, job.id).await?;
    let open_document = queries::records::last_document(pool, job.id)
        .await?
        .map(|(id, direction)| OpenDocument { id, direction });
    let branch = job.cnpj.as_ref().map(|cnpj| BranchContext {
        cnpj: cnpj.clone(),
        period_start: job.period_start,
        period_end: job.period_end,
    });

    Ok(ResumePoint {
        line,
        branch,
        open_document,
        counts,
    })
}

fn build_summary(outcome: ParseOutcome, terminator_in_tail: bool) -> JobSummary {
    let mut warnings = Vec::new();
    if !outcome.found_terminator {
        warnings.push("end-of-file marker |9999| not found; the file may be truncated".to_string());
    } else if !terminator_in_tail {
        warnings.push("end-of-file marker is not near the end of the file".to_string());
    }

    JobSummary {
        record_counts: outcome.record_counts,
        lines_processed: outcome.lines_processed,
        resumed_from_line: outcome.resumed_from_line,
        skipped_lines: outcome.skipped_lines,
        terminator_found: outcome.found_terminator,
        warnings,
        duration_ms: 0,
    }
}
