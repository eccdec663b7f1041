//! Job dispatcher
//!
//! A fixed pool of polling workers claims pending jobs with
//! `FOR UPDATE SKIP LOCKED`. The supervisor keeps the pool at its configured
//! size: a worker that panics is logged and replaced.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::db::{self, queries};
use crate::defaults::PICKUP_PROBE_ATTEMPTS;
use crate::services::cancellation::CancellationRegistry;
use crate::services::ingest::{self, IngestContext};

const PICKUP_PROBE_BASE: Duration = Duration::from_millis(250);

pub struct Dispatcher {
    ctx: Arc<IngestContext>,
    cancellations: CancellationRegistry,
}

impl Dispatcher {
    pub fn new(ctx: Arc<IngestContext>, cancellations: CancellationRegistry) -> Self {
        Self { ctx, cancellations }
    }

    /// Startup sweep: jobs left `processing` by a dead worker go back to
    /// `pending` with their checkpoint intact, jobs left `cancelling` end as
    /// cancelled. Returns the number of rows touched.
    pub async fn recover_stale_jobs(&self) -> Result<u64> {
        let recovered = queries::jobs::requeue_stuck_processing(&self.ctx.pool).await?;
        if recovered > 0 {
            warn!(jobs = recovered, "Re-queued jobs left in processing by a previous run");
        }
        let cancelled = queries::jobs::finish_stuck_cancelling(&self.ctx.pool).await?;
        if cancelled > 0 {
            warn!(jobs = cancelled, "Closed jobs left in cancelling by a previous run");
        }
        Ok(recovered + cancelled)
    }

    /// Run the worker pool until shutdown
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let shutdown = self.cancellations.shutdown_token();
        let size = self.ctx.config.worker_count;
        let mut workers = JoinSet::new();

        for slot in 0..size {
            self.spawn_worker(&mut workers, slot);
        }
        info!(workers = size, "Dispatcher started");

        let mut next_slot = size;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                joined = workers.join_next() => match joined {
                    Some(Ok(_)) if shutdown.is_cancelled() => break,
                    Some(Ok(slot)) => {
                        warn!(worker = slot, "Worker exited, restarting");
                        self.spawn_worker(&mut workers, slot);
                    }
                    Some(Err(e)) => {
                        error!("Worker task failed: {}", e);
                        self.spawn_worker(&mut workers, next_slot);
                        next_slot += 1;
                    }
                    None => break,
                },
            }
        }

        let active = self.cancellations.active_jobs();
        info!(
            workers = workers.len(),
            jobs = active.len(),
            "Shutting down, waiting for workers to release their jobs"
        );
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!("Worker ended abnormally during shutdown: {}", e);
            }
        }

        info!("Dispatcher stopped");
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, workers: &mut JoinSet<usize>, slot: usize) {
        let dispatcher = Arc::clone(self);
        workers.spawn(dispatcher.supervised_worker(slot));
    }

    /// Worker loop with panics caught; yields the slot back to the supervisor
    async fn supervised_worker(self: Arc<Self>, slot: usize) -> usize {
        let outcome = AssertUnwindSafe(self.worker_loop(slot)).catch_unwind().await;
        if let Err(panic) = outcome {
            error!(worker = slot, "Worker panicked: {}", panic_message(panic.as_ref()));
        }
        slot
    }

    async fn worker_loop(&self, slot: usize) {
        let shutdown = self.cancellations.shutdown_token();
        info!(worker = slot, "Worker started");

        while !shutdown.is_cancelled() {
            let processed = match self.poll_once(slot).await {
                Ok(processed) => processed,
                Err(e) => {
                    error!(worker = slot, "Poll cycle failed: {:#}", e);
                    false
                }
            };

            // Look for the next job right away after finishing one
            if processed {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.ctx.config.poll_interval) => {}
                _ = shutdown.cancelled() => {}
            }
        }

        info!(worker = slot, "Worker stopped");
    }

    /// One poll cycle. Returns whether a job was processed.
    pub async fn poll_once(&self, slot: usize) -> Result<bool> {
        if !db::ping_with_retry(&self.ctx.pool, PICKUP_PROBE_ATTEMPTS, PICKUP_PROBE_BASE).await {
            warn!(worker = slot, "Database unreachable, skipping poll cycle");
            return Ok(false);
        }

        let Some(job) = queries::jobs::claim_next_pending(&self.ctx.pool).await? else {
            return Ok(false);
        };

        info!(worker = slot, job_id = %job.id, filename = %job.filename, "Claimed job");
        let guard = self.cancellations.register(job.id);
        ingest::run_job(&self.ctx, job, &guard).await?;
        Ok(true)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
