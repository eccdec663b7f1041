//! Cancellation registry for running import jobs
//!
//! Every claimed job gets a child token of the worker's root token, so a
//! process shutdown reaches all jobs at once while an external cancel only
//! reaches one. `JobGuard` removes the entry when processing ends.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why a job has to stop at its next batch boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Cancelled through the job row
    Requested,
    /// The worker process is shutting down
    Shutdown,
}

/// RAII guard that removes the job from the registry when dropped.
/// Must be kept alive for the duration of job processing.
pub struct JobGuard {
    job_id: Uuid,
    token: CancellationToken,
    registry: CancellationRegistry,
}

impl JobGuard {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Token cancelled by either a job cancel or a shutdown
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Mark this job cancelled (the job row says `cancelling`)
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// `None` while the job may keep going. Shutdown wins over a cancel
    /// request, because an interrupted job is resumed later.
    pub fn stop_reason(&self) -> Option<StopReason> {
        if self.registry.is_shutting_down() {
            Some(StopReason::Shutdown)
        } else if self.token.is_cancelled() {
            Some(StopReason::Requested)
        } else {
            None
        }
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.job_id);
    }
}

/// Root shutdown token plus the ids of jobs currently being processed.
/// Each job's own token lives in its `JobGuard`.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    root: CancellationToken,
    jobs: Arc<Mutex<HashSet<Uuid>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a claimed job. Hold the returned guard while processing.
    pub fn register(&self, job_id: Uuid) -> JobGuard {
        self.jobs.lock().insert(job_id);
        JobGuard {
            job_id,
            token: self.root.child_token(),
            registry: self.clone(),
        }
    }

    /// Stop every worker and every running job
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Root token, awaited by worker loops and the supervisor
    pub fn shutdown_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Jobs currently registered, for shutdown logging
    pub fn active_jobs(&self) -> Vec<Uuid> {
        self.jobs.lock().iter().copied().collect()
    }

    fn remove(&self, job_id: &Uuid) {
        self.jobs.lock().remove(job_id);
    }

    #[cfg(test)]
    fn contains(&self, job_id: &Uuid) -> bool {
        self.jobs.lock().contains(job_id)
    }
}
