//! Job outcome errors
//!
//! Plumbing code uses `anyhow`; anything that decides how a job ends is a
//! `JobError`, because the variant picks the terminal status and message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    /// File-level rejection before any row is written
    #[error("invalid file: {0}")]
    InvalidFile(String),

    /// Cancellation requested through the job row, observed at a batch boundary
    #[error("cancelled at line {line}")]
    Cancelled { line: u64 },

    /// Worker shutdown observed at a batch boundary
    #[error("interrupted by shutdown at line {line}")]
    Interrupted { line: u64 },

    /// Begin/prepare/commit failed after all retries
    #[error("transaction failure: {0}")]
    Transaction(String),

    #[error("aggregation failed: {0}")]
    Aggregation(String),

    /// Store unreachable before work started; the job goes back to the queue
    #[error("database unavailable: {0}")]
    StoreUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    /// Message written to `import_jobs.message` for a failed job.
    ///
    /// Cancellations share the `error` status with genuine failures, so the
    /// prefix is what tells them apart.
    pub fn status_message(&self) -> String {
        match self {
            JobError::Cancelled { line } => {
                format!("Cancelled: stopped by request at line {}; current batch rolled back", line)
            }
            other => format!("Error: {}", other),
        }
    }

    /// Whether the job should be handed back to the queue instead of failing
    pub fn is_requeue(&self) -> bool {
        matches!(
            self,
            JobError::Interrupted { .. } | JobError::StoreUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_message_is_distinguishable() {
        let msg = JobError::Cancelled { line: 4000 }.status_message();
        assert!(msg.starts_with("Cancelled:"));
        assert!(msg.contains("4000"));
    }

    #[test]
    fn test_failure_message_has_error_prefix() {
        let msg = JobError::InvalidFile("missing |0000| header".into()).status_message();
        assert_eq!(msg, "Error: invalid file: missing |0000| header");
    }

    #[test]
    fn test_only_interruption_and_outage_requeue() {
        assert!(JobError::Interrupted { line: 2000 }.is_requeue());
        assert!(JobError::StoreUnavailable("ping failed".into()).is_requeue());
        assert!(!JobError::Cancelled { line: 2000 }.is_requeue());
        assert!(!JobError::Transaction("x".into()).is_requeue());
    }
}
