//! Import job types
//!
//! An `ImportJob` row is both the unit of work and its own state machine:
//! `pending → processing → (completed | error | cancelling → error)`.
//! The only way back to `pending` is the startup recovery sweep.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ==========================================================================
// Tests First (TDD)
// ==========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Error,
            JobStatus::Cancelling,
        ] {
            assert_eq!(JobStatus::try_from(status.as_str().to_string()), Ok(status));
        }
    }

    #[test]
    fn test_job_status_rejects_unknown_value() {
        let err = JobStatus::try_from("queued".to_string()).unwrap_err();
        assert_eq!(err.0, "queued");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(!JobStatus::Cancelling.is_terminal());
    }

    #[test]
    fn test_summary_total_rows_sums_every_tag() {
        let mut summary = JobSummary::default();
        summary.record_counts.insert("C100".to_string(), 3);
        summary.record_counts.insert("C170".to_string(), 7);
        assert_eq!(summary.total_rows(), 10);
    }

    #[test]
    fn test_summary_serializes_to_camel_case() {
        let summary = JobSummary {
            lines_processed: 42,
            resumed_from_line: 10,
            skipped_lines: 1,
            terminator_found: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("linesProcessed"));
        assert!(json.contains("resumedFromLine"));
        assert!(json.contains("terminatorFound"));
    }
}

// ==========================================================================
// Job status
// ==========================================================================

/// Lifecycle state stored in `import_jobs.status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Error,
    Cancelling,
}

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Cancelling => "cancelling",
        }
    }

    /// `completed` and `error` rows are never touched again by a worker
    pub const fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status column held a value outside the state machine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job status '{0}'")]
pub struct UnknownJobStatus(pub String);

impl TryFrom<String> for JobStatus {
    type Error = UnknownJobStatus;

    fn try_from(value: String) -> Result<Self, UnknownJobStatus> {
        match value.as_str() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "error" => Ok(JobStatus::Error),
            "cancelling" => Ok(JobStatus::Cancelling),
            _ => Err(UnknownJobStatus(value)),
        }
    }
}

// ==========================================================================
// Job row
// ==========================================================================

/// One row of `import_jobs`
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: Uuid,
    pub filename: String,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub message: String,
    pub company_name: Option<String>,
    pub cnpj: Option<String>,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub last_line_processed: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportJob {
    /// Lines already committed by an earlier run of this job
    pub fn checkpoint(&self) -> u64 {
        self.last_line_processed.max(0) as u64
    }
}

/// Completion report stored in `import_jobs.summary`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    /// Rows persisted per record tag (includes rows committed before a resume)
    pub record_counts: BTreeMap<String, u64>,
    pub lines_processed: u64,
    pub resumed_from_line: u64,
    /// Recognized lines dropped for too few fields or unusable values
    pub skipped_lines: u64,
    pub terminator_found: bool,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

impl JobSummary {
    pub fn total_rows(&self) -> u64 {
        self.record_counts.values().sum()
    }

    /// Human-readable completion message, e.g.
    /// `Completed: 1520 lines (0150=12, C100=40, C170=180)`
    pub fn completion_message(&self) -> String {
        let counts = self
            .record_counts
            .iter()
            .map(|(tag, count)| format!("{}={}", tag, count))
            .collect::<Vec<_>>()
            .join(", ");

        let mut message = format!("Completed: {} lines ({})", self.lines_processed, counts);
        for warning in &self.warnings {
            message.push_str(" | Warning: ");
            message.push_str(warning);
        }
        message
    }
}
