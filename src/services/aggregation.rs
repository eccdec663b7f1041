//! Post-ingestion aggregation
//!
//! Rebuilds every monthly aggregate table of a job inside one transaction,
//! so readers see either the previous aggregates or the complete new set.

use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::queries::aggregates::{self, CATEGORIES};
use crate::error::JobError;
use crate::types::TaxRates;

/// Aggregate rows written, per category name
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AggregationReport {
    pub rows: Vec<(&'static str, u64)>,
}

impl AggregationReport {
    pub fn total_rows(&self) -> u64 {
        self.rows.iter().map(|(_, n)| n).sum()
    }
}

fn failed(e: impl std::fmt::Display) -> JobError {
    JobError::Aggregation(e.to_string())
}

pub async fn run(pool: &PgPool, job_id: Uuid, rates: &TaxRates) -> Result<AggregationReport, JobError> {
    let mut tx = pool.begin().await.map_err(failed)?;

    aggregates::clear_for_job(&mut tx, job_id)
        .await
        .map_err(|e| failed(format!("{:#}", e)))?;

    let mut report = AggregationReport::default();
    for category in CATEGORIES {
        let rows = aggregates::fan_out(&mut tx, category, job_id, rates)
            .await
            .map_err(|e| failed(format!("{}: {:#}", category.name, e)))?;
        debug!(%job_id, category = category.name, rows, "Aggregated");
        report.rows.push((category.name, rows));
    }

    tx.commit().await.map_err(failed)?;

    info!(%job_id, rows = report.total_rows(), year = rates.year, "Aggregation complete");
    Ok(report)
}
