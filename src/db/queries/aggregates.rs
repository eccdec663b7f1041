//! Monthly aggregate fan-out
//!
//! Each category is one `INSERT ... SELECT ... GROUP BY` over the job's raw
//! rows. Projections are computed from the grouped sums with the same
//! formulas as `TaxRates::project`. Undated rows count toward the month the
//! job's period starts in.

use anyhow::Result;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::types::TaxRates;

/// Target table and the source rows feeding it. Every source exposes
/// `job_id, branch_cnpj, cod_part, dt_doc, direction, vl_doc, vl_icms,
/// vl_pis, vl_cofins`.
pub struct AggregateCategory {
    pub name: &'static str,
    pub table: &'static str,
    pub source: &'static str,
}

pub const CATEGORIES: &[AggregateCategory] = &[
    AggregateCategory {
        name: "commercial",
        table: "agg_commercial_monthly",
        source: r#"
            SELECT job_id, branch_cnpj, cod_part, dt_doc, direction, vl_doc, vl_icms, vl_pis, vl_cofins
            FROM efd_c100 WHERE job_id = $1
        "#,
    },
    AggregateCategory {
        name: "energy",
        table: "agg_energy_monthly",
        source: r#"
            SELECT job_id, branch_cnpj, cod_part, dt_doc, direction, vl_doc, vl_icms, vl_pis, vl_cofins
            FROM efd_c500 WHERE job_id = $1
            UNION ALL
            SELECT job_id, branch_cnpj, '' AS cod_part, dt_doc, direction, vl_doc, vl_icms, vl_pis, vl_cofins
            FROM efd_c600 WHERE job_id = $1
        "#,
    },
    AggregateCategory {
        name: "transport",
        table: "agg_transport_monthly",
        source: r#"
            SELECT job_id, branch_cnpj, cod_part, dt_doc, direction, vl_doc, vl_icms, vl_pis, vl_cofins
            FROM efd_d100 WHERE job_id = $1
        "#,
    },
    AggregateCategory {
        name: "communication",
        table: "agg_communication_monthly",
        source: r#"
            SELECT job_id, branch_cnpj, cod_part, dt_doc, direction, vl_doc, vl_icms, vl_pis, vl_cofins
            FROM efd_d500 WHERE job_id = $1
        "#,
    },
];

/// Build the fan-out statement for one category.
///
/// Binds: `$1` job id, `$2` ICMS reduction %, `$3` IBS state %, `$4` IBS
/// municipal %, `$5` CBS %, `$6` PIS/COFINS reduction %.
pub fn fan_out_sql(category: &AggregateCategory) -> String {
    format!(
        r#"
        INSERT INTO {table} (job_id, branch_cnpj, cod_part, month, direction, document_count,
            vl_doc, vl_icms, vl_pis, vl_cofins,
            vl_icms_projected, vl_ibs_projected, vl_cbs_projected, vl_pis_cofins_projected)
        SELECT job_id, branch_cnpj, cod_part, month, direction, COUNT(*),
            SUM(vl_doc), SUM(vl_icms), SUM(vl_pis), SUM(vl_cofins),
            SUM(vl_icms) * (1.0 - $2::float8 / 100.0),
            (SUM(vl_doc) - SUM(vl_icms)) * ($3::float8 + $4::float8) / 100.0,
            (SUM(vl_doc) - SUM(vl_icms)) * $5::float8 / 100.0,
            (SUM(vl_pis) + SUM(vl_cofins)) * (1.0 - $6::float8 / 100.0)
        FROM (
            SELECT raw.job_id, raw.branch_cnpj, raw.cod_part,
                   date_trunc('month', COALESCE(raw.dt_doc, job.period_start))::date AS month,
                   raw.direction, raw.vl_doc, raw.vl_icms, raw.vl_pis, raw.vl_cofins
            FROM ({source}) raw
            JOIN import_jobs job ON job.id = raw.job_id
        ) src
        WHERE month IS NOT NULL
        GROUP BY job_id, branch_cnpj, cod_part, month, direction
        "#,
        table = category.table,
        source = category.source,
    )
}

/// Drop previous aggregates of the job so a rerun recomputes from scratch
pub async fn clear_for_job(conn: &mut PgConnection, job_id: Uuid) -> Result<()> {
    for category in CATEGORIES {
        sqlx::query(&format!("DELETE FROM {} WHERE job_id = $1", category.table))
            .bind(job_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Run one category's fan-out, returning the number of aggregate rows
pub async fn fan_out(
    conn: &mut PgConnection,
    category: &AggregateCategory,
    job_id: Uuid,
    rates: &TaxRates,
) -> Result<u64> {
    let result = sqlx::query(&fan_out_sql(category))
        .bind(job_id)
        .bind(rates.icms_reduction_pct)
        .bind(rates.ibs_state_rate)
        .bind(rates.ibs_municipal_rate)
        .bind(rates.cbs_rate)
        .bind(rates.pis_cofins_reduction_pct)
        .execute(conn)
        .await?;

    Ok(result.rows_affected())
}
