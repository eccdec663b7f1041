//! Tax-rate configuration queries (read-only for the worker)

use anyhow::Result;
use sqlx::PgPool;

use crate::types::TaxRates;

/// Coefficients configured for `year`, if any
pub async fn find_by_year(pool: &PgPool, year: i32) -> Result<Option<TaxRates>> {
    let rates = sqlx::query_as::<_, TaxRates>(
        r#"
        SELECT year, ibs_state_rate, ibs_municipal_rate, cbs_rate,
               icms_reduction_pct, pis_cofins_reduction_pct
        FROM tax_rates
        WHERE year = $1
        "#,
    )
    .bind(year)
    .fetch_optional(pool)
    .await?;

    Ok(rates)
}
