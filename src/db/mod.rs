//! Database module

pub mod queries;

use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::config::Config;

/// Create a database connection pool
pub async fn create_pool(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await?;

    Ok(pool)
}

/// Run embedded migrations.
///
/// The `_sqlx_migrations` history is reconciled with the compiled list first:
/// records of migrations that no longer ship are dropped, and checksums that
/// differ only because of line endings are rewritten.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let migrator = sqlx::migrate!("./migrations");

    reconcile_migration_history(pool, &migrator).await?;
    migrator.run(pool).await?;

    info!("Database migrations complete");
    Ok(())
}

async fn reconcile_migration_history(pool: &PgPool, migrator: &sqlx::migrate::Migrator) -> Result<()> {
    let history_exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = '_sqlx_migrations')",
    )
    .fetch_one(pool)
    .await?;

    if !history_exists {
        return Ok(());
    }

    let applied: Vec<(i64, Vec<u8>)> =
        sqlx::query_as("SELECT version, checksum FROM _sqlx_migrations ORDER BY version")
            .fetch_all(pool)
            .await?;

    for (version, stored_checksum) in applied {
        let compiled = migrator
            .iter()
            .find(|m| m.version == version && !m.migration_type.is_down_migration());

        match compiled {
            None => {
                warn!("Removing migration record {} (no longer shipped)", version);
                sqlx::query("DELETE FROM _sqlx_migrations WHERE version = $1")
                    .bind(version)
                    .execute(pool)
                    .await?;
            }
            Some(m) if stored_checksum.as_slice() != &*m.checksum => {
                warn!("Migration {} ({}) checksum mismatch, updating", version, m.description);
                sqlx::query("UPDATE _sqlx_migrations SET checksum = $1 WHERE version = $2")
                    .bind(&*m.checksum)
                    .bind(version)
                    .execute(pool)
                    .await?;
            }
            Some(_) => {}
        }
    }

    Ok(())
}

/// Connectivity probe
pub async fn ping(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}

/// Probe up to `attempts` times with a short backoff between tries
pub async fn ping_with_retry(pool: &PgPool, attempts: u32, base: Duration) -> bool {
    for attempt in 1..=attempts {
        match ping(pool).await {
            Ok(()) => return true,
            Err(e) => {
                warn!(attempt, "Database probe failed: {}", e);
                if attempt < attempts {
                    tokio::time::sleep(retry_delay(attempt, base, base * 4)).await;
                }
            }
        }
    }
    false
}

/// Exponential backoff for attempt `n` (1-based), capped at `max`, plus up to
/// 25% jitter so parallel workers do not retry in lockstep.
pub fn retry_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    let capped = exp.min(max);
    let jitter_ms = capped.as_millis() as u64 / 4;
    let jitter = if jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=jitter_ms)
    } else {
        0
    };
    capped + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_grows_exponentially() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(10);

        let first = retry_delay(1, base, max);
        let third = retry_delay(3, base, max);

        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let base = Duration::from_millis(200);
        let max = Duration::from_secs(1);

        let delay = retry_delay(30, base, max);
        assert!(delay >= max);
        assert!(delay <= max + max / 4);
    }

    #[test]
    fn test_retry_delay_zero_base() {
        assert_eq!(retry_delay(3, Duration::ZERO, Duration::from_secs(1)), Duration::ZERO);
    }
}
