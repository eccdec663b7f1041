//! Configuration management

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{self, Context, Result};

use crate::defaults::{
    DEFAULT_BATCH_PAUSE_MS, DEFAULT_BATCH_SIZE, DEFAULT_DB_MAX_CONNECTIONS,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_WORKER_COUNT,
};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Directory the upload collaborator stores submitted files in
    pub upload_dir: PathBuf,

    /// Number of polling workers
    pub worker_count: usize,

    /// Sleep between polls when the queue is empty
    pub poll_interval: Duration,

    /// Lines committed per batch transaction
    pub batch_size: u64,

    /// Pause after every committed batch
    pub batch_pause: Duration,

    /// Upper bound of the connection pool
    pub db_max_connections: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set")?;

        let upload_dir = std::env::var("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./uploads"));

        let worker_count: usize = env_or("WORKER_COUNT", DEFAULT_WORKER_COUNT)?;
        if worker_count == 0 {
            anyhow::bail!("WORKER_COUNT must be at least 1");
        }

        let batch_size: u64 = env_or("BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            anyhow::bail!("BATCH_SIZE must be at least 1");
        }

        let poll_interval = Duration::from_millis(env_or("POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?);
        let batch_pause = Duration::from_millis(env_or("BATCH_PAUSE_MS", DEFAULT_BATCH_PAUSE_MS)?);
        let db_max_connections: u32 = env_or("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?;

        // Every worker holds one connection for its batch and needs another
        // for progress/checkpoint writes.
        if (db_max_connections as usize) < worker_count * 2 {
            tracing::warn!(
                "DB_MAX_CONNECTIONS={} is below 2 x WORKER_COUNT={}; workers will contend for connections",
                db_max_connections, worker_count
            );
        }

        Ok(Self {
            database_url,
            upload_dir,
            worker_count,
            poll_interval,
            batch_size,
            batch_pause,
            db_max_connections,
        })
    }
}

/// Read an optional numeric variable, falling back to `default` when unset
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{} has invalid value '{}': {}", name, raw, e)),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_uses_default_when_unset() {
        std::env::remove_var("EFD_TEST_UNSET_VALUE");
        let value: u64 = env_or("EFD_TEST_UNSET_VALUE", 7).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_env_or_parses_value() {
        std::env::set_var("EFD_TEST_PARSED_VALUE", " 4500 ");
        let value: u64 = env_or("EFD_TEST_PARSED_VALUE", 7).unwrap();
        assert_eq!(value, 4500);
        std::env::remove_var("EFD_TEST_PARSED_VALUE");
    }

    #[test]
    fn test_env_or_rejects_garbage() {
        std::env::set_var("EFD_TEST_GARBAGE_VALUE", "two thousand");
        let result: Result<u64> = env_or("EFD_TEST_GARBAGE_VALUE", 7);
        assert!(result.is_err());
        std::env::remove_var("EFD_TEST_GARBAGE_VALUE");
    }

    #[test]
    #[ignore] // requires --test-threads=1 due to env var race
    fn test_config_defaults() {
        std::env::set_var("DATABASE_URL", "postgres://test");
        for var in ["UPLOAD_DIR", "WORKER_COUNT", "POLL_INTERVAL_MS", "BATCH_SIZE", "BATCH_PAUSE_MS"] {
            std::env::remove_var(var);
        }

        let config = Config::from_env().unwrap();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.batch_size, 2000);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.upload_dir, PathBuf::from("./uploads"));
    }

    #[test]
    #[ignore] // requires --test-threads=1 due to env var race
    fn test_config_rejects_zero_workers() {
        std::env::set_var("DATABASE_URL", "postgres://test");
        std::env::set_var("WORKER_COUNT", "0");

        assert!(Config::from_env().is_err());

        std::env::remove_var("WORKER_COUNT");
    }
}
