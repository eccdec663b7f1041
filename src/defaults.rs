use std::time::Duration;

/// Polling workers kept alive by the supervisor
pub const DEFAULT_WORKER_COUNT: usize = 2;

/// Idle sleep between polls when no job is pending
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Lines per batch transaction
pub const DEFAULT_BATCH_SIZE: u64 = 2_000;

/// Pause after each committed batch, yields the store to request traffic
pub const DEFAULT_BATCH_PAUSE_MS: u64 = 50;

pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;

/// Transaction setup attempts before a job is failed
pub const TX_RETRY_ATTEMPTS: u32 = 5;
pub const TX_RETRY_BASE_MS: u64 = 200;
pub const TX_RETRY_MAX_BACKOFF_MS: u64 = 5_000;

/// Connectivity probe attempts at job pickup
pub const PICKUP_PROBE_ATTEMPTS: u32 = 2;

/// Files smaller than this cannot hold a header plus one record
pub const MIN_FILE_SIZE: u64 = 100;
pub const HEADER_WINDOW_BYTES: usize = 1024;
/// Large enough to reach past a trailing signature block
pub const TAIL_WINDOW_BYTES: u64 = 4096;

pub fn default_batch_pause() -> Duration {
    Duration::from_millis(DEFAULT_BATCH_PAUSE_MS)
}
