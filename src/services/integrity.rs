//! File integrity gate
//!
//! Cheap checks that run before a single row is written: the file exists,
//! is big enough, and starts with a `|0000|` header. The tail is scanned for
//! an end-of-file marker, but a missing one only produces a warning because
//! filtered exports and signed files are still worth ingesting.

use std::io::SeekFrom;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use crate::defaults::{HEADER_WINDOW_BYTES, MIN_FILE_SIZE, TAIL_WINDOW_BYTES};
use crate::error::JobError;

const HEADER_MARKER: &[u8] = b"|0000|";
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const TAIL_MARKERS: &[&[u8]] = &[
    b"|9999|",
    b"|9990|",
    // "|9999|" as UTF-16LE
    b"|\x009\x009\x009\x009\x00|\x00",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityReport {
    pub file_size: u64,
    pub terminator_in_tail: bool,
}

pub async fn validate(path: &Path) -> Result<IntegrityReport, JobError> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(JobError::InvalidFile(format!("file not found: {}", path.display())));
        }
        Err(e) => return Err(e.into()),
    };

    let file_size = file.metadata().await?.len();
    if file_size < MIN_FILE_SIZE {
        return Err(JobError::InvalidFile(format!(
            "file too small ({} bytes, minimum {})",
            file_size, MIN_FILE_SIZE
        )));
    }

    let mut head = vec![0u8; HEADER_WINDOW_BYTES.min(file_size as usize)];
    file.read_exact(&mut head).await?;
    let head = head.strip_prefix(UTF8_BOM).unwrap_or(&head[..]);
    if !head.starts_with(HEADER_MARKER) {
        return Err(JobError::InvalidFile(
            "missing |0000| header on the first line".to_string(),
        ));
    }

    let tail_start = file_size.saturating_sub(TAIL_WINDOW_BYTES);
    file.seek(SeekFrom::Start(tail_start)).await?;
    let mut tail = Vec::with_capacity((file_size - tail_start) as usize);
    file.read_to_end(&mut tail).await?;

    let terminator_in_tail = TAIL_MARKERS.iter().any(|marker| contains(&tail, marker));
    if terminator_in_tail {
        debug!(path = %path.display(), file_size, "Integrity check passed");
    } else {
        warn!(path = %path.display(), "No |9999| marker near the end of file; it may be truncated");
    }

    Ok(IntegrityReport {
        file_size,
        terminator_in_tail,
    })
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
