//! Line reader for Latin-1 encoded EFD files
//!
//! Reads raw bytes up to `\n` so non-UTF-8 content never fails the read, and
//! maps every byte to the code point of the same value.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const TERMINATORS: [&[u8]; 2] = [b"|9999|", b"|9990|"];

/// Latin-1 is the first 256 Unicode code points
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// What `skip_lines` passed over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Skipped {
    pub lines: u64,
    /// The last skipped line was an end-of-file marker
    pub terminator: bool,
}

pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    bytes_read: u64,
    lines_read: u64,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(1024),
            bytes_read: 0,
            lines_read: 0,
        }
    }

    /// Bytes consumed so far, terminators included
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Read one raw line into the buffer. Returns `false` at end of input.
    async fn fill_line(&mut self) -> io::Result<bool> {
        self.buf.clear();
        let n = self.inner.read_until(b'\n', &mut self.buf).await?;
        if n == 0 {
            return Ok(false);
        }
        self.bytes_read += n as u64;
        self.lines_read += 1;
        Ok(true)
    }

    /// Next line without its `\r\n` / `\n`, or `None` at end of input
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        if !self.fill_line().await? {
            return Ok(None);
        }

        let mut line: &[u8] = &self.buf;
        if self.lines_read == 1 {
            line = line.strip_prefix(UTF8_BOM).unwrap_or(line);
        }
        while let Some((last, rest)) = line.split_last() {
            if *last == b'\n' || *last == b'\r' {
                line = rest;
            } else {
                break;
            }
        }

        Ok(Some(decode_latin1(line)))
    }

    /// Discard up to `count` lines without decoding them. Stops early at
    /// end of input or right after a `|9999|`/`|9990|` line.
    pub async fn skip_lines(&mut self, count: u64) -> io::Result<Skipped> {
        let mut skipped = Skipped {
            lines: 0,
            terminator: false,
        };
        while skipped.lines < count {
            if !self.fill_line().await? {
                break;
            }
            skipped.lines += 1;
            if self.is_terminator() {
                skipped.terminator = true;
                break;
            }
        }
        Ok(skipped)
    }

    fn is_terminator(&self) -> bool {
        let mut line: &[u8] = &self.buf;
        if self.lines_read == 1 {
            line = line.strip_prefix(UTF8_BOM).unwrap_or(line);
        }
        TERMINATORS.iter().any(|marker| line.starts_with(marker))
    }
}
