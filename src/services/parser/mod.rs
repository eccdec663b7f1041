//! Streaming EFD parser
//!
//! Reads a file line by line, routes each line through the `HandlerRegistry`
//! and hands typed records to a `RecordSink`. Every `batch_size` lines the
//! sink gets a boundary call, which is where the Postgres sink commits and
//! checkpoints. Memory stays flat regardless of file size.

pub mod fields;
pub mod handlers;
pub mod reader;

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use sqlx::PgPool;
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{debug, warn};

use crate::db::queries;
use crate::error::JobError;
use crate::types::{BranchHeader, Direction, FiscalRecord, TaxRates};

pub use handlers::{Dispatch, HandlerRegistry, ParseContext, RecordHandler};
use reader::LineReader;

// =============================================================================
// COLLABORATORS
// =============================================================================

/// Where tax coefficients come from
#[async_trait]
pub trait TaxRateSource: Send + Sync {
    async fn rates_for_year(&self, year: i32) -> TaxRates;
}

/// Built-in schedule only
pub struct BuiltinRates;

#[async_trait]
impl TaxRateSource for BuiltinRates {
    async fn rates_for_year(&self, year: i32) -> TaxRates {
        TaxRates::default_for_year(year)
    }
}

/// `tax_rates` table with the built-in schedule as fallback
pub struct PgTaxRates {
    pool: PgPool,
}

impl PgTaxRates {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaxRateSource for PgTaxRates {
    async fn rates_for_year(&self, year: i32) -> TaxRates {
        match queries::tax_rates::find_by_year(&self.pool, year).await {
            Ok(Some(rates)) => rates,
            Ok(None) => {
                debug!(year, "No configured tax rates, using built-in schedule");
                TaxRates::default_for_year(year)
            }
            Err(e) => {
                warn!(year, "Failed to load tax rates, using built-in schedule: {:#}", e);
                TaxRates::default_for_year(year)
            }
        }
    }
}

/// Branch identity every row is stamped with
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BranchContext {
    pub cnpj: String,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
}

impl From<&BranchHeader> for BranchContext {
    fn from(header: &BranchHeader) -> Self {
        Self {
            cnpj: header.cnpj.clone(),
            period_start: header.period_start,
            period_end: header.period_end,
        }
    }
}

/// The `C100` that following `C170` lines belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenDocument {
    pub id: i64,
    pub direction: Direction,
}

/// Per-row context passed to the sink
pub struct RowScope<'a> {
    pub branch_cnpj: &'a str,
    pub parent: Option<OpenDocument>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored; carries the generated id for documents that own items
    Stored(Option<i64>),
    /// The store refused the row; the batch goes on without it
    Rejected,
}

/// Position in the file, reported at batch boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub line: u64,
    pub bytes_read: u64,
    pub total_bytes: u64,
}

impl Progress {
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 100;
        }
        ((self.bytes_read.saturating_mul(100) / self.total_bytes).min(100)) as u8
    }

    pub fn message(&self) -> String {
        format!("Processing: line {} ({}%)", self.line, self.percent())
    }
}

/// Receives parsed records. The Postgres implementation is `BatchWriter`.
#[async_trait]
pub trait RecordSink: Send {
    /// Header seen; called before any row of that branch
    async fn branch_identified(&mut self, header: &BranchHeader) -> Result<(), JobError>;

    async fn insert(&mut self, record: &FiscalRecord, scope: RowScope<'_>) -> Result<InsertOutcome, JobError>;

    /// Every `batch_size` lines: everything up to `progress.line` is durable
    /// once this returns
    async fn batch_boundary(&mut self, progress: Progress) -> Result<(), JobError>;

    /// End of input or terminator; flush the tail
    async fn finish(&mut self, progress: Progress) -> Result<(), JobError>;
}

// =============================================================================
// PARSE STATE
// =============================================================================

/// Where a resumed run picks up
#[derive(Debug, Clone, Default)]
pub struct ResumePoint {
    pub line: u64,
    pub branch: Option<BranchContext>,
    pub open_document: Option<OpenDocument>,
    /// Rows already stored before the checkpoint, by tag
    pub counts: BTreeMap<String, u64>,
}

impl ResumePoint {
    pub fn fresh() -> Self {
        Self::default()
    }
}

struct ParseState {
    line: u64,
    branch: BranchContext,
    rates: TaxRates,
    open_document: Option<OpenDocument>,
    counts: BTreeMap<String, u64>,
    skipped: u64,
    found_terminator: bool,
}

impl ParseState {
    fn count(&mut self, tag: &str) {
        *self.counts.entry(tag.to_string()).or_insert(0) += 1;
    }

    fn skip(&mut self, tag: &str, reason: &str) {
        self.skipped += 1;
        debug!(line = self.line, tag, "Skipping line: {}", reason);
    }
}

/// Result of a full pass
#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub lines_processed: u64,
    pub resumed_from_line: u64,
    pub record_counts: BTreeMap<String, u64>,
    pub skipped_lines: u64,
    pub found_terminator: bool,
    pub branch: BranchContext,
    /// Rates of the last header, reused by the aggregation pass
    pub rates: TaxRates,
}

// =============================================================================
// PARSER
// =============================================================================

pub struct EfdParser<'a> {
    registry: &'a HandlerRegistry,
    rates: &'a dyn TaxRateSource,
    batch_size: u64,
}

impl<'a> EfdParser<'a> {
    pub fn new(registry: &'a HandlerRegistry, rates: &'a dyn TaxRateSource, batch_size: u64) -> Self {
        Self {
            registry,
            rates,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn parse_file<S: RecordSink>(
        &self,
        path: &Path,
        resume: ResumePoint,
        sink: &mut S,
    ) -> Result<ParseOutcome, JobError> {
        let file = tokio::fs::File::open(path).await?;
        let total_bytes = file.metadata().await?.len();
        self.parse_reader(BufReader::new(file), total_bytes, resume, sink)
            .await
    }

    pub async fn parse_reader<R, S>(
        &self,
        input: R,
        total_bytes: u64,
        resume: ResumePoint,
        sink: &mut S,
    ) -> Result<ParseOutcome, JobError>
    where
        R: AsyncBufRead + Unpin + Send,
        S: RecordSink,
    {
        let mut lines = LineReader::new(input);
        let resumed_from_line = resume.line;
        let mut state = self.restore(resume).await;

        if resumed_from_line > 0 {
            let skipped = lines.skip_lines(resumed_from_line).await?;
            if skipped.terminator {
                // Checkpoint reached the end marker before the job finished
                state.line = skipped.lines;
                state.found_terminator = true;
                debug!(line = skipped.lines, "End-of-file marker already behind the checkpoint");
            } else if skipped.lines < resumed_from_line {
                warn!(
                    checkpoint = resumed_from_line,
                    lines = skipped.lines,
                    "File is shorter than its checkpoint"
                );
            }
            debug!(line = resumed_from_line, "Resuming after checkpoint");
        }

        while !state.found_terminator {
            let Some(line) = lines.next_line().await? else {
                break;
            };
            state.line += 1;
            self.handle_line(&line, &mut state, sink).await?;

            if state.found_terminator {
                break;
            }

            if state.line % self.batch_size == 0 {
                sink.batch_boundary(Progress {
                    line: state.line,
                    bytes_read: lines.bytes_read(),
                    total_bytes,
                })
                .await?;
            }
        }

        sink.finish(Progress {
            line: state.line,
            bytes_read: lines.bytes_read(),
            total_bytes,
        })
        .await?;

        if !state.found_terminator {
            warn!(lines = state.line, "Reached end of file without a |9999| terminator");
        }

        Ok(ParseOutcome {
            lines_processed: state.line,
            resumed_from_line,
            record_counts: state.counts,
            skipped_lines: state.skipped,
            found_terminator: state.found_terminator,
            branch: state.branch,
            rates: state.rates,
        })
    }

    async fn restore(&self, resume: ResumePoint) -> ParseState {
        let branch = resume.branch.unwrap_or_default();
        let rates = match branch.period_start {
            Some(start) => self.rates.rates_for_year(start.year()).await,
            None => TaxRates::default(),
        };

        ParseState {
            line: resume.line,
            branch,
            rates,
            open_document: resume.open_document,
            counts: resume.counts,
            skipped: 0,
            found_terminator: false,
        }
    }

    async fn handle_line<S: RecordSink>(
        &self,
        line: &str,
        state: &mut ParseState,
        sink: &mut S,
    ) -> Result<(), JobError> {
        let dispatched = self.registry.dispatch(line, &ParseContext { rates: &state.rates });
        match dispatched {
            Dispatch::Ignored => Ok(()),
            Dispatch::Skipped(tag) => {
                state.skip(tag, "malformed or too short");
                Ok(())
            }
            Dispatch::Record(record) => self.apply(record, state, sink).await,
        }
    }

    async fn apply<S: RecordSink>(
        &self,
        record: FiscalRecord,
        state: &mut ParseState,
        sink: &mut S,
    ) -> Result<(), JobError> {
        match &record {
            FiscalRecord::Terminator => {
                state.found_terminator = true;
                return Ok(());
            }
            FiscalRecord::Header(header) => {
                sink.branch_identified(header).await?;
                if let Some(start) = header.period_start {
                    state.rates = self.rates.rates_for_year(start.year()).await;
                }
                state.branch = BranchContext::from(header);
                state.open_document = None;
                debug!(cnpj = %header.cnpj, year = state.rates.year, "Branch header");
                return Ok(());
            }
            FiscalRecord::DocumentItem(_) if state.open_document.is_none() => {
                state.skip("C170", "item without an open C100");
                return Ok(());
            }
            _ => {}
        }

        let scope = RowScope {
            branch_cnpj: &state.branch.cnpj,
            parent: state.open_document,
        };
        let outcome = sink.insert(&record, scope).await?;

        if let FiscalRecord::Document(doc) = &record {
            // A rejected C100 must not adopt the previous document's items
            state.open_document = match outcome {
                InsertOutcome::Stored(Some(id)) => Some(OpenDocument {
                    id,
                    direction: doc.direction,
                }),
                _ => None,
            };
        }

        if let InsertOutcome::Stored(_) = outcome {
            state.count(record.tag());
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::handlers::fixtures;
    use super::memory::MemorySink;
    use super::*;

    fn sample_file() -> String {
        let lines = vec![
            fixtures::header("11222333000181", "01012026"),
            "|0001|0|".to_string(),
            fixtures::participant("FORN01"),
            fixtures::participant("CLI01"),
            fixtures::document("0", "FORN01", "1.000,00", "180,00"),
            fixtures::item("1", "600,00"),
            fixtures::item("2", "400,00"),
            "|C190|000|1102|18,00|1000,00|".to_string(),
            fixtures::document("1", "CLI01", "500,00", "90,00"),
            fixtures::item("1", "500,00"),
            fixtures::energy("0"),
            fixtures::consumption(),
            fixtures::transport("0"),
            fixtures::communication("0"),
            "|9900|C100|2|".to_string(),
            "|9999|17|".to_string(),
        ];
        lines.join("\r\n") + "\r\n"
    }

    async fn run(
        data: &str,
        batch_size: u64,
        resume: ResumePoint,
        sink: &mut MemorySink,
    ) -> Result<ParseOutcome, JobError> {
        let registry = HandlerRegistry::standard();
        let parser = EfdParser::new(&registry, &BuiltinRates, batch_size);
        parser
            .parse_reader(data.as_bytes(), data.len() as u64, resume, sink)
            .await
    }

    /// Build the resume point a restarted worker would derive from the store
    fn resume_from(sink: &MemorySink, branch: &BranchContext) -> ResumePoint {
        let mut counts = BTreeMap::new();
        for row in &sink.committed {
            *counts.entry(row.tag.to_string()).or_insert(0) += 1;
        }
        let open_document = sink
            .committed
            .iter()
            .rev()
            .find_map(|row| match &row.record {
                FiscalRecord::Document(doc) => Some(OpenDocument {
                    id: row.id,
                    direction: doc.direction,
                }),
                _ => None,
            });
        ResumePoint {
            line: sink.last_checkpoint(),
            branch: Some(branch.clone()),
            open_document,
            counts,
        }
    }

    #[tokio::test]
    async fn test_full_file_counts_and_terminator() {
        let data = sample_file();
        let mut sink = MemorySink::default();

        let outcome = run(&data, 2000, ResumePoint::fresh(), &mut sink).await.unwrap();

        assert!(outcome.found_terminator);
        assert_eq!(outcome.lines_processed, 16);
        assert_eq!(outcome.skipped_lines, 0);
        assert_eq!(outcome.record_counts.get("0150"), Some(&2));
        assert_eq!(outcome.record_counts.get("C100"), Some(&2));
        assert_eq!(outcome.record_counts.get("C170"), Some(&3));
        assert_eq!(outcome.record_counts.get("C500"), Some(&1));
        assert_eq!(outcome.record_counts.get("C600"), Some(&1));
        assert_eq!(outcome.record_counts.get("D100"), Some(&1));
        assert_eq!(outcome.record_counts.get("D500"), Some(&1));
        assert_eq!(outcome.branch.cnpj, "11222333000181");
        assert_eq!(outcome.rates.year, 2026);
        assert_eq!(sink.committed.len(), 11);
        assert_eq!(sink.headers.len(), 1);
        assert!(sink.committed.iter().all(|r| r.branch_cnpj == "11222333000181"));
    }

    #[tokio::test]
    async fn test_items_attach_to_latest_document() {
        let data = sample_file();
        let mut sink = MemorySink::default();
        run(&data, 2000, ResumePoint::fresh(), &mut sink).await.unwrap();

        let documents: Vec<_> = sink.committed.iter().filter(|r| r.tag == "C100").collect();
        let items: Vec<_> = sink.committed.iter().filter(|r| r.tag == "C170").collect();

        assert_eq!(items[0].parent.map(|p| p.id), Some(documents[0].id));
        assert_eq!(items[1].parent.map(|p| p.id), Some(documents[0].id));
        assert_eq!(items[2].parent.map(|p| p.id), Some(documents[1].id));
        assert_eq!(items[2].parent.map(|p| p.direction), Some(Direction::Outbound));
    }

    #[tokio::test]
    async fn test_lines_after_terminator_are_not_read() {
        let data = format!("{}{}\r\n", sample_file(), fixtures::participant("LATE"));
        let mut sink = MemorySink::default();

        let outcome = run(&data, 2000, ResumePoint::fresh(), &mut sink).await.unwrap();

        assert_eq!(outcome.lines_processed, 16);
        assert_eq!(outcome.record_counts.get("0150"), Some(&2));
    }

    #[tokio::test]
    async fn test_resume_at_terminator_line_matches_single_run() {
        let data = [
            fixtures::header("11222333000181", "01012026"),
            fixtures::participant("A"),
            "|9999|3|".to_string(),
            fixtures::participant("LATE"),
        ]
        .join("\r\n");

        let mut reference = MemorySink::default();
        let expected = run(&data, 2000, ResumePoint::fresh(), &mut reference).await.unwrap();
        assert_eq!(reference.last_checkpoint(), 3);

        // finished and checkpointed, then the process died before completion
        let mut sink = MemorySink::default();
        run(&data, 2000, ResumePoint::fresh(), &mut sink).await.unwrap();
        let branch = BranchContext {
            cnpj: "11222333000181".to_string(),
            period_start: NaiveDate::from_ymd_opt(2026, 1, 1),
            period_end: NaiveDate::from_ymd_opt(2026, 1, 31),
        };
        let resume = resume_from(&sink, &branch);
        assert_eq!(resume.line, 3);

        let outcome = run(&data, 2000, resume, &mut sink).await.unwrap();

        assert!(outcome.found_terminator);
        assert_eq!(outcome.lines_processed, expected.lines_processed);
        assert_eq!(outcome.record_counts, expected.record_counts);
        assert_eq!(sink.committed_tags(), reference.committed_tags());
        assert_eq!(sink.last_checkpoint(), 3);
    }

    #[tokio::test]
    async fn test_alternate_terminator_stops_scan() {
        let data = [
            fixtures::header("1", "01012026"),
            "|9990|3|".to_string(),
            fixtures::participant("AFTER"),
        ]
        .join("\n");
        let mut sink = MemorySink::default();

        let outcome = run(&data, 2000, ResumePoint::fresh(), &mut sink).await.unwrap();

        assert!(outcome.found_terminator);
        assert_eq!(outcome.lines_processed, 2);
        assert!(sink.committed.is_empty());
    }

    #[tokio::test]
    async fn test_missing_terminator_is_not_fatal() {
        let data = [fixtures::header("1", "01012026"), fixtures::participant("P")].join("\n");
        let mut sink = MemorySink::default();

        let outcome = run(&data, 2000, ResumePoint::fresh(), &mut sink).await.unwrap();

        assert!(!outcome.found_terminator);
        assert_eq!(outcome.lines_processed, 2);
        assert_eq!(sink.committed_tags(), vec!["0150"]);
    }

    #[tokio::test]
    async fn test_orphan_item_and_short_lines_are_skipped() {
        let data = [
            fixtures::header("1", "01012026"),
            fixtures::item("1", "10,00"),
            "|C100|0|".to_string(),
            fixtures::document("0", "P", "10,00", "0"),
            fixtures::item("1", "10,00"),
            "|9999|5|".to_string(),
        ]
        .join("\n");
        let mut sink = MemorySink::default();

        let outcome = run(&data, 2000, ResumePoint::fresh(), &mut sink).await.unwrap();

        assert_eq!(outcome.skipped_lines, 2);
        assert_eq!(sink.committed_tags(), vec!["C100", "C170"]);
    }

    #[tokio::test]
    async fn test_rejected_document_orphans_its_items() {
        let data = [
            fixtures::header("1", "01012026"),
            fixtures::document("0", "P", "10,00", "0"),
            fixtures::item("1", "10,00"),
            "|9999|4|".to_string(),
        ]
        .join("\n");
        let mut sink = MemorySink {
            reject: vec!["C100"],
            ..Default::default()
        };

        let outcome = run(&data, 2000, ResumePoint::fresh(), &mut sink).await.unwrap();

        assert!(sink.committed.is_empty());
        assert_eq!(outcome.skipped_lines, 1);
        assert_eq!(outcome.record_counts.get("C100"), None);
    }

    #[tokio::test]
    async fn test_boundaries_fire_every_batch() {
        let data = sample_file();
        let mut sink = MemorySink::default();

        run(&data, 5, ResumePoint::fresh(), &mut sink).await.unwrap();

        // boundaries at 5, 10, 15 then the final flush at the terminator
        assert_eq!(sink.checkpoints, vec![5, 10, 15, 16]);
    }

    #[tokio::test]
    async fn test_resume_after_crash_matches_single_run() {
        let data = sample_file();

        let mut reference = MemorySink::default();
        let expected = run(&data, 5, ResumePoint::fresh(), &mut reference).await.unwrap();

        // crash while committing the batch ending at line 10
        let mut sink = MemorySink {
            crash_at: Some(10),
            ..Default::default()
        };
        let err = run(&data, 5, ResumePoint::fresh(), &mut sink).await.unwrap_err();
        assert!(matches!(err, JobError::Interrupted { line: 10 }));
        assert_eq!(sink.last_checkpoint(), 5);

        let branch = BranchContext {
            cnpj: "11222333000181".to_string(),
            period_start: NaiveDate::from_ymd_opt(2026, 1, 1),
            period_end: NaiveDate::from_ymd_opt(2026, 1, 31),
        };
        let resume = resume_from(&sink, &branch);
        sink.crash_at = None;

        let outcome = run(&data, 5, resume, &mut sink).await.unwrap();

        assert_eq!(outcome.resumed_from_line, 5);
        assert_eq!(outcome.record_counts, expected.record_counts);
        assert_eq!(sink.committed_tags(), reference.committed_tags());

        // ids differ across runs (rolled back rows burn ids), positions must not
        let parent_positions = |s: &MemorySink| -> Vec<Option<usize>> {
            let documents: Vec<i64> = s.committed.iter().filter(|r| r.tag == "C100").map(|r| r.id).collect();
            s.committed
                .iter()
                .filter(|r| r.tag == "C170")
                .map(|r| r.parent.and_then(|p| documents.iter().position(|id| *id == p.id)))
                .collect()
        };
        assert_eq!(parent_positions(&sink), vec![Some(0), Some(0), Some(1)]);
        assert_eq!(parent_positions(&sink), parent_positions(&reference));
    }

    #[tokio::test]
    async fn test_resume_restores_open_document_for_items() {
        let data = sample_file();
        let mut first = MemorySink::default();
        run(&data, 2000, ResumePoint::fresh(), &mut first).await.unwrap();

        // checkpoint 5 sits right after the first C100, before its items
        let mut sink = MemorySink::default();
        let stored = first.committed.iter().find(|r| r.tag == "C100").unwrap().clone();
        sink.committed.push(stored.clone());
        sink.next_id = 100;
        let resume = ResumePoint {
            line: 5,
            branch: Some(BranchContext {
                cnpj: "11222333000181".to_string(),
                period_start: NaiveDate::from_ymd_opt(2026, 1, 1),
                period_end: None,
            }),
            open_document: Some(OpenDocument {
                id: stored.id,
                direction: Direction::Inbound,
            }),
            counts: BTreeMap::new(),
        };

        run(&data, 2000, resume, &mut sink).await.unwrap();

        let first_item = sink.committed.iter().find(|r| r.tag == "C170").unwrap();
        assert_eq!(first_item.parent.map(|p| p.id), Some(stored.id));
        assert_eq!(first_item.branch_cnpj, "11222333000181");
    }

    #[tokio::test]
    async fn test_header_rates_apply_to_projections() {
        let data = [
            fixtures::header("1", "01012030"),
            fixtures::document("0", "P", "1.000,00", "180,00"),
            "|9999|3|".to_string(),
        ]
        .join("\n");
        let mut sink = MemorySink::default();

        let outcome = run(&data, 2000, ResumePoint::fresh(), &mut sink).await.unwrap();

        assert_eq!(outcome.rates.year, 2030);
        let FiscalRecord::Document(doc) = &sink.committed[0].record else {
            panic!("expected C100");
        };
        assert_eq!(doc.projected, TaxRates::default_for_year(2030).project(1000.0, 180.0));
    }

    #[test]
    fn test_progress_percent() {
        let p = Progress { line: 10, bytes_read: 250, total_bytes: 1000 };
        assert_eq!(p.percent(), 25);
        assert_eq!(p.message(), "Processing: line 10 (25%)");
        let empty = Progress { line: 0, bytes_read: 0, total_bytes: 0 };
        assert_eq!(empty.percent(), 100);
    }
}
