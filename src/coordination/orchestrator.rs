use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::archive::Archiver;
use super::loader::{LoadOutcome, Loader, LoaderConfig};
use super::manifest::{LoadManifestEntry, SourceFile, expand_entries};
use super::stamp::RunStamp;
use crate::db::ledger::{Ledger, LedgerEntry, LedgerStatus, last_modified};
use crate::db::session::Session;
use crate::formats::dialect::byte_label;
use crate::telemetry::{RunStats, TelemetryEvent};

/// Where a file ended up in this run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// Not processed (dry runs report files that would be loaded this way)
    Pending,
    Skipped,
    /// Load began but never reached a final state
    Started,
    Completed,
    Failed,
}

/// Per-file line of the run summary
#[derive(Debug, Clone)]
pub struct FileReport {
    pub path: PathBuf,
    pub table: String,
    pub state: FileState,
    pub rows_loaded: u64,
    /// Encoding the final attempt used
    pub encoding: Option<String>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub archived_to: Option<PathBuf>,
}

impl FileReport {
    fn new(file: &SourceFile, state: FileState) -> Self {
        Self {
            path: file.path.clone(),
            table: file.table.clone(),
            state,
            rows_loaded: 0,
            encoding: None,
            error: None,
            warnings: Vec::new(),
            archived_to: None,
        }
    }

    fn finish(&mut self, outcome: LoadOutcome) {
        self.state = if outcome.is_success() {
            FileState::Completed
        } else {
            FileState::Failed
        };
        self.rows_loaded = outcome.rows_loaded;
        self.encoding = outcome.dialect.map(|d| d.encoding.label().to_string());
        self.error = outcome.error.map(|e| e.to_string());
        self.warnings = outcome.warnings;
    }
}

/// Totals for one orchestrated run
#[derive(Debug)]
pub struct RunSummary {
    /// Manifest entries handed to the run
    pub entries: usize,
    /// Files found after directory expansion
    pub discovered: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub invalid_entries: usize,
    /// Rows loaded by files that completed
    pub rows_loaded: u64,
    pub duration: Duration,
    pub dry_run: bool,
    pub reports: Vec<FileReport>,
    pub stats: RunStats,
}

impl RunSummary {
    pub fn failures(&self) -> impl Iterator<Item = &FileReport> {
        self.reports
            .iter()
            .filter(|r| r.state == FileState::Failed)
    }
}

/// Walks the manifest sequentially: skip check, load, archive
pub struct Orchestrator {
    loader: Loader,
    ledger: Ledger,
    archiver: Option<Box<dyn Archiver>>,
    stamp: RunStamp,
    force_load: bool,
    dry_run: bool,
    quiet: bool,
    telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
    telemetry_rx: mpsc::UnboundedReceiver<TelemetryEvent>,
}

impl Orchestrator {
    pub fn new(config: LoaderConfig, ledger: Ledger, stamp: RunStamp) -> Self {
        let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel();
        Self {
            loader: Loader::new(config, ledger.clone(), stamp, telemetry_tx.clone()),
            ledger,
            archiver: None,
            stamp,
            force_load: false,
            dry_run: false,
            quiet: false,
            telemetry_tx,
            telemetry_rx,
        }
    }

    /// Archive each file after a successful load
    pub fn with_archiver(mut self, archiver: Box<dyn Archiver>) -> Self {
        self.archiver = Some(archiver);
        self
    }

    /// Load every file regardless of its ledger record
    pub fn force_load(mut self, force_load: bool) -> Self {
        self.force_load = force_load;
        self
    }

    /// Report skip decisions without loading anything
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Process `entries` in order on one session
    ///
    /// Per-file failures are recorded and reported; they never stop the run.
    pub async fn run(
        &mut self,
        session: &mut dyn Session,
        entries: &[LoadManifestEntry],
    ) -> Result<RunSummary> {
        let start = Instant::now();
        let expansion = expand_entries(entries).await?;
        info!(
            "Discovered {} files from {} manifest entries ({} invalid)",
            expansion.files.len(),
            entries.len(),
            expansion.invalid.len()
        );

        let progress = self.progress_bar(expansion.files.len() as u64);
        let mut stats = RunStats::new();
        let mut reports = Vec::with_capacity(expansion.files.len());

        for file in &expansion.files {
            progress.set_message(file.file_name());
            let report = self.process(session, file).await;
            reports.push(report);

            self.drain_telemetry(&mut stats);
            progress.inc(1);
            if let (Some(p50), Some(p90), Some(p99)) = stats.get_percentiles() {
                progress.set_message(format!("p50: {}ms, p90: {}ms, p99: {}ms", p50, p90, p99));
            }
        }
        progress.finish_and_clear();

        let count = |state: FileState| reports.iter().filter(|r| r.state == state).count();
        let (skipped, succeeded, failed) = (
            count(FileState::Skipped),
            count(FileState::Completed),
            count(FileState::Failed),
        );
        let rows_loaded = reports
            .iter()
            .filter(|r| r.state == FileState::Completed)
            .map(|r| r.rows_loaded)
            .sum();

        let summary = RunSummary {
            entries: entries.len(),
            discovered: expansion.files.len(),
            skipped,
            succeeded,
            failed,
            invalid_entries: expansion.invalid.len(),
            rows_loaded,
            duration: start.elapsed(),
            dry_run: self.dry_run,
            reports,
            stats,
        };

        info!(
            "Run finished: {} discovered, {} skipped, {} succeeded, {} failed",
            summary.discovered, summary.skipped, summary.succeeded, summary.failed
        );
        Ok(summary)
    }

    async fn process(&self, session: &mut dyn Session, file: &SourceFile) -> FileReport {
        let name = file.file_name();

        if !self.force_load && self.ledger.should_skip(session, &file.path).await {
            let _ = self.telemetry_tx.send(TelemetryEvent::FileSkipped);
            return FileReport::new(file, FileState::Skipped);
        }

        if self.dry_run {
            info!("Would load {} into {}", name, file.table);
            return FileReport::new(file, FileState::Pending);
        }

        let started = self.started_entry(file).await;
        if let Err(e) = self.ledger.record(session, &started).await {
            warn!("Continuing with {} without a STARTED record: {}", name, e);
        }

        let mut report = FileReport::new(file, FileState::Started);
        let outcome = self.loader.load(session, file).await;
        report.finish(outcome);

        if report.state == FileState::Completed
            && let Some(archiver) = &self.archiver
        {
            match archiver.archive(&file.path, &self.stamp).await {
                Ok(destination) => report.archived_to = Some(destination),
                Err(e) => {
                    error!("Failed to archive {}: {:#}", name, e);
                    report.warnings.push(format!("archive failed: {:#}", e));
                }
            }
        }

        report
    }

    /// Ledger record written before any parsing; only the manifest settings are known
    async fn started_entry(&self, file: &SourceFile) -> LedgerEntry {
        let overrides = &file.overrides;
        LedgerEntry {
            identity: file.identity(),
            last_modified: last_modified(&file.path).await.ok(),
            table_name: file.table.clone(),
            skip_rows: overrides.skip_rows.unwrap_or(0),
            skip_footer: overrides.skip_footer.unwrap_or(0),
            encoding: overrides.encoding.clone(),
            has_header: overrides.has_header,
            delimiter: overrides.delimiter.map(byte_label),
            quote_char: overrides.quote_char.map(byte_label),
            load_timestamp: self.stamp,
            row_count: 0,
            column_count: 0,
            status: LedgerStatus::Started,
        }
    }

    fn drain_telemetry(&mut self, stats: &mut RunStats) {
        while let Ok(event) = self.telemetry_rx.try_recv() {
            stats.update(&event);
        }
    }

    fn progress_bar(&self, total: u64) -> ProgressBar {
        if self.quiet {
            return ProgressBar::hidden();
        }

        let bar = ProgressBar::new(total);
        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] Files: [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        bar.set_style(style);
        bar
    }
}
