use derive_builder::Builder;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::manifest::SourceFile;
use super::stamp::RunStamp;
use crate::config::{
    DEFAULT_BATCH_SIZE, DEFAULT_ROWS_PER_STATEMENT, DEFAULT_TEXT_WIDTH, SAMPLE_SIZE,
};
use crate::db::ledger::{Ledger, LedgerEntry, LedgerStatus, last_modified};
use crate::db::schema::{RowValues, TableSchema};
use crate::db::session::Session;
use crate::error::{DetectionError, LoadError};
use crate::formats::delimited::{BatchReader, ReadOptions};
use crate::formats::dialect::{DEFAULT_QUOTE, DialectDetector, DialectProfile};
use crate::formats::encoding::TextEncoding;
use crate::io::LocalFileByteReader;
use crate::telemetry::TelemetryEvent;

/// Tunables for the streaming loader
#[derive(Debug, Clone, Builder)]
pub struct LoaderConfig {
    /// Rows read, held and inserted as one unit
    #[builder(default = "DEFAULT_BATCH_SIZE")]
    pub batch_size: usize,
    #[builder(default = "DEFAULT_TEXT_WIDTH")]
    pub text_width: u32,
    #[builder(default = "DEFAULT_ROWS_PER_STATEMENT")]
    pub rows_per_statement: usize,
    /// Bytes sampled for dialect detection
    #[builder(default = "SAMPLE_SIZE")]
    pub sample_size: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            text_width: DEFAULT_TEXT_WIDTH,
            rows_per_statement: DEFAULT_ROWS_PER_STATEMENT,
            sample_size: SAMPLE_SIZE,
        }
    }
}

/// What happened to one file
#[derive(Debug)]
pub struct LoadOutcome {
    pub rows_loaded: u64,
    /// Source columns, not counting the injected timestamp
    pub column_count: usize,
    /// Dialect of the last attempt (including its encoding), if one was resolved
    pub dialect: Option<DialectProfile>,
    pub error: Option<LoadError>,
    /// Non-fatal problems (footer discards, ledger write failures)
    pub warnings: Vec<String>,
}

impl LoadOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Progress of one encoding attempt
#[derive(Debug, Default)]
struct Attempt {
    dialect: Option<DialectProfile>,
    columns: usize,
    rows: u64,
    warnings: Vec<String>,
}

/// Streams one file at a time into its target table
pub struct Loader {
    config: LoaderConfig,
    ledger: Ledger,
    detector: DialectDetector,
    stamp: RunStamp,
    telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
}

impl Loader {
    pub fn new(
        config: LoaderConfig,
        ledger: Ledger,
        stamp: RunStamp,
        telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
    ) -> Self {
        Self {
            detector: DialectDetector::new(config.sample_size),
            config,
            ledger,
            stamp,
            telemetry_tx,
        }
    }

    /// Load `file` into its table, trying each candidate encoding in turn, and
    /// record the final status in the ledger
    pub async fn load(&self, session: &mut dyn Session, file: &SourceFile) -> LoadOutcome {
        let _ = self.telemetry_tx.send(TelemetryEvent::FileStarted);
        let name = file.file_name();

        let mut last_error = None;
        let mut last_attempt = Attempt::default();

        for encoding in TextEncoding::candidates(file.overrides.encoding.as_deref()) {
            debug!("Trying encoding {} for {}", encoding, name);
            let mut attempt = Attempt::default();

            match self.attempt(session, file, &encoding, &mut attempt).await {
                Ok(()) => {
                    info!(
                        "Loaded {} rows from {} into {}",
                        attempt.rows, name, file.table
                    );
                    let _ = self
                        .telemetry_tx
                        .send(TelemetryEvent::FileCompleted { rows: attempt.rows });
                    return self
                        .finish(session, file, attempt, LedgerStatus::Completed, None)
                        .await;
                }
                Err(e) if e.is_encoding_specific() => {
                    warn!("Encoding {} failed for {}: {}", encoding, name, e);
                    last_error = Some(e);
                    last_attempt = attempt;
                }
                Err(e) => {
                    error!("Failed to load {} with encoding {}: {}", name, encoding, e);
                    let _ = self.telemetry_tx.send(TelemetryEvent::FileFailed);
                    return self
                        .finish(session, file, attempt, LedgerStatus::Failed, Some(e))
                        .await;
                }
            }
        }

        error!("All encodings failed for {}", name);
        let _ = self.telemetry_tx.send(TelemetryEvent::FileFailed);
        let error = last_error.unwrap_or(LoadError::Detection(DetectionError::NoDialect));
        self.finish(session, file, last_attempt, LedgerStatus::Failed, Some(error))
            .await
    }

    async fn finish(
        &self,
        session: &mut dyn Session,
        file: &SourceFile,
        mut attempt: Attempt,
        status: LedgerStatus,
        error: Option<LoadError>,
    ) -> LoadOutcome {
        let entry = self.ledger_entry(file, &attempt, status).await;
        if let Err(e) = self.ledger.record(session, &entry).await {
            attempt.warnings.push(e.to_string());
        }

        LoadOutcome {
            rows_loaded: attempt.rows,
            column_count: attempt.columns,
            dialect: attempt.dialect,
            error,
            warnings: attempt.warnings,
        }
    }

    /// Build the ledger entry describing `attempt`
    async fn ledger_entry(
        &self,
        file: &SourceFile,
        attempt: &Attempt,
        status: LedgerStatus,
    ) -> LedgerEntry {
        let dialect = attempt.dialect.as_ref();
        LedgerEntry {
            identity: file.identity(),
            last_modified: last_modified(&file.path).await.ok(),
            table_name: file.table.clone(),
            skip_rows: file.overrides.skip_rows.unwrap_or(0),
            skip_footer: file.overrides.skip_footer.unwrap_or(0),
            encoding: dialect
                .map(|d| d.encoding.label().to_string())
                .or_else(|| file.overrides.encoding.clone()),
            has_header: dialect.map(|d| d.has_header),
            delimiter: dialect.map(|d| d.delimiter_label()),
            quote_char: dialect.map(|d| d.quote_label()),
            load_timestamp: self.stamp,
            row_count: attempt.rows,
            column_count: attempt.columns,
            status,
        }
    }

    /// Work out the dialect under `encoding`; overrides win field by field
    async fn resolve_dialect(
        &self,
        file: &SourceFile,
        encoding: &TextEncoding,
    ) -> Result<DialectProfile, LoadError> {
        let overrides = &file.overrides;

        if let (Some(delimiter), Some(quote), Some(has_header)) =
            (overrides.delimiter, overrides.quote_char, overrides.has_header)
        {
            return Ok(DialectProfile {
                delimiter,
                quote,
                has_header,
                encoding: encoding.clone(),
            });
        }

        let reader = LocalFileByteReader::new(&file.path);
        let skip_rows = overrides.skip_rows.unwrap_or(0);
        match self.detector.detect(&reader, encoding, skip_rows).await {
            Ok(detected) => Ok(DialectProfile {
                delimiter: overrides.delimiter.unwrap_or(detected.delimiter),
                quote: overrides.quote_char.unwrap_or(detected.quote),
                has_header: overrides.has_header.unwrap_or(detected.has_header),
                encoding: detected.encoding,
            }),
            Err(DetectionError::NoDialect) if overrides.delimiter.is_some() => {
                debug!("No dialect detected for {}; using overrides", file.file_name());
                Ok(DialectProfile {
                    delimiter: overrides.delimiter.unwrap_or(b','),
                    quote: overrides.quote_char.unwrap_or(DEFAULT_QUOTE),
                    has_header: overrides.has_header.unwrap_or(true),
                    encoding: encoding.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// One full pass over the file under a single encoding
    async fn attempt(
        &self,
        session: &mut dyn Session,
        file: &SourceFile,
        encoding: &TextEncoding,
        attempt: &mut Attempt,
    ) -> Result<(), LoadError> {
        let dialect = self.resolve_dialect(file, encoding).await?;
        info!("Loading {} with {}", file.file_name(), dialect);
        attempt.dialect = Some(dialect.clone());

        let mut reader = BatchReader::open(
            &file.path,
            ReadOptions {
                delimiter: dialect.delimiter,
                quote: dialect.quote,
                has_header: dialect.has_header,
                skip_rows: file.overrides.skip_rows.unwrap_or(0),
                batch_size: self.config.batch_size,
                encoding: encoding.clone(),
            },
        )?;
        attempt.columns = reader.columns().len();

        let Some(first) = reader.next().transpose()? else {
            return Err(LoadError::NoData);
        };

        let schema = TableSchema::new(&file.table, reader.columns())?;
        self.create_table(session, &schema).await?;

        let skip_footer = file.overrides.skip_footer.unwrap_or(0);
        let load_stamp = self.stamp.sql_text();
        let mut current = Some(first);
        let mut batch_no = 0;

        while let Some(mut batch) = current.take() {
            // Look one batch ahead so the footer can be trimmed from the last one
            let next = reader.next().transpose()?;
            batch_no += 1;

            if next.is_none() && skip_footer > 0 {
                self.trim_footer(file, &mut batch, skip_footer, attempt);
            }

            if !batch.is_empty() {
                let rows = self
                    .insert_batch(session, &schema, &batch, &load_stamp, batch_no)
                    .await?;
                attempt.rows += rows;
            }

            current = next;
        }

        Ok(())
    }

    fn trim_footer(
        &self,
        file: &SourceFile,
        batch: &mut Vec<RowValues>,
        skip_footer: usize,
        attempt: &mut Attempt,
    ) {
        if skip_footer < batch.len() {
            batch.truncate(batch.len() - skip_footer);
            return;
        }

        let message = format!(
            "skip_footer={} covers the whole last batch of {} ({} rows); batch discarded",
            skip_footer,
            file.file_name(),
            batch.len()
        );
        warn!("{}", message);
        attempt.warnings.push(message);
        batch.clear();
    }

    async fn create_table(
        &self,
        session: &mut dyn Session,
        schema: &TableSchema,
    ) -> Result<(), LoadError> {
        let to_schema_error = |source| LoadError::Schema {
            table: schema.table().to_string(),
            source,
        };

        session
            .execute(&schema.drop_ddl(), &[])
            .await
            .map_err(to_schema_error)?;
        session
            .execute(&schema.create_ddl(self.config.text_width), &[])
            .await
            .map_err(to_schema_error)?;

        info!(
            "Created table {} with {} columns",
            schema.table(),
            schema.columns().len()
        );
        Ok(())
    }

    async fn insert_batch(
        &self,
        session: &mut dyn Session,
        schema: &TableSchema,
        batch: &[RowValues],
        load_stamp: &str,
        batch_no: usize,
    ) -> Result<u64, LoadError> {
        let start = Instant::now();
        let statements = schema.insert_statements(
            session.backend(),
            batch,
            load_stamp,
            self.config.rows_per_statement,
        );

        session
            .execute_many(&statements)
            .await
            .map_err(|source| LoadError::Insert {
                table: schema.table().to_string(),
                batch: batch_no,
                source,
            })?;

        let rows = batch.len() as u64;
        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(
            "Inserted batch {} ({} rows) into {} in {}ms",
            batch_no,
            rows,
            schema.table(),
            duration_ms
        );
        let _ = self
            .telemetry_tx
            .send(TelemetryEvent::BatchLoaded { duration_ms });

        Ok(rows)
    }
}
