//! Control ledger: one row per source file recording what was loaded, when,
//! and with which parameters. The skip decision for every run is taken from
//! here.

use chrono::NaiveDateTime;
use std::fmt;
use std::io;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::SQL_TIMESTAMP_FORMAT;
use crate::coordination::stamp::{RunStamp, local_time};
use crate::db::schema::quote_identifier;
use crate::db::session::{Session, SqlValue};
use crate::error::LedgerError;
use crate::io::{ByteReader, LocalFileByteReader};

/// Status flag stored in `STATUS_FLAG`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerStatus {
    Started,
    Completed,
    Failed,
    /// Written by the downstream consumer, never by this crate
    DownstreamCompleted,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Started => "STARTED",
            LedgerStatus::Completed => "COMPLETED",
            LedgerStatus::Failed => "FAILED",
            LedgerStatus::DownstreamCompleted => "DOWNSTREAM_COMPLETED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "STARTED" => Some(LedgerStatus::Started),
            "COMPLETED" => Some(LedgerStatus::Completed),
            "FAILED" => Some(LedgerStatus::Failed),
            "DOWNSTREAM_COMPLETED" => Some(LedgerStatus::DownstreamCompleted),
            _ => None,
        }
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger key of a source file: its name and the absolute directory holding it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub file_name: String,
    pub directory: String,
}

impl FileIdentity {
    pub fn of(path: &Path) -> Self {
        let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let file_name = absolute
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let directory = absolute
            .parent()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();

        Self {
            file_name,
            directory,
        }
    }
}

/// Source file modification time in local wall-clock time, whole seconds
pub async fn last_modified(path: &Path) -> io::Result<NaiveDateTime> {
    let modified = LocalFileByteReader::new(path).modified().await?;
    Ok(local_time(modified))
}

/// Values written by one `record` call
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub identity: FileIdentity,
    pub last_modified: Option<NaiveDateTime>,
    pub table_name: String,
    pub skip_rows: usize,
    pub skip_footer: usize,
    pub encoding: Option<String>,
    pub has_header: Option<bool>,
    pub delimiter: Option<String>,
    pub quote_char: Option<String>,
    pub load_timestamp: RunStamp,
    pub row_count: u64,
    pub column_count: usize,
    pub status: LedgerStatus,
}

/// A ledger row as read back from the store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerRecord {
    pub file_name: String,
    pub directory: String,
    pub last_modified: Option<String>,
    pub table_name: Option<String>,
    pub encoding: Option<String>,
    pub has_header: Option<bool>,
    pub delimiter: Option<String>,
    pub quote_char: Option<String>,
    pub load_timestamp: Option<String>,
    pub row_count: Option<i64>,
    pub column_count: Option<i64>,
    pub downstream_timestamp: Option<String>,
    pub status: Option<String>,
}

impl LedgerRecord {
    fn from_row(row: Vec<Option<String>>) -> Self {
        let mut fields = row.into_iter();
        let mut next = || fields.next().flatten();

        Self {
            file_name: next().unwrap_or_default(),
            directory: next().unwrap_or_default(),
            last_modified: next(),
            table_name: next(),
            encoding: next(),
            has_header: next().map(|v| matches!(v.trim(), "1" | "true" | "t" | "TRUE")),
            delimiter: next(),
            quote_char: next(),
            load_timestamp: next(),
            row_count: next().and_then(|v| v.trim().parse().ok()),
            column_count: next().and_then(|v| v.trim().parse().ok()),
            downstream_timestamp: next(),
            status: next(),
        }
    }

    pub fn status(&self) -> Option<LedgerStatus> {
        self.status.as_deref().and_then(LedgerStatus::parse)
    }
}

const LEDGER_COLUMNS: &[(&str, &str)] = &[
    ("FILE_NAME", "VARCHAR(255) NOT NULL"),
    ("FILE_PATH", "VARCHAR(1024) NOT NULL"),
    ("LAST_MODIFIED", "VARCHAR(19)"),
    ("SKIP_ROWS", "BIGINT"),
    ("SKIP_FOOTER", "BIGINT"),
    ("ENCODING", "VARCHAR(32)"),
    ("HAS_HEADER", "BOOLEAN"),
    ("DELIMITER", "VARCHAR(8)"),
    ("QUOTE_CHAR", "VARCHAR(8)"),
    ("TABLE_NAME", "VARCHAR(255)"),
    ("LOAD_TIMESTAMP", "VARCHAR(19)"),
    ("ROW_COUNT", "BIGINT"),
    ("COLUMN_COUNT", "BIGINT"),
    ("DOWNSTREAM_TIMESTAMP", "VARCHAR(19)"),
    ("STATUS_FLAG", "VARCHAR(32)"),
];

/// Columns written by `record`; `DOWNSTREAM_TIMESTAMP` belongs to the consumer
const WRITTEN_COLUMNS: &[&str] = &[
    "FILE_NAME",
    "FILE_PATH",
    "LAST_MODIFIED",
    "SKIP_ROWS",
    "SKIP_FOOTER",
    "ENCODING",
    "HAS_HEADER",
    "DELIMITER",
    "QUOTE_CHAR",
    "TABLE_NAME",
    "LOAD_TIMESTAMP",
    "ROW_COUNT",
    "COLUMN_COUNT",
    "STATUS_FLAG",
];

/// Handle on the ledger table
#[derive(Debug, Clone)]
pub struct Ledger {
    table: String,
}

impl Ledger {
    pub fn new(table: &str) -> Result<Self, LedgerError> {
        Ok(Self {
            table: quote_identifier(table)
                .map_err(|_| LedgerError::Identifier(table.to_string()))?,
        })
    }

    /// Create the ledger table if it does not exist yet
    pub async fn ensure_table(&self, session: &mut dyn Session) -> Result<(), sqlx::Error> {
        let column_defs: Vec<String> = LEDGER_COLUMNS
            .iter()
            .map(|(name, ty)| format!("  \"{}\" {}", name, ty))
            .collect();
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{},\n  PRIMARY KEY (\"FILE_NAME\", \"FILE_PATH\")\n)",
            self.table,
            column_defs.join(",\n")
        );

        session.execute(&ddl, &[]).await?;
        Ok(())
    }

    /// Fetch the record for one file, if any
    pub async fn lookup(
        &self,
        session: &mut dyn Session,
        identity: &FileIdentity,
    ) -> Result<Option<LedgerRecord>, LedgerError> {
        let backend = session.backend();
        let sql = format!(
            "SELECT \"FILE_NAME\", \"FILE_PATH\", \"LAST_MODIFIED\", \"TABLE_NAME\", \
             \"ENCODING\", CAST(\"HAS_HEADER\" AS TEXT), \"DELIMITER\", \"QUOTE_CHAR\", \
             \"LOAD_TIMESTAMP\", CAST(\"ROW_COUNT\" AS TEXT), CAST(\"COLUMN_COUNT\" AS TEXT), \
             \"DOWNSTREAM_TIMESTAMP\", \"STATUS_FLAG\" \
             FROM {} WHERE \"FILE_NAME\" = {} AND \"FILE_PATH\" = {}",
            self.table,
            backend.placeholder(1),
            backend.placeholder(2)
        );

        let rows = session
            .fetch_rows(
                &sql,
                &[
                    SqlValue::text(&identity.file_name),
                    SqlValue::text(&identity.directory),
                ],
            )
            .await
            .map_err(|source| LedgerError::Lookup {
                file: identity.file_name.clone(),
                source,
            })?;

        Ok(rows.into_iter().next().map(LedgerRecord::from_row))
    }

    /// Decide whether a file can be skipped this run
    ///
    /// Unreadable source metadata means "load it"; any problem reading the
    /// ledger itself means "skip it".
    pub async fn should_skip(&self, session: &mut dyn Session, path: &Path) -> bool {
        let identity = FileIdentity::of(path);
        let file = identity.file_name.as_str();

        let current = match last_modified(path).await {
            Ok(current) => current,
            Err(e) => {
                warn!("Failed to stat {}: {}", file, e);
                return false;
            }
        };

        match self.skip_decision(session, &identity, current).await {
            Ok(true) => true,
            Ok(false) => {
                info!("Loading {}: ledger check passed", file);
                false
            }
            Err(e) => {
                warn!("Skipping {} as the ledger check failed: {}", file, e);
                true
            }
        }
    }

    async fn skip_decision(
        &self,
        session: &mut dyn Session,
        identity: &FileIdentity,
        current: NaiveDateTime,
    ) -> Result<bool, LedgerError> {
        let file = &identity.file_name;
        let Some(record) = self.lookup(session, identity).await? else {
            info!("Loading {}: not found in ledger", file);
            return Ok(false);
        };

        if let Some(stored) = record.last_modified.as_deref() {
            let stored = NaiveDateTime::parse_from_str(stored.trim(), SQL_TIMESTAMP_FORMAT)
                .map_err(|_| LedgerError::Timestamp {
                    file: file.clone(),
                    value: stored.to_string(),
                })?;
            debug!(file = %file, stored = %stored, current = %current, "comparing modification times");

            if stored >= current {
                info!("Skipping {}: unchanged since last load", file);
                return Ok(true);
            }
        }

        if record.status() == Some(LedgerStatus::DownstreamCompleted) {
            info!("Skipping {}: already consumed downstream", file);
            return Ok(true);
        }

        Ok(false)
    }

    /// Upsert the record for `entry`'s file; the latest call wins
    pub async fn record(
        &self,
        session: &mut dyn Session,
        entry: &LedgerEntry,
    ) -> Result<(), LedgerError> {
        let backend = session.backend();
        let columns: Vec<String> = WRITTEN_COLUMNS
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect();
        let placeholders: Vec<String> = (1..=WRITTEN_COLUMNS.len())
            .map(|n| backend.placeholder(n))
            .collect();
        let updates: Vec<String> = columns[2..]
            .iter()
            .map(|c| format!("{} = EXCLUDED.{}", c, c))
            .collect();

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT (\"FILE_NAME\", \"FILE_PATH\") DO UPDATE SET {}",
            self.table,
            columns.join(", "),
            placeholders.join(", "),
            updates.join(", ")
        );

        let params = vec![
            SqlValue::text(&entry.identity.file_name),
            SqlValue::text(&entry.identity.directory),
            SqlValue::Text(
                entry
                    .last_modified
                    .map(|t| t.format(SQL_TIMESTAMP_FORMAT).to_string()),
            ),
            SqlValue::Integer(Some(entry.skip_rows as i64)),
            SqlValue::Integer(Some(entry.skip_footer as i64)),
            SqlValue::Text(entry.encoding.clone()),
            SqlValue::Boolean(entry.has_header),
            SqlValue::Text(entry.delimiter.clone()),
            SqlValue::Text(entry.quote_char.clone()),
            SqlValue::text(&entry.table_name),
            SqlValue::text(entry.load_timestamp.sql_text()),
            SqlValue::Integer(Some(entry.row_count as i64)),
            SqlValue::Integer(Some(entry.column_count as i64)),
            SqlValue::text(entry.status.as_str()),
        ];

        match session.execute(&sql, &params).await {
            Ok(_) => {
                info!(
                    "Recorded ledger status {} for {}",
                    entry.status, entry.identity.file_name
                );
                Ok(())
            }
            Err(source) => {
                warn!(
                    "Failed to record ledger status {} for {}: {}",
                    entry.status, entry.identity.file_name, source
                );
                Err(LedgerError::Write {
                    file: entry.identity.file_name.clone(),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::session::DbSession;
    use chrono::Duration;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn entry_for(path: &Path, last_modified: NaiveDateTime, status: LedgerStatus) -> LedgerEntry {
        LedgerEntry {
            identity: FileIdentity::of(path),
            last_modified: Some(last_modified),
            table_name: "SALES".to_string(),
            skip_rows: 0,
            skip_footer: 0,
            encoding: Some("utf-8-sig".to_string()),
            has_header: Some(true),
            delimiter: Some(",".to_string()),
            quote_char: Some("\"".to_string()),
            load_timestamp: RunStamp::now(),
            row_count: 3,
            column_count: 2,
            status,
        }
    }

    async fn setup() -> (DbSession, Ledger, NamedTempFile) {
        let mut session = DbSession::sqlite_in_memory().await.unwrap();
        let ledger = Ledger::new("FILE_LOAD_LEDGER").unwrap();
        ledger.ensure_table(&mut session).await.unwrap();

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "id,name").unwrap();
        file.flush().unwrap();

        (session, ledger, file)
    }

    #[tokio::test]
    async fn test_ensure_table_is_idempotent() {
        let (mut session, ledger, _file) = setup().await;
        ledger.ensure_table(&mut session).await.unwrap();
    }

    #[tokio::test]
    async fn test_record_upserts_by_key() {
        let (mut session, ledger, file) = setup().await;
        let mtime = last_modified(file.path()).await.unwrap();

        let started = entry_for(file.path(), mtime, LedgerStatus::Started);
        ledger.record(&mut session, &started).await.unwrap();

        let mut completed = entry_for(file.path(), mtime, LedgerStatus::Completed);
        completed.row_count = 42;
        ledger.record(&mut session, &completed).await.unwrap();

        let rows = session
            .fetch_rows("SELECT CAST(COUNT(*) AS TEXT) FROM \"FILE_LOAD_LEDGER\"", &[])
            .await
            .unwrap();
        assert_eq!(rows, vec![vec![Some("1".to_string())]]);

        let record = ledger
            .lookup(&mut session, &FileIdentity::of(file.path()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status(), Some(LedgerStatus::Completed));
        assert_eq!(record.row_count, Some(42));
        assert_eq!(record.has_header, Some(true));
        assert_eq!(record.downstream_timestamp, None);
    }

    #[tokio::test]
    async fn test_unknown_file_is_loaded() {
        let (mut session, ledger, file) = setup().await;
        assert!(!ledger.should_skip(&mut session, file.path()).await);
    }

    #[tokio::test]
    async fn test_unchanged_file_is_skipped() {
        let (mut session, ledger, file) = setup().await;
        let mtime = last_modified(file.path()).await.unwrap();

        let entry = entry_for(file.path(), mtime, LedgerStatus::Completed);
        ledger.record(&mut session, &entry).await.unwrap();

        assert!(ledger.should_skip(&mut session, file.path()).await);
    }

    #[tokio::test]
    async fn test_modified_file_is_reloaded() {
        let (mut session, ledger, file) = setup().await;
        let mtime = last_modified(file.path()).await.unwrap();

        let entry = entry_for(file.path(), mtime - Duration::days(1), LedgerStatus::Completed);
        ledger.record(&mut session, &entry).await.unwrap();

        assert!(!ledger.should_skip(&mut session, file.path()).await);
    }

    #[tokio::test]
    async fn test_downstream_completed_blocks_reload() {
        let (mut session, ledger, file) = setup().await;
        let mtime = last_modified(file.path()).await.unwrap();

        let entry = entry_for(file.path(), mtime - Duration::days(1), LedgerStatus::Completed);
        ledger.record(&mut session, &entry).await.unwrap();
        session
            .execute(
                "UPDATE \"FILE_LOAD_LEDGER\" SET \"STATUS_FLAG\" = 'DOWNSTREAM_COMPLETED'",
                &[],
            )
            .await
            .unwrap();

        assert!(ledger.should_skip(&mut session, file.path()).await);
    }

    #[tokio::test]
    async fn test_unreadable_stored_timestamp_fails_closed() {
        let (mut session, ledger, file) = setup().await;
        let mtime = last_modified(file.path()).await.unwrap();

        let entry = entry_for(file.path(), mtime, LedgerStatus::Completed);
        ledger.record(&mut session, &entry).await.unwrap();
        session
            .execute(
                "UPDATE \"FILE_LOAD_LEDGER\" SET \"LAST_MODIFIED\" = 'yesterday'",
                &[],
            )
            .await
            .unwrap();

        assert!(ledger.should_skip(&mut session, file.path()).await);
    }

    #[tokio::test]
    async fn test_lookup_failure_fails_closed() {
        let mut session = DbSession::sqlite_in_memory().await.unwrap();
        let ledger = Ledger::new("MISSING_LEDGER").unwrap();

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "a").unwrap();

        assert!(ledger.should_skip(&mut session, file.path()).await);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_skipped() {
        let (mut session, ledger, _file) = setup().await;
        assert!(
            !ledger
                .should_skip(&mut session, Path::new("/no/such/dir/file.csv"))
                .await
        );
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let mut session = DbSession::sqlite_in_memory().await.unwrap();
        let ledger = Ledger::new("MISSING_LEDGER").unwrap();
        let entry = entry_for(
            Path::new("/tmp/x.csv"),
            RunStamp::now().as_datetime(),
            LedgerStatus::Started,
        );

        let err = ledger.record(&mut session, &entry).await.unwrap_err();
        assert!(matches!(err, LedgerError::Write { .. }));
    }

    #[test]
    fn test_blank_table_name_rejected() {
        let err = Ledger::new("  ").unwrap_err();
        assert!(matches!(err, LedgerError::Identifier(ref name) if name == "  "));
        assert!(err.to_string().contains("ledger table name"));
    }

    #[test]
    fn test_identity_uses_forward_slashes() {
        let identity = FileIdentity::of(Path::new("/data/in/sales.csv"));
        assert_eq!(identity.file_name, "sales.csv");
        assert_eq!(identity.directory, "/data/in");
    }
}
