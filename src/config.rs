//! Configuration constants for the flat-file loader
//!
//! This module centralizes the tunable defaults and fixed names used throughout
//! the application.

use std::time::Duration;

// ============================================================================
// Connection Configuration
// ============================================================================

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(45);

/// Timeout for a single statement or transaction
///
/// A batch insert commits up to `DEFAULT_BATCH_SIZE` rows at once, which can
/// take a while on a busy server.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(180); // 3 minutes

// ============================================================================
// Streaming Configuration
// ============================================================================

/// Number of rows pulled from a source file per batch
///
/// Each batch is held in memory, normalized and inserted before the next one is
/// parsed, so this bounds the loader's working set regardless of file size.
pub const DEFAULT_BATCH_SIZE: usize = 50_000;

/// Upper bound on rows bound into a single INSERT statement
///
/// A batch is split into several statements; the effective row count per
/// statement is further capped by the backend's bind-parameter limit.
pub const DEFAULT_ROWS_PER_STATEMENT: usize = 1_000;

/// Size of the prefix read when sniffing a file's dialect
pub const SAMPLE_SIZE: usize = 4096; // 4 KB

/// Maximum number of rows after the first one inspected by header detection
pub const HEADER_SNIFF_ROWS: usize = 20;

// ============================================================================
// Target Table Configuration
// ============================================================================

/// Width of every text column created in a target table
pub const DEFAULT_TEXT_WIDTH: u32 = 255;

/// Name of the column injected into every row with the run's load timestamp
pub const LOAD_TIMESTAMP_COLUMN: &str = "LOAD_TIMESTAMP";

/// Values treated as missing and stored as SQL NULL
pub const NULL_TOKENS: &[&str] = &[
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

// ============================================================================
// Ledger & Run Configuration
// ============================================================================

pub const DEFAULT_LEDGER_TABLE: &str = "FILE_LOAD_LEDGER";

pub const DEFAULT_MANIFEST: &str = "File_Locations.txt";

pub const ARCHIVE_DIR_NAME: &str = "archive";

/// File extensions (lowercase, without dot) eligible for loading
pub const ELIGIBLE_EXTENSIONS: &[&str] = &["csv", "txt"];

/// chrono format of timestamps stored in the ledger and target tables
pub const SQL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// chrono format of the suffix appended to archived file names
pub const FILE_SUFFIX_FORMAT: &str = "%Y%m%d_%H%M%S";
