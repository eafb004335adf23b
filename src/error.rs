//! Error taxonomy for detection, loading and ledger bookkeeping.

use thiserror::Error;

/// Failure to infer a file's dialect from its leading sample.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("sample is not valid {encoding}")]
    Undecodable { encoding: String },

    #[error("could not determine a consistent delimiter from the sample")]
    NoDialect,

    #[error("failed to read sample: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure while streaming one file into its target table.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Detection(#[from] DetectionError),

    #[error("record {record} is not valid {encoding}")]
    Decode { record: u64, encoding: String },

    #[error("failed to create table {table}: {source}")]
    Schema {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("batch {batch} insert into {table} failed: {source}")]
    Insert {
        table: String,
        batch: usize,
        #[source]
        source: sqlx::Error,
    },

    #[error("record {record} has {found} fields, expected at most {expected}")]
    RaggedRecord {
        record: u64,
        expected: usize,
        found: usize,
    },

    #[error("invalid SQL identifier {0:?}")]
    Identifier(String),

    #[error("file contains no data rows")]
    NoData,

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoadError {
    /// Errors tied to the chosen text encoding; the loader retries these with the
    /// next candidate encoding instead of failing the file.
    pub fn is_encoding_specific(&self) -> bool {
        matches!(self, LoadError::Detection(_) | LoadError::Decode { .. })
    }
}

/// Failure reading or writing the control ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger lookup for {file} failed: {source}")]
    Lookup {
        file: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("ledger write for {file} failed: {source}")]
    Write {
        file: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("ledger holds unreadable timestamp {value:?} for {file}")]
    Timestamp { file: String, value: String },

    #[error("invalid ledger table name {0:?}")]
    Identifier(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_specific_errors() {
        assert!(LoadError::Detection(DetectionError::NoDialect).is_encoding_specific());
        assert!(
            LoadError::Decode {
                record: 3,
                encoding: "utf-8-sig".to_string()
            }
            .is_encoding_specific()
        );
        assert!(!LoadError::NoData.is_encoding_specific());
        assert!(
            !LoadError::RaggedRecord {
                record: 1,
                expected: 2,
                found: 3
            }
            .is_encoding_specific()
        );
    }
}
