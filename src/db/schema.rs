use std::collections::HashSet;
use std::path::Path;

use crate::config::LOAD_TIMESTAMP_COLUMN;
use crate::db::session::{Backend, SqlValue, Statement};
use crate::error::LoadError;

/// One row of source values, already aligned to the table's source columns
pub type RowValues = Vec<Option<String>>;

/// Derive a target table name from a source file name: the file stem,
/// uppercased, with every non-alphanumeric character replaced by `_`.
pub fn sanitize_table_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    stem.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Validate an identifier and wrap it in double quotes
///
/// Every table and column name that reaches generated SQL goes through here.
pub fn quote_identifier(name: &str) -> Result<String, LoadError> {
    if name.trim().is_empty() || name.contains('\0') {
        return Err(LoadError::Identifier(name.to_string()));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Uppercase names and make them unique: a repeated name gets the next free
/// `_<n>` suffix, re-checked against every name already taken.
pub fn deduplicate_columns<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen: HashSet<String> = HashSet::new();
    let mut next_suffix: std::collections::HashMap<String, usize> = Default::default();
    let mut result = Vec::new();

    for name in names {
        let upper = name.as_ref().to_uppercase();
        if seen.insert(upper.clone()) {
            result.push(upper);
            continue;
        }

        let counter = next_suffix.entry(upper.clone()).or_insert(0);
        let candidate = loop {
            *counter += 1;
            let candidate = format!("{}_{}", upper, counter);
            if !seen.contains(&candidate) {
                break candidate;
            }
        };
        seen.insert(candidate.clone());
        result.push(candidate);
    }

    result
}

/// Turn a raw header record into column names: trimmed, uppercased, empty
/// names replaced by `UNNAMED_<position>`, then de-duplicated.
pub fn normalize_header(raw: &[String]) -> Vec<String> {
    let names = raw.iter().enumerate().map(|(i, name)| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            format!("UNNAMED_{}", i + 1)
        } else {
            trimmed.to_string()
        }
    });
    deduplicate_columns(names)
}

/// Column names for a file without a header: `COL001`, `COL002`, ...
pub fn synthesize_column_names(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("COL{:03}", i)).collect()
}

/// Shape of a target table: source columns plus the injected load timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    table: String,
    columns: Vec<String>,
}

impl TableSchema {
    pub fn new(table: &str, source_columns: &[String]) -> Result<Self, LoadError> {
        quote_identifier(table)?;

        let columns = deduplicate_columns(
            source_columns
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(LOAD_TIMESTAMP_COLUMN)),
        );
        for column in &columns {
            quote_identifier(column)?;
        }

        Ok(Self {
            table: table.to_string(),
            columns,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// All column names, the injected timestamp column last
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of columns that come from the source file
    pub fn source_width(&self) -> usize {
        self.columns.len() - 1
    }

    fn quoted_table(&self) -> String {
        format!("\"{}\"", self.table.replace('"', "\"\""))
    }

    fn quoted_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .map(|c| format!("\"{}\"", c.replace('"', "\"\"")))
            .collect()
    }

    pub fn drop_ddl(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", self.quoted_table())
    }

    /// Generate DDL creating the table with every column as `VARCHAR(width)`
    pub fn create_ddl(&self, width: u32) -> String {
        let column_defs: Vec<String> = self
            .quoted_columns()
            .into_iter()
            .map(|col| format!("  {} VARCHAR({})", col, width))
            .collect();

        format!(
            "CREATE TABLE {} (\n{}\n)",
            self.quoted_table(),
            column_defs.join(",\n")
        )
    }

    /// Build multi-row parameterized INSERT statements for a batch
    ///
    /// Each row is bound with its source values followed by `load_stamp`. Rows
    /// per statement are capped so that no statement exceeds the backend's
    /// bind-parameter limit.
    pub fn insert_statements(
        &self,
        backend: Backend,
        rows: &[RowValues],
        load_stamp: &str,
        rows_per_statement: usize,
    ) -> Vec<Statement> {
        let width = self.columns.len();
        let per_statement = rows_per_statement
            .min(backend.max_bind_params() / width)
            .max(1);

        let prefix = format!(
            "INSERT INTO {} ({}) VALUES ",
            self.quoted_table(),
            self.quoted_columns().join(", ")
        );

        rows.chunks(per_statement)
            .map(|chunk| {
                let mut params = Vec::with_capacity(chunk.len() * width);
                let mut tuples = Vec::with_capacity(chunk.len());

                for row in chunk {
                    let start = params.len();
                    for i in 0..self.source_width() {
                        params.push(SqlValue::Text(row.get(i).cloned().flatten()));
                    }
                    params.push(SqlValue::text(load_stamp));

                    let placeholders: Vec<String> = (start + 1..=params.len())
                        .map(|n| backend.placeholder(n))
                        .collect();
                    tuples.push(format!("({})", placeholders.join(", ")));
                }

                Statement {
                    sql: format!("{}{}", prefix, tuples.join(", ")),
                    params,
                }
            })
            .collect()
    }
}
