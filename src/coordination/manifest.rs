//! Load manifest: the list of files and directories a run should pick up,
//! with optional per-entry overrides.
//!
//! The manifest is a CSV file with a header row (`path` or the legacy
//! `File Name` column, plus optional override columns) or a JSON array of
//! objects with the same field names.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use glob::{MatchOptions, Pattern};
use serde::Deserialize;
use tokio::fs;
use tracing::{debug, warn};

use crate::config::ELIGIBLE_EXTENSIONS;
use crate::db::ledger::FileIdentity;
use crate::db::schema::sanitize_table_name;

/// Per-entry settings that take precedence over detection
///
/// `None` means "not set"; each field is resolved independently.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOverrides {
    pub skip_rows: Option<usize>,
    pub skip_footer: Option<usize>,
    pub encoding: Option<String>,
    pub has_header: Option<bool>,
    pub delimiter: Option<u8>,
    pub quote_char: Option<u8>,
}

impl LoadOverrides {
    /// True when detection has nothing left to decide
    pub fn covers_dialect(&self) -> bool {
        self.delimiter.is_some() && self.quote_char.is_some() && self.has_header.is_some()
    }
}

/// One requested load as listed in the manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadManifestEntry {
    pub path: PathBuf,
    pub table: Option<String>,
    pub overrides: LoadOverrides,
}

/// A concrete file to load, after directory expansion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub table: String,
    pub overrides: LoadOverrides,
}

impl SourceFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn identity(&self) -> FileIdentity {
        FileIdentity::of(&self.path)
    }
}

/// Result of expanding manifest entries into files
#[derive(Debug, Default)]
pub struct Expansion {
    pub files: Vec<SourceFile>,
    /// Entries that are neither an eligible file nor a directory
    pub invalid: Vec<PathBuf>,
}

/// Raw field value; CSV cells and JSON scalars both land here
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ManifestValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct ManifestRow {
    #[serde(alias = "File Name", alias = "file_name", alias = "PATH")]
    path: String,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    skip_rows: Option<ManifestValue>,
    #[serde(default)]
    skip_footer: Option<ManifestValue>,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    has_header: Option<ManifestValue>,
    #[serde(default)]
    delimiter: Option<ManifestValue>,
    #[serde(default)]
    quote_char: Option<ManifestValue>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_count(value: Option<ManifestValue>, field: &str) -> Result<Option<usize>> {
    match value {
        None => Ok(None),
        Some(ManifestValue::Int(n)) => usize::try_from(n)
            .map(Some)
            .map_err(|_| anyhow!("{} must not be negative, got {}", field, n)),
        Some(ManifestValue::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(ManifestValue::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{} is not a row count: {:?}", field, text)),
        Some(ManifestValue::Bool(b)) => bail!("{} is not a row count: {}", field, b),
    }
}

fn parse_flag(value: Option<ManifestValue>, field: &str) -> Result<Option<bool>> {
    match value {
        None => Ok(None),
        Some(ManifestValue::Bool(b)) => Ok(Some(b)),
        Some(ManifestValue::Int(0)) => Ok(Some(false)),
        Some(ManifestValue::Int(1)) => Ok(Some(true)),
        Some(ManifestValue::Text(text)) => match text.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "true" | "yes" | "y" | "1" => Ok(Some(true)),
            "false" | "no" | "n" | "0" => Ok(Some(false)),
            _ => bail!("{} is not a boolean: {:?}", field, text),
        },
        Some(ManifestValue::Int(n)) => bail!("{} is not a boolean: {}", field, n),
    }
}

/// Parse a delimiter or quote override: one ASCII character, or `\t` / `tab`
fn parse_byte(value: Option<ManifestValue>, field: &str) -> Result<Option<u8>> {
    let text = match value {
        None => return Ok(None),
        Some(ManifestValue::Text(text)) => text,
        Some(other) => bail!("{} must be a single character, got {:?}", field, other),
    };

    // Whitespace is significant here; only an empty cell means "unset"
    if text.is_empty() {
        return Ok(None);
    }
    if text == "\\t" || text.eq_ignore_ascii_case("tab") {
        return Ok(Some(b'\t'));
    }

    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii() && c != '\n' && c != '\r' => Ok(Some(c as u8)),
        _ => bail!("{} must be a single ASCII character, got {:?}", field, text),
    }
}

impl ManifestRow {
    fn into_entry(self, base_dir: &Path) -> Result<LoadManifestEntry> {
        let raw = self.path.trim();
        if raw.is_empty() {
            bail!("path is empty");
        }

        let path = Path::new(raw);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        };

        Ok(LoadManifestEntry {
            path,
            table: non_empty(self.table),
            overrides: LoadOverrides {
                skip_rows: parse_count(self.skip_rows, "skip_rows")?,
                skip_footer: parse_count(self.skip_footer, "skip_footer")?,
                encoding: non_empty(self.encoding),
                has_header: parse_flag(self.has_header, "has_header")?,
                delimiter: parse_byte(self.delimiter, "delimiter")?,
                quote_char: parse_byte(self.quote_char, "quote_char")?,
            },
        })
    }
}

/// Parse manifest contents; `.json` files are read as JSON, anything else as CSV
pub fn parse_manifest(
    contents: &str,
    is_json: bool,
    base_dir: &Path,
) -> Result<Vec<LoadManifestEntry>> {
    let contents = contents.trim_start_matches('\u{feff}');

    let rows: Vec<ManifestRow> = if is_json {
        serde_json::from_str(contents).context("Failed to parse JSON manifest")?
    } else {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::Headers)
            .flexible(true)
            .from_reader(contents.as_bytes());
        reader
            .deserialize::<ManifestRow>()
            .enumerate()
            .map(|(i, row)| row.with_context(|| format!("Invalid manifest row {}", i + 1)))
            .collect::<Result<_>>()?
    };

    rows.into_iter()
        .enumerate()
        .map(|(i, row)| {
            row.into_entry(base_dir)
                .with_context(|| format!("Invalid manifest entry {}", i + 1))
        })
        .collect()
}

/// Read the manifest at `path`, resolving relative entries against `base_dir`
pub async fn read_manifest(path: &Path, base_dir: &Path) -> Result<Vec<LoadManifestEntry>> {
    let contents = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let entries = parse_manifest(&contents, is_json, base_dir)
        .with_context(|| format!("Failed to parse manifest {}", path.display()))?;
    debug!("Read {} manifest entries from {}", entries.len(), path.display());
    Ok(entries)
}

pub fn is_eligible(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| ELIGIBLE_EXTENSIONS.contains(&ext.as_str()))
}

/// Eligible files directly inside `dir`, sorted by path
fn list_directory(dir: &Path) -> Result<Vec<PathBuf>> {
    let escaped = Pattern::escape(&dir.to_string_lossy());
    let options = MatchOptions {
        case_sensitive: false,
        ..Default::default()
    };

    let mut files = Vec::new();
    for ext in ELIGIBLE_EXTENSIONS {
        let pattern = format!("{}/*.{}", escaped, ext);
        let matches = glob::glob_with(&pattern, options)
            .with_context(|| format!("Invalid glob pattern {}", pattern))?;
        for entry in matches {
            match entry {
                Ok(path) if path.is_file() => files.push(path),
                Ok(_) => {}
                Err(e) => warn!("Unreadable entry in {}: {}", dir.display(), e),
            }
        }
    }

    files.sort();
    files.dedup();
    Ok(files)
}

/// Expand entries into concrete files
///
/// Files must carry an eligible extension; directories contribute their
/// eligible files (non-recursive). Anything else is reported as invalid. A
/// file reached twice is loaded once, with the first entry's settings.
pub async fn expand_entries(entries: &[LoadManifestEntry]) -> Result<Expansion> {
    let mut expansion = Expansion::default();
    let mut seen: HashSet<PathBuf> = HashSet::new();

    for entry in entries {
        let metadata = fs::metadata(&entry.path).await.ok();

        match metadata {
            Some(meta) if meta.is_file() && is_eligible(&entry.path) => {
                if seen.insert(entry.path.clone()) {
                    let table = entry
                        .table
                        .clone()
                        .unwrap_or_else(|| sanitize_table_name(&entry.path));
                    expansion.files.push(SourceFile {
                        path: entry.path.clone(),
                        table,
                        overrides: entry.overrides.clone(),
                    });
                }
            }
            Some(meta) if meta.is_dir() => {
                if let Some(table) = &entry.table {
                    warn!(
                        "Ignoring table {} for directory {}; each file gets its own table",
                        table,
                        entry.path.display()
                    );
                }

                let files = list_directory(&entry.path)?;
                debug!("Found {} files in {}", files.len(), entry.path.display());
                for path in files {
                    if seen.insert(path.clone()) {
                        expansion.files.push(SourceFile {
                            table: sanitize_table_name(&path),
                            path,
                            overrides: entry.overrides.clone(),
                        });
                    }
                }
            }
            _ => {
                warn!(
                    "Path does not exist or is not a .csv/.txt file: {}",
                    entry.path.display()
                );
                expansion.invalid.push(entry.path.clone());
            }
        }
    }

    Ok(expansion)
}
