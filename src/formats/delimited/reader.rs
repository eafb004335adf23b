use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use csv::ByteRecord;

use crate::config::NULL_TOKENS;
use crate::db::schema::{RowValues, normalize_header, synthesize_column_names};
use crate::error::LoadError;
use crate::formats::encoding::TextEncoding;

/// How to parse one delimited file
#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub delimiter: u8,
    pub quote: u8,
    pub has_header: bool,
    pub skip_rows: usize,
    pub batch_size: usize,
    pub encoding: TextEncoding,
}

/// Streaming reader yielding fixed-size batches of decoded rows
///
/// Values are kept as opaque text; null-like tokens become `None`. Rows
/// shorter than the column list are padded with `None`, longer rows fail.
pub struct BatchReader {
    records: csv::Reader<BufReader<File>>,
    encoding: TextEncoding,
    columns: Vec<String>,
    batch_size: usize,
    record_no: u64,
    pending: Option<Vec<String>>,
    done: bool,
}

impl BatchReader {
    pub fn open(path: &Path, options: ReadOptions) -> Result<Self, LoadError> {
        let mut input = BufReader::new(File::open(path)?);
        let bom = options.encoding.bom_len(input.fill_buf()?);
        input.consume(bom);

        let records = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(options.delimiter)
            .quote(options.quote)
            .from_reader(input);

        let mut reader = Self {
            records,
            encoding: options.encoding,
            columns: Vec::new(),
            batch_size: options.batch_size.max(1),
            record_no: 0,
            pending: None,
            done: false,
        };

        for _ in 0..options.skip_rows {
            if reader.next_raw()?.is_none() {
                break;
            }
        }

        if options.has_header {
            if let Some(header) = reader.next_raw()? {
                reader.columns = normalize_header(&header);
            }
        } else if let Some(first) = reader.next_raw()? {
            reader.columns = synthesize_column_names(first.len());
            reader.pending = Some(first);
        }

        Ok(reader)
    }

    /// Normalized source column names (without the injected timestamp)
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Read and decode the next record without any shape checks
    fn next_raw(&mut self) -> Result<Option<Vec<String>>, LoadError> {
        let mut record = ByteRecord::new();
        if !self.records.read_byte_record(&mut record)? {
            return Ok(None);
        }
        self.record_no += 1;

        record
            .iter()
            .map(|field| {
                self.encoding
                    .decode_field(field)
                    .map(|value| value.into_owned())
                    .ok_or_else(|| LoadError::Decode {
                        record: self.record_no,
                        encoding: self.encoding.label().to_string(),
                    })
            })
            .collect::<Result<Vec<String>, LoadError>>()
            .map(Some)
    }

    fn next_row(&mut self) -> Result<Option<RowValues>, LoadError> {
        let row = match self.pending.take() {
            Some(row) => Some(row),
            None => self.next_raw()?,
        };

        let Some(fields) = row else {
            return Ok(None);
        };

        let expected = self.columns.len();
        if fields.len() > expected {
            return Err(LoadError::RaggedRecord {
                record: self.record_no,
                expected,
                found: fields.len(),
            });
        }

        let mut row: RowValues = fields
            .into_iter()
            .map(|value| {
                if NULL_TOKENS.contains(&value.as_str()) {
                    None
                } else {
                    Some(value)
                }
            })
            .collect();
        row.resize(expected, None);
        Ok(Some(row))
    }

    fn next_batch(&mut self) -> Result<Option<Vec<RowValues>>, LoadError> {
        let mut batch = Vec::with_capacity(self.batch_size.min(4096));
        while batch.len() < self.batch_size {
            match self.next_row()? {
                Some(row) => batch.push(row),
                None => break,
            }
        }
        Ok(if batch.is_empty() { None } else { Some(batch) })
    }
}

impl Iterator for BatchReader {
    type Item = Result<Vec<RowValues>, LoadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
