//! Dialect inference for delimited text files
//!
//! Given a decoded sample from the start of a file, works out which delimiter
//! and quote character the file uses and whether its first record is a header.
//! Quote placement is the strongest signal; when the sample has no quoted
//! fields, the delimiter is the candidate whose per-line frequency is most
//! consistent.

use std::collections::HashMap;
use std::fmt;

use crate::config::{HEADER_SNIFF_ROWS, SAMPLE_SIZE};
use crate::error::DetectionError;
use crate::formats::encoding::TextEncoding;
use crate::io::{ByteReader, read_sample};

/// Delimiters considered during detection
pub const CANDIDATE_DELIMITERS: &[char] = &[',', ';', '\t', '|', '^', '#'];

/// Tie-break order when several delimiters are equally consistent
const DELIMITER_PREFERENCE: &[char] = &[',', '\t', ';', '|', '^', '#'];

const CANDIDATE_QUOTES: &[char] = &['"', '\''];

pub const DEFAULT_QUOTE: u8 = b'"';

/// Detected (or overridden) shape of a delimited file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialectProfile {
    pub delimiter: u8,
    pub quote: u8,
    pub has_header: bool,
    pub encoding: TextEncoding,
}

impl DialectProfile {
    /// Delimiter rendered for logs and the ledger (TAB shown as `\t`)
    pub fn delimiter_label(&self) -> String {
        byte_label(self.delimiter)
    }

    pub fn quote_label(&self) -> String {
        byte_label(self.quote)
    }
}

impl fmt::Display for DialectProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "delimiter={:?} quote={:?} header={} encoding={}",
            self.delimiter_label(),
            self.quote_label(),
            self.has_header,
            self.encoding
        )
    }
}

pub(crate) fn byte_label(byte: u8) -> String {
    match byte {
        b'\t' => "\\t".to_string(),
        other => (other as char).to_string(),
    }
}

/// Result of sniffing a decoded sample, before an encoding is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SniffedDialect {
    pub delimiter: u8,
    pub quote: u8,
    pub has_header: bool,
}

#[derive(Debug, Clone)]
pub struct DialectDetector {
    sample_size: usize,
}

impl Default for DialectDetector {
    fn default() -> Self {
        Self::new(SAMPLE_SIZE)
    }
}

impl DialectDetector {
    pub fn new(sample_size: usize) -> Self {
        Self { sample_size }
    }

    /// Sample the file under `encoding` and infer its dialect
    ///
    /// The first `skip_rows` records of the sample are dropped first, so a
    /// preamble the reader will skip never votes on the delimiter or header.
    pub async fn detect(
        &self,
        reader: &dyn ByteReader,
        encoding: &TextEncoding,
        skip_rows: usize,
    ) -> Result<DialectProfile, DetectionError> {
        let bytes = read_sample(reader, self.sample_size).await?;
        let sample = encoding
            .decode(&bytes)
            .ok_or_else(|| DetectionError::Undecodable {
                encoding: encoding.label().to_string(),
            })?;

        let sniffed = self.sniff(skip_records(&sample, skip_rows))?;
        Ok(DialectProfile {
            delimiter: sniffed.delimiter,
            quote: sniffed.quote,
            has_header: sniffed.has_header,
            encoding: encoding.clone(),
        })
    }

    /// Infer the dialect of an already decoded sample
    pub fn sniff(&self, sample: &str) -> Result<SniffedDialect, DetectionError> {
        let lines: Vec<&str> = sample
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .filter(|line| !line.is_empty())
            .collect();
        if lines.is_empty() {
            return Err(DetectionError::NoDialect);
        }

        let (quote, quoted_delimiter) = guess_quote_and_delimiter(&lines);
        let quote = quote.unwrap_or(DEFAULT_QUOTE as char);

        let delimiter = match quoted_delimiter {
            Some(delimiter) => delimiter,
            None => guess_delimiter(&lines, quote).ok_or(DetectionError::NoDialect)?,
        };

        let has_header = has_header(sample, delimiter as u8, quote as u8);

        Ok(SniffedDialect {
            delimiter: delimiter as u8,
            quote: quote as u8,
            has_header,
        })
    }
}

/// The rest of `sample` after its first `count` records
///
/// A newline inside a double-quoted value does not end a record.
fn skip_records(sample: &str, count: usize) -> &str {
    if count == 0 {
        return sample;
    }

    let mut remaining = count;
    let mut in_quote = false;
    for (i, c) in sample.char_indices() {
        match c {
            '"' => in_quote = !in_quote,
            '\n' if !in_quote => {
                remaining -= 1;
                if remaining == 0 {
                    return &sample[i + 1..];
                }
            }
            _ => {}
        }
    }
    ""
}

fn is_candidate_delimiter(c: char) -> bool {
    CANDIDATE_DELIMITERS.contains(&c)
}

/// Look for fields wrapped in a quote character that open at the start of a
/// line or right after a delimiter, and close at the end of a line or right
/// before one. Returns the most frequent quote and, if any, the delimiter seen
/// next to it most often.
fn guess_quote_and_delimiter(lines: &[&str]) -> (Option<char>, Option<char>) {
    let mut quote_counts: HashMap<char, usize> = HashMap::new();
    let mut delimiter_counts: HashMap<(char, char), usize> = HashMap::new();

    for line in lines {
        let chars: Vec<char> = line.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if !CANDIDATE_QUOTES.contains(&c) {
                i += 1;
                continue;
            }

            let leading = leading_delimiter(&chars, i);
            let opens = i == 0 || leading.is_some();
            let close = chars[i + 1..].iter().position(|&x| x == c).map(|p| p + i + 1);

            match close {
                Some(j) if opens => {
                    let trailing = chars.get(j + 1).copied();
                    let closes = trailing.is_none_or(is_candidate_delimiter);
                    if !closes {
                        i += 1;
                        continue;
                    }

                    *quote_counts.entry(c).or_default() += 1;
                    for delimiter in [leading, trailing].into_iter().flatten() {
                        *delimiter_counts.entry((c, delimiter)).or_default() += 1;
                    }
                    i = j + 1;
                }
                _ => i += 1,
            }
        }
    }

    let quote = CANDIDATE_QUOTES
        .iter()
        .copied()
        .filter(|q| quote_counts.contains_key(q))
        .max_by_key(|q| (quote_counts[q], *q == '"'));

    let delimiter = quote.and_then(|q| {
        DELIMITER_PREFERENCE
            .iter()
            .rev()
            .copied()
            .filter(|d| delimiter_counts.contains_key(&(q, *d)))
            .max_by_key(|d| delimiter_counts[&(q, *d)])
    });

    (quote, delimiter)
}

fn leading_delimiter(chars: &[char], quote_pos: usize) -> Option<char> {
    if quote_pos == 0 {
        return None;
    }
    let prev = chars[quote_pos - 1];
    if is_candidate_delimiter(prev) {
        return Some(prev);
    }
    // Allow one space between the delimiter and the opening quote
    if prev == ' ' && quote_pos >= 2 && is_candidate_delimiter(chars[quote_pos - 2]) {
        return Some(chars[quote_pos - 2]);
    }
    None
}

/// Remove quoted regions so delimiters inside values are not counted
fn strip_quoted(line: &str, quote: char) -> String {
    let mut in_quote = false;
    line.chars()
        .filter(|&c| {
            if c == quote {
                in_quote = !in_quote;
                return false;
            }
            !in_quote
        })
        .collect()
}

/// Pick the delimiter whose per-line count is the same on the largest share of
/// lines, requiring at least 90% agreement.
fn guess_delimiter(lines: &[&str], quote: char) -> Option<char> {
    let stripped: Vec<String> = lines.iter().map(|l| strip_quoted(l, quote)).collect();
    let total = stripped.len();

    // (delimiter, lines agreeing with the modal count)
    let mut modes: Vec<(char, usize)> = Vec::new();
    for &delimiter in CANDIDATE_DELIMITERS {
        let mut frequency: HashMap<usize, usize> = HashMap::new();
        for line in &stripped {
            let count = line.chars().filter(|&c| c == delimiter).count();
            *frequency.entry(count).or_default() += 1;
        }

        if let Some((count, agreeing)) = frequency
            .into_iter()
            .max_by_key(|&(count, agreeing)| (agreeing, count))
            && count > 0
        {
            modes.push((delimiter, agreeing));
        }
    }

    for pct in (90..=100).rev() {
        let consistent: Vec<char> = modes
            .iter()
            .filter(|&&(_, agreeing)| agreeing * 100 >= pct * total)
            .map(|&(d, _)| d)
            .collect();

        if !consistent.is_empty() {
            return DELIMITER_PREFERENCE
                .iter()
                .copied()
                .find(|d| consistent.contains(d));
        }
    }

    None
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ColumnKind {
    Unseen,
    Numeric,
    Length(usize),
}

fn is_numeric(value: &str) -> bool {
    value.trim().parse::<f64>().is_ok()
}

fn kind_of(value: &str) -> ColumnKind {
    if is_numeric(value) {
        ColumnKind::Numeric
    } else {
        ColumnKind::Length(value.chars().count())
    }
}

/// Decide whether the first record is a header by comparing each column's
/// shape in the first record with its shape in the following records.
fn has_header(sample: &str, delimiter: u8, quote: u8) -> bool {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .quote(quote)
        .from_reader(sample.as_bytes());

    let mut records = reader.records().filter_map(Result::ok);
    let Some(header) = records.next() else {
        return false;
    };
    let columns = header.len();

    // None marks a column whose shape was inconsistent across rows
    let mut kinds: Vec<Option<ColumnKind>> = vec![Some(ColumnKind::Unseen); columns];

    for row in records.take(HEADER_SNIFF_ROWS) {
        if row.len() != columns {
            continue;
        }
        for (col, slot) in kinds.iter_mut().enumerate() {
            let Some(current) = *slot else { continue };
            let this = kind_of(&row[col]);
            if current == ColumnKind::Unseen {
                *slot = Some(this);
            } else if current != this {
                *slot = None;
            }
        }
    }

    let mut votes: i64 = 0;
    for (col, kind) in kinds.iter().enumerate() {
        match kind {
            Some(ColumnKind::Length(len)) => {
                if header[col].chars().count() != *len {
                    votes += 1;
                } else {
                    votes -= 1;
                }
            }
            Some(ColumnKind::Numeric) => {
                if is_numeric(&header[col]) {
                    votes -= 1;
                } else {
                    votes += 1;
                }
            }
            Some(ColumnKind::Unseen) => votes += 1,
            None => {}
        }
    }

    votes > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;
    use std::time::SystemTime;

    fn sniff(sample: &str) -> SniffedDialect {
        DialectDetector::default().sniff(sample).unwrap()
    }

    #[test]
    fn test_comma_with_header() {
        let dialect = sniff("id,name,amount\n1,Alice,10.5\n2,Bob,20\n");
        assert_eq!(dialect.delimiter, b',');
        assert_eq!(dialect.quote, b'"');
        assert!(dialect.has_header);
    }

    #[test]
    fn test_quoted_semicolon() {
        let dialect = sniff("\"id\";\"name\"\n\"1\";\"Alice\"\n\"2\";\"Bob\"\n");
        assert_eq!(dialect.delimiter, b';');
        assert_eq!(dialect.quote, b'"');
        assert!(dialect.has_header);
    }

    #[test]
    fn test_commas_inside_quotes_do_not_win() {
        let dialect = sniff("name;note\n\"Smith, J\";ok\n\"Doe, A\";fine\n");
        assert_eq!(dialect.delimiter, b';');
    }

    #[test]
    fn test_single_quote_detected() {
        let dialect = sniff("id,'name'\n1,'Alice'\n2,'Bob'\n");
        assert_eq!(dialect.delimiter, b',');
        assert_eq!(dialect.quote, b'\'');
    }

    #[test]
    fn test_tab_and_pipe() {
        assert_eq!(sniff("a\tb\n1\t2\n3\t4\n").delimiter, b'\t');
        assert_eq!(sniff("x|y\n1|2\n3|4\n").delimiter, b'|');
        assert_eq!(sniff("x^y\n1^2\n").delimiter, b'^');
    }

    #[test]
    fn test_numeric_first_row_is_not_header() {
        let dialect = sniff("1,2,3\n4,5,6\n7,8,9\n");
        assert_eq!(dialect.delimiter, b',');
        assert!(!dialect.has_header);
    }

    #[test]
    fn test_crlf_lines() {
        let dialect = sniff("id;value\r\n1;10\r\n2;20\r\n");
        assert_eq!(dialect.delimiter, b';');
        assert!(dialect.has_header);
    }

    #[test]
    fn test_no_delimiter_found() {
        let detector = DialectDetector::default();
        assert!(matches!(
            detector.sniff("hello world\nno delimiters here\n"),
            Err(DetectionError::NoDialect)
        ));
        assert!(matches!(detector.sniff(""), Err(DetectionError::NoDialect)));
    }

    struct MemoryReader(Vec<u8>);

    #[async_trait]
    impl ByteReader for MemoryReader {
        async fn size(&self) -> io::Result<u64> {
            Ok(self.0.len() as u64)
        }

        async fn read_range(&self, start: u64, end: u64) -> io::Result<Vec<u8>> {
            Ok(self.0[start as usize..end as usize].to_vec())
        }

        async fn modified(&self) -> io::Result<SystemTime> {
            Ok(SystemTime::UNIX_EPOCH)
        }
    }

    #[tokio::test]
    async fn test_detect_rejects_undecodable_sample() {
        let reader = MemoryReader(b"name,city\nJos\xE9,Par\xEDs\n".to_vec());
        let detector = DialectDetector::default();

        let err = detector
            .detect(&reader, &TextEncoding::utf8_sig(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, DetectionError::Undecodable { .. }));

        let profile = detector
            .detect(&reader, &TextEncoding::latin1(), 0)
            .await
            .unwrap();
        assert_eq!(profile.delimiter, b',');
        assert_eq!(profile.encoding.label(), "latin1");
    }

    #[tokio::test]
    async fn test_detect_strips_bom() {
        let reader = MemoryReader(b"\xEF\xBB\xBFid|name\n1|a\n2|b\n".to_vec());
        let profile = DialectDetector::default()
            .detect(&reader, &TextEncoding::utf8_sig(), 0)
            .await
            .unwrap();
        assert_eq!(profile.delimiter_label(), "|");
        assert!(profile.has_header);
    }

    #[test]
    fn test_skip_records() {
        assert_eq!(skip_records("a\nb\nc\n", 0), "a\nb\nc\n");
        assert_eq!(skip_records("a\nb\nc\n", 2), "c\n");
        assert_eq!(skip_records("\"x\ny\",1\nz,2\n", 1), "z,2\n");
        assert_eq!(skip_records("a\n", 3), "");
    }

    #[tokio::test]
    async fn test_detect_ignores_skipped_preamble() {
        let reader = MemoryReader(
            b"Exported by SAP on 2024-05-06\nid,name,amount\n1,Ann,10\n2,Bob,20\n".to_vec(),
        );
        let detector = DialectDetector::default();

        assert!(matches!(
            detector.detect(&reader, &TextEncoding::utf8_sig(), 0).await,
            Err(DetectionError::NoDialect)
        ));

        let profile = detector
            .detect(&reader, &TextEncoding::utf8_sig(), 1)
            .await
            .unwrap();
        assert_eq!(profile.delimiter, b',');
        assert!(profile.has_header);
    }

    #[tokio::test]
    async fn test_preamble_does_not_become_header_candidate() {
        let mut contents = String::from("Daily extract\n");
        for i in 1..=12 {
            contents.push_str(&format!("{},{}\n", i, i * 10));
        }
        let reader = MemoryReader(contents.into_bytes());

        let profile = DialectDetector::default()
            .detect(&reader, &TextEncoding::utf8_sig(), 1)
            .await
            .unwrap();
        assert_eq!(profile.delimiter, b',');
        assert!(!profile.has_header);
    }
}
