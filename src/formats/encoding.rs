use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use std::borrow::Cow;
use std::fmt;
use tracing::warn;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// A text encoding a source file may be decoded under
///
/// Only ASCII-compatible encodings are accepted so that delimiters, quotes and
/// line breaks can be located on raw bytes before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEncoding {
    label: String,
    encoding: &'static Encoding,
    strip_bom: bool,
}

impl TextEncoding {
    /// UTF-8 that tolerates (and removes) a leading byte-order mark
    pub fn utf8_sig() -> Self {
        Self {
            label: "utf-8-sig".to_string(),
            encoding: UTF_8,
            strip_bom: true,
        }
    }

    /// Single-byte fallback that decodes any byte sequence
    pub fn latin1() -> Self {
        Self {
            label: "latin1".to_string(),
            encoding: WINDOWS_1252,
            strip_bom: false,
        }
    }

    /// Resolve a user-supplied label (as written in the manifest)
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label.trim().to_ascii_lowercase();
        if matches!(normalized.as_str(), "utf-8-sig" | "utf_8_sig" | "utf8-sig") {
            return Some(Self::utf8_sig());
        }

        let encoding = Encoding::for_label(normalized.as_bytes())?;
        if !encoding.is_ascii_compatible() {
            return None;
        }

        Some(Self {
            label: normalized,
            encoding,
            strip_bom: false,
        })
    }

    /// Ordered encodings to attempt for one file: the override first (when it
    /// is recognised), then the built-in fallbacks, without duplicates.
    pub fn candidates(override_label: Option<&str>) -> Vec<Self> {
        let mut candidates = Vec::with_capacity(3);

        if let Some(label) = override_label {
            match Self::from_label(label) {
                Some(encoding) => candidates.push(encoding),
                None => warn!("Ignoring unknown or unsupported encoding {:?}", label),
            }
        }

        for fallback in [Self::utf8_sig(), Self::latin1()] {
            if !candidates.iter().any(|c| c.same_decoding(&fallback)) {
                candidates.push(fallback);
            }
        }

        candidates
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Length of the byte-order mark at the start of `bytes`, if this encoding
    /// strips one.
    pub fn bom_len(&self, bytes: &[u8]) -> usize {
        if self.strip_bom && bytes.starts_with(UTF8_BOM) {
            UTF8_BOM.len()
        } else {
            0
        }
    }

    /// Strictly decode `bytes`; `None` when any sequence is malformed.
    pub fn decode<'a>(&self, bytes: &'a [u8]) -> Option<Cow<'a, str>> {
        let bytes = &bytes[self.bom_len(bytes)..];
        self.encoding
            .decode_without_bom_handling_and_without_replacement(bytes)
    }

    /// Decode a single field, which never carries a byte-order mark
    pub fn decode_field<'a>(&self, bytes: &'a [u8]) -> Option<Cow<'a, str>> {
        self.encoding
            .decode_without_bom_handling_and_without_replacement(bytes)
    }

    fn same_decoding(&self, other: &Self) -> bool {
        self.encoding == other.encoding && self.strip_bom == other.strip_bom
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}
