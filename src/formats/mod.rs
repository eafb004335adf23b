//! Text encodings, dialect detection and delimited file readers

pub mod delimited;
pub mod dialect;
pub mod encoding;

pub use delimited::{BatchReader, ReadOptions};
pub use dialect::{DialectDetector, DialectProfile};
pub use encoding::TextEncoding;
