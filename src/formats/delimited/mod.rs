//! Streaming reader for delimited text files

pub mod reader;

pub use reader::{BatchReader, ReadOptions};
