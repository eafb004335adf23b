//! I/O abstraction layer for reading staged source files

pub mod byte_reader;
pub mod local_reader;

pub use byte_reader::{ByteReader, read_sample};
pub use local_reader::LocalFileByteReader;
