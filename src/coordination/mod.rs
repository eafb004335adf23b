//! File-level coordination: manifest expansion, per-file loading, archiving

pub mod archive;
pub mod loader;
pub mod manifest;
pub mod orchestrator;
pub mod stamp;

pub use archive::{Archiver, SiblingDirArchiver};
pub use loader::{LoadOutcome, Loader, LoaderConfig};
pub use manifest::{LoadManifestEntry, LoadOverrides, SourceFile};
pub use orchestrator::{FileReport, FileState, Orchestrator, RunSummary};
pub use stamp::RunStamp;
