//! High-level runner API for the incremental flat-file loader.
//!
//! This module wires the pieces together: it resolves the database URL,
//! opens the single session, prepares the ledger, reads the manifest and hands
//! everything to the orchestrator.
//!
//! This is the primary API for external users and for the CLI.

use anyhow::{Context, Result, bail};
use std::fmt;
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

use crate::config::{
    DEFAULT_BATCH_SIZE, DEFAULT_LEDGER_TABLE, DEFAULT_MANIFEST, DEFAULT_TEXT_WIDTH,
};
use crate::coordination::archive::SiblingDirArchiver;
use crate::coordination::loader::LoaderConfigBuilder;
use crate::coordination::manifest::read_manifest;
use crate::coordination::orchestrator::{Orchestrator, RunSummary};
use crate::coordination::stamp::RunStamp;
use crate::db::ledger::Ledger;
use crate::db::session::DbSession;

/// Deployment environment the run targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    Dev,
    Uat,
    Prd,
    #[default]
    Sbx,
}

impl Environment {
    /// Map a selector onto an environment (case-insensitive); unknown values mean SBX
    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "DEV" => Environment::Dev,
            "UAT" | "QA" => Environment::Uat,
            "PRD" | "PROD" => Environment::Prd,
            _ => Environment::Sbx,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "DEV",
            Environment::Uat => "UAT",
            Environment::Prd => "PRD",
            Environment::Sbx => "SBX",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments for one orchestrated run
#[derive(Debug, Clone)]
pub struct RunArgs {
    /// Manifest file; relative paths resolve against `base_dir`
    pub manifest: PathBuf,
    /// Directory relative manifest and entry paths resolve against
    pub base_dir: PathBuf,

    // Connection configuration
    pub database_url: Option<String>,
    pub environment: Environment,

    // Run behaviour
    pub force_load: bool,
    pub archive: bool,
    pub dry_run: bool,
    pub quiet: bool,

    // Load tuning
    pub ledger_table: String,
    pub batch_size: usize,
    pub text_width: u32,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from(DEFAULT_MANIFEST),
            base_dir: PathBuf::from("."),
            database_url: None,
            environment: Environment::default(),
            force_load: false,
            archive: false,
            dry_run: false,
            quiet: false,
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            text_width: DEFAULT_TEXT_WIDTH,
        }
    }
}

/// Result of a completed run
#[derive(Debug)]
pub struct RunResult {
    pub run_id: String,
    pub environment: Environment,
    /// Timestamp shared by the ledger, loaded rows and archived file names
    pub stamp: RunStamp,
    pub summary: RunSummary,
}

/// Pick the database URL: the explicit one, then `DATABASE_URL_<ENV>`, then `DATABASE_URL`
pub fn resolve_database_url(
    explicit: Option<&str>,
    environment: Environment,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String> {
    if let Some(url) = explicit.filter(|u| !u.trim().is_empty()) {
        return Ok(url.to_string());
    }

    let scoped = format!("DATABASE_URL_{}", environment);
    for key in [scoped.as_str(), "DATABASE_URL"] {
        if let Some(url) = lookup(key).filter(|u| !u.trim().is_empty()) {
            return Ok(url);
        }
    }

    bail!(
        "No database URL configured. Pass --database-url or set {} or DATABASE_URL",
        scoped
    )
}

/// Run one incremental load pass over the manifest
///
/// Per-file failures end up in the ledger and in the returned summary; only
/// setup problems (bad manifest, unreachable database, unusable ledger table)
/// fail the whole run.
///
/// # Example
///
/// ```no_run
/// use flatfile_loader::runner::{Environment, RunArgs, run};
///
/// # async fn example() -> anyhow::Result<()> {
/// let args = RunArgs {
///     database_url: Some("sqlite:loads.db".to_string()),
///     environment: Environment::Dev,
///     archive: true,
///     quiet: true,
///     ..RunArgs::default()
/// };
///
/// let result = run(args).await?;
/// println!("{} loaded, {} failed", result.summary.succeeded, result.summary.failed);
/// # Ok(())
/// # }
/// ```
pub async fn run(args: RunArgs) -> Result<RunResult> {
    let run_id = Uuid::new_v4().to_string();
    let stamp = RunStamp::now();
    info!("Starting run {} in {} at {}", run_id, args.environment, stamp);

    let manifest_path = args.base_dir.join(&args.manifest);
    let entries = read_manifest(&manifest_path, &args.base_dir).await?;

    let url = resolve_database_url(args.database_url.as_deref(), args.environment, |key| {
        std::env::var(key).ok()
    })?;
    let mut session = DbSession::connect(&url)
        .await
        .context("Failed to connect to the database")?;

    let ledger = Ledger::new(&args.ledger_table)?;
    ledger
        .ensure_table(&mut session)
        .await
        .with_context(|| format!("Failed to prepare ledger table {}", args.ledger_table))?;

    let loader_config = LoaderConfigBuilder::default()
        .batch_size(args.batch_size.max(1))
        .text_width(args.text_width)
        .build()?;

    let mut orchestrator = Orchestrator::new(loader_config, ledger, stamp)
        .force_load(args.force_load)
        .dry_run(args.dry_run)
        .quiet(args.quiet);
    if args.archive {
        orchestrator = orchestrator.with_archiver(Box::new(SiblingDirArchiver::default()));
    }

    let summary = orchestrator.run(&mut session, &entries).await?;
    session
        .close()
        .await
        .context("Failed to close the database session")?;

    Ok(RunResult {
        run_id,
        environment: args.environment,
        stamp,
        summary,
    })
}
