use clap::builder::BoolishValueParser;
use clap::{Parser, Subcommand};
use flatfile_loader::coordination::orchestrator::{FileState, RunSummary};
use flatfile_loader::runner::{Environment, RunArgs, run};
use std::path::PathBuf;

#[derive(Parser, Clone)]
#[command(version, about = "Incrementally load delimited flat files into database tables")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Subcommand)]
enum Command {
    /// Load every new or changed file listed in the manifest
    Run {
        /// Manifest listing files and directories to load (CSV or .json)
        #[arg(short, long, default_value = "File_Locations.txt")]
        manifest: PathBuf,

        /// Directory that relative manifest paths resolve against
        #[arg(long, default_value = ".")]
        base_dir: PathBuf,

        /// Database URL (postgres://... or sqlite:...); falls back to
        /// DATABASE_URL_<ENV>, then DATABASE_URL
        #[arg(short, long)]
        database_url: Option<String>,

        /// Target environment (DEV, UAT/QA, PRD/PROD; anything else is SBX)
        #[arg(short, long, env = "ENVIRONMENT", default_value = "SBX")]
        environment: String,

        /// Reload files even when the ledger says they are unchanged
        #[arg(long, env = "FORCE_LOAD", value_parser = BoolishValueParser::new())]
        force_load: bool,

        /// Move successfully loaded files into a sibling archive directory
        #[arg(long, env = "FILE_ARCHIVE", value_parser = BoolishValueParser::new())]
        archive: bool,

        /// Name of the ledger table
        #[arg(long, default_value = "FILE_LOAD_LEDGER")]
        ledger_table: String,

        /// Rows read and inserted per transaction
        #[arg(short, long, default_value = "50000")]
        batch_size: usize,

        /// Width of the VARCHAR columns in created tables
        #[arg(long, default_value = "255")]
        text_width: u32,

        /// Quiet mode - minimal output, only show summary
        #[arg(short, long)]
        quiet: bool,

        /// Show which files would be loaded without touching any table
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run {
            manifest,
            base_dir,
            database_url,
            environment,
            force_load,
            archive,
            ledger_table,
            batch_size,
            text_width,
            quiet,
            dry_run,
        } => {
            init_tracing(quiet);

            let environment = Environment::parse(&environment);
            if !quiet {
                println!("Flat File Loader");
                println!("================");
                println!("Environment: {}", environment);
                println!("Manifest: {}", base_dir.join(&manifest).display());
                println!("Force load: {}", force_load);
                println!("Archive: {}", archive);
                println!();
            }

            let result = run(RunArgs {
                manifest,
                base_dir,
                database_url,
                environment,
                force_load,
                archive,
                dry_run,
                quiet,
                ledger_table,
                batch_size,
                text_width,
            })
            .await?;

            println!();
            println!("Load Summary");
            println!("============");
            println!("Run ID: {}", result.run_id);
            println!("Run timestamp: {}", result.stamp);
            print_summary(&result.summary);

            if result.summary.failed > 0 {
                anyhow::bail!("{} file(s) failed to load", result.summary.failed);
            }
        }
    }
    Ok(())
}

fn init_tracing(quiet: bool) {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let default = if quiet {
        "flatfile_loader=warn,sqlx=off"
    } else {
        "flatfile_loader=info,sqlx=off"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn print_summary(summary: &RunSummary) {
    println!("Manifest entries: {}", summary.entries);
    println!("Invalid entries: {}", summary.invalid_entries);
    println!("Files discovered: {}", summary.discovered);
    println!("Files skipped: {}", summary.skipped);
    println!("Files succeeded: {}", summary.succeeded);
    println!("Files failed: {}", summary.failed);
    println!("Rows loaded: {}", summary.rows_loaded);
    println!("Duration: {:.2}s", summary.duration.as_secs_f64());

    if let (Some(p50), Some(p90), Some(p99)) = summary.stats.get_percentiles() {
        println!("Batch time: p50 {}ms, p90 {}ms, p99 {}ms", p50, p90, p99);
    }

    if summary.dry_run {
        println!();
        println!("DRY RUN MODE - No data was loaded");
        for report in &summary.reports {
            let decision = match report.state {
                FileState::Skipped => "skip",
                _ => "load",
            };
            println!(
                "  {} {} -> {}",
                decision,
                report.path.display(),
                report.table
            );
        }
        println!();
        println!("To execute, run without --dry-run");
        return;
    }

    let failures: Vec<_> = summary.failures().collect();
    if !failures.is_empty() {
        println!();
        println!("Failed files:");
        for report in failures {
            println!(
                "  {} ({}): {}",
                report.path.display(),
                report.table,
                report.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    let warned: Vec<_> = summary
        .reports
        .iter()
        .filter(|r| !r.warnings.is_empty())
        .collect();
    if !warned.is_empty() {
        println!();
        println!("Warnings:");
        for report in warned {
            for warning in &report.warnings {
                println!("  {}: {}", report.path.display(), warning);
            }
        }
    }
}
