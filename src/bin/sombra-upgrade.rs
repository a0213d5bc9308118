//! Binary entry point for the Sombra store upgrade CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sombra_upgrade::{
    admin::{verify, VerifyLevel, VerifyReport},
    config::KernelConfig,
    migration::{
        error_chain, GateDecision, PreconditionGate, StoreUpgrader, UpgradeReport, VersionCheck,
        VersionOracle,
    },
    primitives::txlog::TxLog,
    scheduler::JobScheduler,
    storage::{write_store, DatabaseLayout, GraphData, StoreFile, StoreVersion},
    types::Lsn,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "sombra-upgrade",
    version,
    about = "Inspect and upgrade Sombra record stores",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Report the store format of every store file")]
    Detect {
        #[arg(value_name = "DB_DIR")]
        db_path: PathBuf,
    },

    #[command(about = "Check whether the store was shut down cleanly")]
    Check {
        #[arg(value_name = "DB_DIR")]
        db_path: PathBuf,
    },

    #[command(about = "Upgrade the store to the current format if needed")]
    Migrate {
        #[arg(value_name = "DB_DIR")]
        db_path: PathBuf,

        #[arg(long, help = "Permit rewriting an outdated store")]
        allow_upgrade: bool,

        #[arg(
            long,
            value_name = "FILE",
            env = "SOMBRA_UPGRADE_CONFIG",
            help = "Kernel config file (defaults to the user config dir)"
        )]
        config: Option<PathBuf>,
    },

    #[command(about = "Run consistency checks over the store files")]
    Verify {
        #[arg(value_name = "DB_DIR")]
        db_path: PathBuf,

        #[arg(long, value_enum, default_value_t = VerifyLevelArg::Full)]
        level: VerifyLevelArg,
    },

    #[command(about = "Write a sample store in the given generation")]
    Init {
        #[arg(value_name = "DB_DIR")]
        db_path: PathBuf,

        #[arg(
            long,
            default_value_t = 2,
            value_parser = clap::value_parser!(u16).range(1..=2),
            help = "Store generation to write"
        )]
        generation: u16,

        #[arg(long, default_value_t = 16, help = "Number of sample nodes")]
        nodes: u64,

        #[arg(long, help = "Leave a transaction after the last checkpoint")]
        unclean: bool,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum VerifyLevelArg {
    Fast,
    Full,
}

impl From<VerifyLevelArg> for VerifyLevel {
    fn from(level: VerifyLevelArg) -> Self {
        match level {
            VerifyLevelArg::Fast => VerifyLevel::Fast,
            VerifyLevelArg::Full => VerifyLevel::Full,
        }
    }
}

#[derive(Serialize)]
struct DetectReport {
    database: PathBuf,
    version: StoreVersion,
    kernel: StoreVersion,
    status: &'static str,
    files: Vec<FileVersion>,
}

#[derive(Serialize)]
struct FileVersion {
    file: StoreFile,
    version: StoreVersion,
}

#[derive(Serialize)]
struct CheckReport {
    database: PathBuf,
    clean: bool,
    checkpoint: Option<Lsn>,
    reason: Option<String>,
}

#[derive(Serialize)]
struct InitReport {
    database: PathBuf,
    version: StoreVersion,
    nodes: u64,
    clean: bool,
}

#[derive(Serialize)]
struct RefusedReport {
    database: PathBuf,
    refused: bool,
    reason: String,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(err) => {
            eprintln!("error: {}", error_chain(err.as_ref()));
            std::process::exit(1);
        }
    }
}

/// Returns `Ok(false)` when the command ran but the store failed the check.
fn run() -> Result<bool, Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Detect { db_path } => {
            let report = detect(&db_path)?;
            emit(&cli.format, &report, || print_detect_text(&report))?;
        }
        Command::Check { db_path } => {
            let report = check(&db_path)?;
            emit(&cli.format, &report, || print_check_text(&report))?;
            return Ok(report.clean);
        }
        Command::Migrate {
            db_path,
            allow_upgrade,
            config,
        } => {
            let mut config = KernelConfig::load(config.as_deref())?;
            config.allow_upgrade |= allow_upgrade;
            let scheduler = Arc::new(JobScheduler::new(config.scheduler_options()));
            let mut upgrader = StoreUpgrader::new(
                DatabaseLayout::new(&db_path),
                config.upgrade_options(),
                Arc::clone(&scheduler),
            );
            let result = upgrader.migrate_if_needed();
            scheduler.shutdown();
            match result {
                Ok(report) => emit(&cli.format, &report, || print_migrate_text(&report))?,
                Err(err) => match err.unable_to_upgrade() {
                    Some(blocked) => {
                        let report = RefusedReport {
                            database: db_path,
                            refused: true,
                            reason: blocked.reason().to_owned(),
                        };
                        emit(&cli.format, &report, || {
                            println!("Upgrade refused: {}", report.reason)
                        })?;
                        return Ok(false);
                    }
                    None => return Err(err.into()),
                },
            }
        }
        Command::Verify { db_path, level } => {
            let report = verify(&DatabaseLayout::new(&db_path), level.into())?;
            emit(&cli.format, &report, || print_verify_text(&report))?;
            return Ok(report.success);
        }
        Command::Init {
            db_path,
            generation,
            nodes,
            unclean,
        } => {
            let report = init(&db_path, generation, nodes, unclean)?;
            emit(&cli.format, &report, || {
                println!(
                    "Wrote {} sample nodes in format {} to {} ({})",
                    report.nodes,
                    report.version,
                    report.database.display(),
                    if report.clean { "clean" } else { "unclean" }
                )
            })?;
        }
    }
    Ok(true)
}

fn detect(db_path: &Path) -> Result<DetectReport, Box<dyn Error>> {
    let layout = DatabaseLayout::new(db_path);
    let oracle = VersionOracle::new();
    let version = oracle.detect(&layout)?;
    let status = match oracle.compare(&version) {
        VersionCheck::Current => "current",
        VersionCheck::Upgradable => "upgradable",
        VersionCheck::Unsupported => "unsupported",
    };
    let files = oracle
        .detect_all(&layout)?
        .into_iter()
        .map(|(file, version)| FileVersion { file, version })
        .collect();
    Ok(DetectReport {
        database: db_path.to_path_buf(),
        version,
        kernel: oracle.current().clone(),
        status,
        files,
    })
}

fn check(db_path: &Path) -> Result<CheckReport, Box<dyn Error>> {
    let decision = PreconditionGate.check(&DatabaseLayout::new(db_path))?;
    let (checkpoint, reason) = match decision {
        GateDecision::Allow { checkpoint } => (Some(checkpoint), None),
        GateDecision::Block(reason) => (None, Some(reason.to_string())),
    };
    Ok(CheckReport {
        database: db_path.to_path_buf(),
        clean: reason.is_none(),
        checkpoint,
        reason,
    })
}

fn init(
    db_path: &Path,
    generation: u16,
    nodes: u64,
    unclean: bool,
) -> Result<InitReport, Box<dyn Error>> {
    let layout = DatabaseLayout::new(db_path);
    if layout.has_store() {
        return Err(format!("{} already holds a store", db_path.display()).into());
    }
    let version = StoreVersion::new(generation);
    write_store(&layout, &version, &GraphData::sample(nodes))?;
    let log = TxLog::open(layout.txlog_dir())?;
    log.checkpoint()?;
    if unclean {
        log.append_transaction(b"init")?;
    }
    Ok(InitReport {
        database: db_path.to_path_buf(),
        version,
        nodes,
        clean: !unclean,
    })
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_detect_text(report: &DetectReport) {
    println!(
        "{}: {} ({}, kernel is {})",
        report.database.display(),
        report.version,
        report.status,
        report.kernel
    );
    for entry in &report.files {
        println!("  {:<12} {}", entry.file.to_string(), entry.version);
    }
}

fn print_check_text(report: &CheckReport) {
    match (&report.checkpoint, &report.reason) {
        (Some(lsn), _) => println!("Clean shutdown, last checkpoint at LSN {}", lsn.0),
        (None, Some(reason)) => println!("Not clean: {reason}"),
        (None, None) => println!("Not clean"),
    }
}

fn print_migrate_text(report: &UpgradeReport) {
    println!(
        "{:?}: {} -> {} in {} ms",
        report.outcome, report.from, report.to, report.duration_ms
    );
    if report.resumed_commit {
        println!("  resumed an interrupted commit");
    }
    if report.discarded_staging {
        println!("  discarded leftover staging");
    }
    if !report.participants_run.is_empty() {
        println!("  migrated: {}", report.participants_run.join(", "));
    }
    if !report.participants_skipped.is_empty() {
        println!("  unchanged: {}", report.participants_skipped.join(", "));
    }
}

fn print_verify_text(report: &VerifyReport) {
    let version = report
        .version
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "mixed".to_owned());
    println!(
        "Verify ({:?}) => success={} version={} files={} nodes={} edges={} props={} label_postings={}",
        report.level,
        report.success,
        version,
        report.counts.store_files,
        report.counts.nodes_in_use,
        report.counts.edges_in_use,
        report.counts.props_in_use,
        report.counts.label_postings,
    );
    for finding in &report.findings {
        println!("- {:?}: {}", finding.severity, finding.message);
    }
}
