//! `donorledger` command-line front end.
//!
//! # Responsibility
//! - Feed payment records from files into the core engine.
//! - Print one JSON document per invocation on stdout.
//!
//! Exit codes: 0 success, 1 some records failed or the delivery was
//! rejected, 2 usage/config/storage error.

use clap::{Parser, Subcommand};
use donorledger_core::{
    default_log_level, init_logging, open_db, BulkImporter, DonorMergeService, EngineConfig,
    ImportResult, PaymentImporter, PushHandler, PushOutcome,
};
use log::info;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use uuid::Uuid;

const EXIT_RECORD_FAILURES: u8 = 1;
const EXIT_SETUP_ERROR: u8 = 2;

#[derive(Parser)]
#[command(name = "donorledger")]
#[command(about = "Reconcile payment processor records into the donation ledger")]
#[command(version)]
struct Cli {
    /// SQLite ledger database (created when missing)
    #[arg(long, global = true, env = "DONORLEDGER_DB", default_value = "donorledger.sqlite3")]
    db: PathBuf,

    /// TOML engine configuration
    #[arg(long, global = true, env = "DONORLEDGER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a payments CSV export, one record per row
    ImportCsv {
        /// CSV file with a header row
        file: PathBuf,
    },
    /// Process one signed push event read from a file
    Push {
        /// Raw JSON event body, exactly as delivered
        payload: PathBuf,
        /// Signature header value (`t=...,v1=...`)
        #[arg(long)]
        signature: String,
    },
    /// Merge a duplicate donor into a surviving donor
    MergeDonor {
        duplicate: Uuid,
        survivor: Uuid,
    },
}

struct CliError {
    code: u8,
    message: String,
}

impl CliError {
    fn setup(message: impl Into<String>) -> Self {
        Self {
            code: EXIT_SETUP_ERROR,
            message: message.into(),
        }
    }

    fn rejected(message: impl Into<String>) -> Self {
        Self {
            code: EXIT_RECORD_FAILURES,
            message: message.into(),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {}", err.message);
            ExitCode::from(err.code)
        }
    }
}

fn run(cli: Cli) -> Result<u8, CliError> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path).map_err(|err| CliError::setup(err.to_string()))?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = config.logging.dir.as_deref() {
        let level = config
            .logging
            .level
            .as_deref()
            .unwrap_or_else(|| default_log_level());
        init_logging(level, dir).map_err(CliError::setup)?;
    }
    let conn = open_db(&cli.db).map_err(|err| CliError::setup(err.to_string()))?;
    info!(
        "event=cli_start module=cli status=ok command={}",
        command_name(&cli.command)
    );

    match cli.command {
        Commands::ImportCsv { file } => {
            let importer = PaymentImporter::new(&conn, &config.import);
            let summary = BulkImporter::new(&importer, &config.bulk)
                .import_path(&file)
                .map_err(|err| CliError::setup(err.to_string()))?;
            print_json(&summary)?;
            Ok(if summary.failed > 0 {
                EXIT_RECORD_FAILURES
            } else {
                0
            })
        }
        Commands::Push { payload, signature } => {
            let body = read_payload(&payload)?;
            let importer = PaymentImporter::new(&conn, &config.import);
            let handler = PushHandler::new(
                &conn,
                &importer,
                config.push.signing_secret.as_deref(),
                config.push.tolerance_secs,
            );
            let outcome = handler
                .handle(&body, Some(&signature))
                .map_err(|err| CliError::rejected(err.to_string()))?;
            print_json(&outcome)?;
            Ok(match outcome {
                PushOutcome::Import {
                    result: ImportResult::Failed { .. },
                    ..
                } => EXIT_RECORD_FAILURES,
                _ => 0,
            })
        }
        Commands::MergeDonor {
            duplicate,
            survivor,
        } => {
            let outcome = DonorMergeService::new(&conn, config.import.merge_chain_max_hops)
                .merge(duplicate, survivor)
                .map_err(|err| CliError::rejected(err.to_string()))?;
            print_json(&outcome)?;
            Ok(0)
        }
    }
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::ImportCsv { .. } => "import-csv",
        Commands::Push { .. } => "push",
        Commands::MergeDonor { .. } => "merge-donor",
    }
}

fn read_payload(path: &Path) -> Result<Vec<u8>, CliError> {
    std::fs::read(path).map_err(|err| CliError::setup(format!("{}: {err}", path.display())))
}

fn print_json(value: &impl Serialize) -> Result<(), CliError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| CliError::setup(format!("failed to encode output: {err}")))?;
    println!("{text}");
    Ok(())
}
