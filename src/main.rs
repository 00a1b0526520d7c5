//! # skillforge CLI
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `skillforge validate -c <file>` | Validate a configuration and report every violation |
//! | `skillforge run -c <file>` | Run the indexer declared by a configuration |
//! | `skillforge skills` | List registered skills |
//!
//! ## Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | success |
//! | 1 | one or more items failed, or the run was cancelled |
//! | 2 | fatal runtime error |
//! | 3 | invalid configuration |
//!
//! ## Examples
//!
//! ```bash
//! skillforge validate -c config/indexer.yaml
//! skillforge run -c config/indexer.yaml --progress json
//! RUST_LOG=skillforge=debug skillforge run -c config/indexer.yaml --json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};

use skillforge::config;
use skillforge::engine::RunControl;
use skillforge::error::{exit_codes, IndexerError};
use skillforge::indexer::{Indexer, IndexerReport};
use skillforge::progress::ProgressMode;
use skillforge::registry::SkillRegistry;

#[derive(Parser)]
#[command(
    name = "skillforge",
    about = "Run declarative skillsets that index documents into vector stores",
    version
)]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug). `RUST_LOG` takes precedence.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file without running anything.
    Validate {
        /// Path to the configuration (YAML, or TOML by extension).
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Run every skillset of the configured indexer.
    Run {
        #[arg(short, long)]
        config: PathBuf,

        /// Progress on stderr. Defaults to `human` on a terminal, else `off`.
        #[arg(long, value_parser = ["human", "json", "off"])]
        progress: Option<String>,

        /// Print the final report as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// List the registered skills.
    Skills,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<IndexerError>()
        .map(IndexerError::exit_code)
        .unwrap_or(exit_codes::FATAL)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match dispatch(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

async fn dispatch(command: Commands) -> anyhow::Result<i32> {
    match command {
        Commands::Validate { config } => {
            let cfg = config::load_config(&config)?;
            println!(
                "configuration is valid: {} definition(s), {} skillset(s), indexer '{}'",
                cfg.definitions.len(),
                cfg.skillsets.len(),
                cfg.indexer.id
            );
            Ok(exit_codes::SUCCESS)
        }
        Commands::Skills => {
            for key in SkillRegistry::with_builtins().keys() {
                println!("{}", key);
            }
            Ok(exit_codes::SUCCESS)
        }
        Commands::Run {
            config,
            progress,
            json,
        } => {
            let cfg = config::load_config(&config)?;
            let mode = progress
                .as_deref()
                .and_then(ProgressMode::parse)
                .unwrap_or_else(ProgressMode::default_for_tty);

            let control = RunControl::new();
            let on_interrupt = control.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, cancelling run");
                    on_interrupt.cancel();
                }
            });

            let indexer = Indexer::new(Arc::new(SkillRegistry::with_builtins()))
                .with_progress(mode.reporter());
            let report = match indexer.run(&cfg, &control).await {
                Ok(report) => report,
                Err(e) => {
                    let partial = IndexerReport::from_aborted(&cfg.indexer.id, &e);
                    if !partial.runs.is_empty() {
                        emit_report(&partial, json)?;
                    }
                    return Err(e.into());
                }
            };
            emit_report(&report, json)?;

            Ok(if report.succeeded() {
                exit_codes::SUCCESS
            } else {
                exit_codes::ITEM_FAILURES
            })
        }
    }
}

fn emit_report(report: &IndexerReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print_summary(report);
    }
    Ok(())
}

fn print_summary(report: &IndexerReport) {
    for run in &report.runs {
        println!(
            "{}: {} processed, {} skipped, {} failed, {} records written{}",
            run.skillset,
            run.processed,
            run.skipped,
            run.failed,
            run.records_written,
            if run.cancelled { " (cancelled)" } else { "" }
        );
        for f in &run.failures {
            println!(
                "  stage {} {} {}: {} after {} attempt(s)",
                f.stage, f.skill, f.item_id, f.message, f.attempts
            );
        }
    }
    if !report.stale_documents.is_empty() {
        println!(
            "{} stale document(s), {} chunk id(s) purged",
            report.stale_documents.len(),
            report.purged_chunk_ids.len()
        );
    }
}
