//! CLI binary entry point for maltopuft-load

use anyhow::Context;
use clap::{Parser, Subcommand};
use maltopuft_loader::cli::commands::init::{InitArgs, handle_init};
use maltopuft_loader::cli::commands::load::{LoadArgs, handle_load, parse_batch_arg};
use maltopuft_loader::cli::commands::targets::handle_targets;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "maltopuft-load")]
#[command(about = "Reconciling bulk loader for MALTOPUFT")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a sample .maltopuft.toml
    Init {
        /// Working directory
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },
    /// Print a load plan as TOML
    Targets {
        /// Built-in plan (meertrap, atnf) or plan file
        #[arg(short, long, default_value = "meertrap")]
        plan: String,
    },
    /// Load JSON record batches and print the load report
    Load {
        /// Built-in plan (meertrap, atnf) or plan file
        #[arg(short, long, default_value = "meertrap")]
        plan: String,
        /// Batch for one stage, as STAGE=FILE
        #[arg(short, long = "batch", value_parser = parse_batch_arg, required = true)]
        batches: Vec<(String, PathBuf)>,
        /// Load strategy (bulk or grouped), overriding the config file
        #[arg(short, long)]
        strategy: Option<String>,
        /// Column that splits the first stage into groups
        #[arg(long)]
        group_column: Option<String>,
        /// Working directory holding .maltopuft.toml
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { dir, force } => {
            let path = handle_init(&InitArgs { dir, force }).context("init failed")?;
            println!("Wrote {}", path.display());
        }
        Commands::Targets { plan } => {
            let text =
                handle_targets(&plan).with_context(|| format!("cannot show plan '{}'", plan))?;
            print!("{}", text);
        }
        Commands::Load {
            plan,
            batches,
            strategy,
            group_column,
            dir,
        } => {
            let args = LoadArgs {
                plan,
                batches,
                strategy,
                group_column,
                dir,
            };
            let report = handle_load(&args).context("load failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
