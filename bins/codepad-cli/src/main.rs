mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use codepad_common::config::ServiceConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "codepad-cli")]
#[command(about = "Codepad CLI - Run code locally and inspect installed languages", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a source file through the same engine the API uses
    Run {
        /// Language id or alias (e.g., python, js, cpp)
        #[arg(short, long)]
        language: String,

        /// Source file to execute
        file: PathBuf,

        /// File whose contents are fed to the program's stdin
        #[arg(short, long)]
        stdin: Option<PathBuf>,

        /// Print the API response body instead of raw output
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// List configured languages
    Languages {
        /// Print as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Check that every configured toolchain is installed
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Program output goes to stdout, so engine logs stay quiet unless asked for
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = ServiceConfig::from_env().context("Failed to load configuration")?;

    let code = match cli.command {
        Commands::Run {
            language,
            file,
            stdin,
            json,
        } => commands::run_file(&config, &language, &file, stdin.as_deref(), json).await?,
        Commands::Languages { json } => commands::list_languages(&config, json)?,
        Commands::Doctor => commands::doctor(&config)?,
    };

    std::process::exit(code);
}
