mod commands;
mod location;
mod settings;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{list::ListCommand, send::SendCommand};
use settings::Settings;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "zferry",
    about = "Replicate ZFS datasets between hosts",
    long_about = "Zferry inspects ZFS dataset trees and replicates snapshots locally or over ssh, \
                  buffering and compressing the stream when the tools are available"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, env = "ZFERRY_CONFIG", help = "Settings file (default: per-user config.toml)")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "List datasets and their properties")]
    List(ListCommand),

    #[command(about = "Send the newest snapshot of a dataset to a destination")]
    Send(SendCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    let settings = Settings::load(cli.config.as_deref())?;
    debug!(?settings, "Starting zferry");

    match cli.command {
        Commands::List(ref cmd) => cmd.run(&settings).await,
        Commands::Send(ref cmd) => cmd.run(&settings).await,
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!(
            "zferry={level},zferry_core={level},zferry_endpoints={level}"
        )))
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Setting default subscriber failed");
}
