mod commands;
mod config;
mod progress;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commands::{
    import::ImportCommand, link::LinkCommand, list::ListCommand, remove_dirs::RemoveDirsCommand,
    verify::VerifyCommand,
};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "debpool",
    version,
    about = "Content-addressed Debian package pool",
    long_about = "debpool keeps every package file once in a checksum-addressed pool and \
                  publishes it into repository trees on local disks, S3, Azure Blob Storage, \
                  OpenStack Swift or SFTP servers"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, env = "DEBPOOL_CONFIG", help = "Configuration file")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Import package files into the pool")]
    Import(ImportCommand),

    #[command(about = "Check whether package files are present in the pool")]
    Verify(VerifyCommand),

    #[command(about = "Publish pooled package files into a storage")]
    Link(LinkCommand),

    #[command(about = "List files of a published storage or the pool")]
    List(ListCommand),

    #[command(about = "Delete a directory tree from a published storage")]
    RemoveDirs(RemoveDirsCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet)?;

    let config = config::Config::load(cli.config.as_deref())?;
    debug!(pool = %config.pool.root.display(), "Loaded configuration");

    match &cli.command {
        Commands::Import(cmd) => cmd.run(&cli, &config).await,
        Commands::Verify(cmd) => cmd.run(&cli, &config).await,
        Commands::Link(cmd) => cmd.run(&cli, &config).await,
        Commands::List(cmd) => cmd.run(&cli, &config).await,
        Commands::RemoveDirs(cmd) => cmd.run(&cli, &config).await,
    }
}

fn init_tracing(verbose: bool, quiet: bool) -> Result<()> {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "debpool={level},debpool_core={level},debpool_backends={level}"
        ))
    });
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Setting default subscriber failed")
}
