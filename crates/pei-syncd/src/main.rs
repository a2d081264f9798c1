mod cli;
mod commands;
mod config;
mod probe;
mod remote;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use commands::Daemon;
use config::{expand_path, load_syncd_config, Config};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.clone().unwrap_or(Commands::Run);

    if let Commands::ConfigSchema = command {
        println!("{}", Config::generate_schema()?);
        return Ok(());
    }

    let config_path = cli.config.as_deref().map(expand_path).transpose()?;
    let config = load_syncd_config(config_path.as_deref())?;
    init_logging(&config.logging.filter, cli.verbose);

    let daemon = Daemon::open(config)?;
    match command {
        Commands::Run => daemon.run().await?,
        Commands::Sync => daemon.sync_once(cli.json).await?,
        Commands::Status => daemon.status(cli.json).await?,
        Commands::DeadLetters => daemon.dead_letters(cli.json)?,
        Commands::Retry { entry_id } => daemon.retry(&entry_id)?,
        Commands::Discard { entry_id } => daemon.discard(&entry_id)?,
        Commands::ClearQueue { yes } => daemon.clear_queue(yes)?,
        Commands::Sweep => daemon.sweep(cli.json)?,
        Commands::ConfigSchema => {}
    }
    Ok(())
}

/// Logs go to stderr; stdout is reserved for command output
fn init_logging(default_filter: &str, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}
