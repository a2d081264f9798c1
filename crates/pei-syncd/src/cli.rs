use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pei-syncd", about = "Offline-first sync daemon for PEI records")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to the sync configuration file (defaults to ~/.config/pei/sync.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// Run the sync loop until interrupted (default)
    Run,

    /// Run one reconciliation cycle now
    Sync,

    /// Show connectivity, pending changes and dead letters
    Status,

    /// List queue entries that need manual attention
    #[command(name = "dead-letters")]
    DeadLetters,

    /// Put a dead-lettered entry back in the queue
    Retry {
        /// Queue entry id
        entry_id: String,
    },

    /// Abandon a queued change
    Discard {
        /// Queue entry id
        entry_id: String,
    },

    /// Drop every queued change
    #[command(name = "clear-queue")]
    ClearQueue {
        /// Confirm that unsent local changes may be lost
        #[arg(long)]
        yes: bool,
    },

    /// Remove synced records older than the retention window
    Sweep,

    /// Print the JSON schema of the configuration file
    #[command(name = "config-schema")]
    ConfigSchema,
}
