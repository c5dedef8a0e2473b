//! Wager operator CLI
//!
//! Inspects and adjusts the file-backed stores. Live game sessions belong to
//! the chat front end that embeds `Casino`, so none are hosted here.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use wager::{
    config::generate_sample_config, Casino, ConfigLoader, UserId, WagerConfig, WagerResult,
};

/// Wager CLI
#[derive(Parser)]
#[command(name = "wager")]
#[command(about = "Game sessions and point ledger for chat communities")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Override the data directory
    #[arg(short, long)]
    data_dir: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a sample configuration file
    InitConfig {
        #[arg(default_value = "wager.toml")]
        path: PathBuf,
    },

    /// Show a user's balance
    Balance { user: u64 },

    /// Add (or with a negative delta, remove) points
    Adjust {
        user: u64,
        #[arg(allow_hyphen_values = true)]
        delta: i64,
    },

    /// Credit one activity reward
    Reward { user: u64 },

    /// List open prediction events
    Predictions,
}

fn main() -> WagerResult<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig { path } = &cli.command {
        generate_sample_config(path)?;
        println!("Wrote sample configuration to {}", path.display());
        return Ok(());
    }

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_path(path);
    }
    if let Some(dir) = cli.data_dir {
        loader = loader.with_data_dir(dir);
    }
    let config = loader.load()?;

    init_tracing(&config, cli.verbose);

    match cli.command {
        Commands::InitConfig { .. } => Ok(()),
        Commands::Balance { user } => {
            let casino = Casino::open(config)?;
            println!("{}", casino.balance(UserId(user)));
            Ok(())
        }
        Commands::Adjust { user, delta } => {
            let casino = Casino::open(config)?;
            let receipt = casino.ledger().adjust(UserId(user), delta)?;
            println!("{} -> {}", receipt.previous, receipt.balance);
            Ok(())
        }
        Commands::Reward { user } => {
            let casino = Casino::open(config)?;
            let receipt = casino.reward_activity(UserId(user))?;
            println!("{}", receipt.balance);
            Ok(())
        }
        Commands::Predictions => list_predictions(config),
    }
}

fn init_tracing(config: &WagerConfig, verbose: bool) {
    let fallback = if verbose { "debug" } else { config.logging.level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .init();
}

fn list_predictions(config: WagerConfig) -> WagerResult<()> {
    let casino = Casino::open(config)?;
    let events = casino.open_predictions();
    if events.is_empty() {
        println!("No open prediction events");
    }
    for event in events {
        println!(
            "[{}] {} (host {}, min bet {}, {} yes / {} no, pool {})",
            event.handle,
            event.proposition,
            event.host,
            event.min_bet,
            event.yes_votes,
            event.no_votes,
            event.pool
        );
    }
    Ok(())
}
