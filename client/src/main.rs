use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use roomchat_client::config::ClientConfig;
use roomchat_client::error::HistoryError;
use roomchat_client::history::HistorySource;

#[derive(Parser)]
#[command(name = "roomchat", about = "Realtime chat room client")]
struct Cli {
    /// Path to the client config file.
    #[arg(long, default_value = "roomchat.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a room's message history.
    History {
        /// Room name.
        room: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match ClientConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = ?e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::History { room } => {
            let loader = config.history_loader();
            match loader.load_history(&room).await {
                Ok(messages) => {
                    for msg in messages {
                        println!("[{}] {}: {}", msg.sent_at.to_rfc3339(), msg.author, msg.body);
                    }
                    ExitCode::SUCCESS
                }
                Err(HistoryError::Unauthorized) => {
                    eprintln!("not allowed to view room {room}");
                    ExitCode::from(3)
                }
                Err(e) => {
                    eprintln!("could not load history for {room}: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
