//! Drive sync daemon entry point and control CLI.
//!
//! `pdsync run` starts the daemon; the other subcommands are sibling
//! processes that talk to a running daemon through the shared state store
//! (signals and flags), never over a private IPC channel.

mod commands;
mod runtime;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "pdsync")]
#[command(about = "Mirror local directories into an encrypted remote drive")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sync daemon in the foreground.
    Run {
        /// Perform no durable writes and no remote mutations.
        #[arg(long)]
        dry_run: bool,
        /// Query each watch root once, drain the queue, and exit.
        #[arg(long)]
        once: bool,
    },
    /// Pause syncing in the running daemon.
    Pause,
    /// Resume syncing in the running daemon.
    Resume,
    /// Stop the running daemon gracefully.
    Stop,
    /// Print job counts and daemon state.
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run { dry_run, once } => runtime::run(dry_run, once).await,
        Command::Pause => commands::pause().await,
        Command::Resume => commands::resume().await,
        Command::Stop => commands::stop().await,
        Command::Status => commands::status().await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // Fatal errors exit non-zero so the service manager surfaces
            // them instead of silently restarting forever.
            error!(error = %err, "exiting with failure");
            ExitCode::FAILURE
        }
    }
}
