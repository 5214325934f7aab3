//! Weft REST API entry point.
//!
//! Binary name: `weft`. Parses CLI arguments, wires the engine, and serves
//! the API.

mod http;
mod state;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use http::router::build_router;
use state::AppState;

#[derive(Parser)]
#[command(name = "weft", about = "Workflow orchestration engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST API server.
    Serve {
        /// Address to bind.
        #[arg(long, default_value = "127.0.0.1:8420", env = "WEFT_BIND")]
        bind: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,tower_http=warn",
        1 => "info,weft=debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve { bind } => {
            let state = AppState::init();
            let router = build_router(state);
            let listener = tokio::net::TcpListener::bind(&bind).await?;
            tracing::info!(bind = bind.as_str(), "weft listening");
            axum::serve(listener, router).await?;
        }
    }

    Ok(())
}
