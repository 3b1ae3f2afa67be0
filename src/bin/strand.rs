//! Strand CLI
//!
//! Runs jobs against the local machine and prints the effective configuration.

use clap::Parser;
use strand_core::cli::{self, Cli};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over the configured level
    let level = cli::load_config(cli.config.clone())
        .map(|config| config.logging.level)
        .unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = cli::run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
