//! RingLink CLI entry point

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::error;

use ringlink_cli::{
    cli::Cli, commands::CommandDispatcher, config::AppConfig, config::RadioBackend,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Load configuration
    let config_path = match &cli.config {
        Some(path) => PathBuf::from(path),
        None => AppConfig::default_config_path()?,
    };
    let mut config = AppConfig::load(cli.config.as_deref().map(std::path::Path::new))
        .with_context(|| format!("loading {}", config_path.display()))?;

    // Initialize logging
    setup_logging(cli.verbose || config.cli.verbose);

    // Command line overrides
    if let Some(data_dir) = &cli.data_dir {
        config.cli.data_dir = Some(data_dir.into());
    }
    if cli.ble {
        config.cli.backend = RadioBackend::Ble;
    }

    if let Err(e) = CommandDispatcher::execute(cli.command, config, config_path).await {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
