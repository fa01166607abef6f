//! afk CLI entry point.
//!
//! Thin composition layer: parse arguments, build the application
//! configuration, run startup initialization (logging, data directory,
//! reconcile pass), dispatch the requested command, and translate any
//! error that escapes into an exit code.

use clap::Parser;
use tracing::error;

use afk::app::{handle_fatal_error, initialize_app, AppConfig};
use afk::cli::{execute_command, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let app_config = match AppConfig::new(cli.verbose) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to initialize application configuration: {e}");
            std::process::exit(2);
        }
    };

    if let Err(e) = initialize_app(&app_config).await {
        error!("application initialization failed: {e}");
    }

    if let Err(e) = execute_command(cli.command, &app_config).await {
        handle_fatal_error(e, cli.verbose);
    }
}
