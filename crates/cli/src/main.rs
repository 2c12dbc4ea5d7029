//! gearcache command line entry point.
//!
//! Command output is JSON on stdout. Logging goes to stderr so the two never
//! mix.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use gearcache_core::{AppConfig, Error};
use tracing_subscriber::EnvFilter;

mod args;
mod commands;

use args::{Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e.downcast_ref::<Error>().map_or("ERROR", Error::code);
            println!("{}", serde_json::json!({ "error": code, "message": format!("{e:#}") }));
            ExitCode::FAILURE
        }
    }
}

/// 0 = RUST_LOG or warn, 1 = info, 2+ = debug for the gearcache crates.
fn init_tracing(verbose: u8, json: bool) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("gearcache=info,gearcache_core=info,gearcache_client=info,gearcache_worker=info"),
        _ => EnvFilter::new("gearcache=debug,gearcache_core=debug,gearcache_client=debug,gearcache_worker=debug"),
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load_from(cli.config.as_deref())?;
    tracing::debug!(db = %config.db_path.display(), origin = %config.origin, "configuration loaded");

    match cli.command {
        Commands::Install(args) => commands::install(args, &config).await,
        Commands::Activate => commands::activate(&config).await,
        Commands::Fetch(args) => commands::fetch(args, &config).await,
        Commands::Status => commands::status(&config).await,
        Commands::Expire => commands::expire(&config).await,
    }
}
