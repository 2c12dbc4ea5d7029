//! CLI argument definitions using clap derive

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use gearcache_core::Destination;

/// gearcache - offline caching layer for the equipment tracker
///
/// Installs precache generations and runs requests through the same
/// interception path the application uses.
#[derive(Parser, Debug)]
#[command(name = "gearcache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "GEARCACHE_CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub json_logs: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install a precache manifest as a new generation
    Install(InstallArgs),

    /// Activate the waiting generation
    Activate,

    /// Run one request through the cache
    Fetch(FetchArgs),

    /// Show generations and compartment sizes
    Status,

    /// Run an expiration pass over all runtime compartments
    Expire,
}

/// Arguments for the install command
#[derive(Parser, Debug)]
pub struct InstallArgs {
    /// Manifest JSON (defaults to the configured manifest_path)
    #[arg(short, long)]
    pub manifest: Option<PathBuf>,

    /// Activate immediately instead of waiting
    #[arg(long)]
    pub activate: bool,
}

/// Arguments for the fetch command
#[derive(Parser, Debug)]
pub struct FetchArgs {
    /// Path or URL, resolved against the configured origin
    pub url: String,

    /// Destination class of the request
    #[arg(short, long, value_enum, default_value_t = DestinationArg::Other)]
    pub destination: DestinationArg,

    /// Treat the request as a page navigation
    #[arg(long)]
    pub navigate: bool,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    pub method: String,
}

/// Request destination classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DestinationArg {
    Document,
    Image,
    Font,
    Script,
    Style,
    Other,
}

impl From<DestinationArg> for Destination {
    fn from(arg: DestinationArg) -> Self {
        match arg {
            DestinationArg::Document => Destination::Document,
            DestinationArg::Image => Destination::Image,
            DestinationArg::Font => Destination::Font,
            DestinationArg::Script => Destination::Script,
            DestinationArg::Style => Destination::Style,
            DestinationArg::Other => Destination::Other,
        }
    }
}
