//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// BLE visitor log: fingerprints advertising devices and tracks their presence.
#[derive(Debug, Clone, Parser)]
#[command(name = "bluelog", version, about)]
pub struct Cli {
    /// Configuration file (TOML). Defaults to the platform config location.
    #[arg(short, long, env = "BLUELOG_CONFIG")]
    pub config: Option<PathBuf>,

    /// JSON logs to rolling files plus plain stdout for journald
    #[arg(long, env = "BLUELOG_PRODUCTION")]
    pub production: bool,

    /// Read sightings as JSON lines from FILE ("-" for stdin) instead of scanning
    #[arg(long, value_name = "FILE")]
    pub replay: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    pub print_config: bool,
}

impl Cli {
    /// Where sightings come from for this run.
    #[must_use]
    pub fn source(&self) -> SourceKind {
        match &self.replay {
            Some(path) if path.as_os_str() == "-" => SourceKind::Stdin,
            Some(path) => SourceKind::File(path.clone()),
            None => SourceKind::Scanner,
        }
    }
}

/// Origin of the sighting stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Live BlueZ discovery on the configured adapter.
    Scanner,
    /// Replay from a JSON-lines file.
    File(PathBuf),
    /// Replay from standard input.
    Stdin,
}
