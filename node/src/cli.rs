//! # CLI Interface
//!
//! Command-line argument structure for `spkeasy-node` using `clap`
//! derive. Two subcommands: `run` and `version`.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Speakeasy control-plane node.
///
/// Hosts the services behind end-to-end encrypted posts and profiles:
/// the trust graph, the user keystore, and the two encrypted session
/// stores, plus the queue workers that keep them consistent.
#[derive(Parser, Debug)]
#[command(
    name = "spkeasy-node",
    about = "Speakeasy private-content control plane",
    version,
    propagate_version = true
)]
pub struct SpkeasyCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Print version information and exit.
    Version,
}

/// Which logical services this node hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HostedServices {
    /// All four services in one process, wired in-memory. The default,
    /// and the only mode in which the embedded queue is shared.
    All,
    /// Trust-graph service only.
    TrustedUsers,
    /// Keystore service only.
    UserKeys,
    /// Private post sessions only.
    PrivateSessions,
    /// Private profile sessions only.
    PrivateProfiles,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Which services to host in this process.
    #[arg(long, value_enum, env = "SPKEASY_SERVICE", default_value = "all")]
    pub service: HostedServices,

    /// Address for the XRPC API listener.
    #[arg(long, env = "SPKEASY_LISTEN", default_value = "127.0.0.1:8585")]
    pub listen: String,

    /// Data directory; each hosted service opens its schema beneath it.
    ///
    /// Overrides `SPKEASY_DATA_DIR` when given.
    #[arg(long, short = 'd')]
    pub data_dir: Option<PathBuf>,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, env = "SPKEASY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format: "pretty" or "json".
    #[arg(long, env = "SPKEASY_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// Dev mode: temporary in-memory schemas, generated secrets, no
    /// environment required. Never use for real data.
    #[arg(long)]
    pub dev: bool,
}
