//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "btsink")]
#[command(about = "Turn this machine into a Bluetooth audio receiver", long_about = None)]
pub struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Name advertised to other devices
    #[arg(short, long)]
    pub name: Option<String>,

    /// Adapter to use (e.g. hci0); the default adapter when omitted
    #[arg(short, long)]
    pub adapter: Option<String>,

    /// Where known devices are stored
    #[arg(long)]
    pub state_file: Option<PathBuf>,

    /// Seconds to wait for a pairing decision
    #[arg(long)]
    pub pairing_timeout: Option<u64>,

    /// Accept every pairing request without asking
    #[arg(long)]
    pub auto_accept: bool,

    /// Read operator commands from stdin
    #[arg(long)]
    pub console: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Write logs to this file instead of stderr
    #[arg(short, long)]
    pub log_file: Option<PathBuf>,
}
