use std::path::PathBuf;

use clap::Parser;

/// Measures the electrical power a mobile device draws under a prescribed
/// workload and time-aligns the current trace with the device's log events.
#[derive(Parser, Debug, Clone)]
#[command(name = "volta", author, version, about)]
pub struct Args {
    /// Path to the YAML test config.
    #[arg(short = 'c', long, value_name = "PATH")]
    pub config: PathBuf,

    /// Runtime log file; relocated into the artifacts directory at shutdown.
    #[arg(short = 'l', long, default_value = "volta.log", value_name = "FILE")]
    pub log: PathBuf,

    /// Debug-level output.
    #[arg(short = 'd', long = "debug", short_alias = 'v', alias = "verbose")]
    pub verbose: bool,

    /// Warnings and errors only.
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Trace-level output for deep diagnostics.
    #[arg(short = 't', long)]
    pub trace: bool,

    /// Patch the config with a YAML snippet (repeatable, merged in order
    /// over the file config).
    #[arg(short = 'p', long = "patch-cfg", value_name = "YAML", action = clap::ArgAction::Append, allow_hyphen_values = true)]
    pub patches: Vec<String>,

    /// Optional defaults file merged under the config.
    #[arg(long, value_name = "PATH")]
    pub defaults: Option<PathBuf>,
}

pub fn parse_args() -> Args {
    Args::parse()
}
