//! CLI argument definitions for relay-stress.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// Relay publisher pipeline stress harness.
///
/// Runs a configurable number of event generators against the configured
/// output and reports published/acknowledged totals on exit.
#[derive(Parser, Debug)]
#[command(name = "relay-stress")]
#[command(version, about, long_about = None)]
pub struct StressCli {
    /// Path to the stress configuration file (relay.toml plus a `[generate]` section).
    #[arg(short, long, default_value = "relay-stress.toml")]
    pub config: PathBuf,

    /// Stop the generators after this many seconds.
    ///
    /// Without it the run ends when every generator reaches `max_events`
    /// or on Ctrl-C.
    #[arg(long)]
    pub duration_secs: Option<u64>,

    /// Override log level (trace, debug, info, warn, error).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_format: Option<String>,

    /// Validate configuration file and exit without running.
    #[arg(long)]
    pub validate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = StressCli::parse_from(["relay-stress"]);
        assert_eq!(cli.config, PathBuf::from("relay-stress.toml"));
        assert!(cli.duration_secs.is_none());
        assert!(!cli.validate);
    }

    #[test]
    fn overrides() {
        let cli = StressCli::parse_from([
            "relay-stress",
            "--config",
            "/tmp/s.toml",
            "--duration-secs",
            "30",
            "--log-level",
            "debug",
            "--log-format",
            "pretty",
            "--validate",
        ]);
        assert_eq!(cli.config, PathBuf::from("/tmp/s.toml"));
        assert_eq!(cli.duration_secs, Some(30));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.log_format.as_deref(), Some("pretty"));
        assert!(cli.validate);
    }
}
