use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tsidd", version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to /etc/tsidd.toml when present)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Coordination store endpoint, e.g. redis://127.0.0.1:6379 or memory://
    #[arg(long, value_name = "URL")]
    pub store: Option<String>,

    /// Use a random, unverified node id if the coordination store is down.
    /// Local development only
    #[arg(long)]
    pub allow_degraded: bool,

    /// Verbose mode (-v, -vv, -vvv)
    #[arg(short, action = ArgAction::Count)]
    pub verbosity: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Acquires a node id, keeps its lease alive and serves /health
    Run {
        /// Address for the health endpoint
        #[arg(long, value_name = "ADDR")]
        listen: Option<SocketAddr>,
    },
    /// Prints freshly generated TSIDs. Only with memory:// or no store
    /// (--allow-degraded), so no shared slot is left leased behind
    Generate {
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
        /// Print raw 64-bit integers instead of the 13-character form
        #[arg(long)]
        numeric: bool,
    },
    /// Lists which node slots are currently leased
    #[command(alias = "ls")]
    Slots,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from([
            "tsidd",
            "--store",
            "memory://",
            "-vv",
            "run",
            "--listen",
            "0.0.0.0:9000",
        ]);
        assert_eq!(cli.store.as_deref(), Some("memory://"));
        assert_eq!(cli.verbosity, 2);
        assert!(!cli.allow_degraded);
        match cli.command {
            Commands::Run { listen } => assert_eq!(listen, Some("0.0.0.0:9000".parse().unwrap())),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_generate_and_alias() {
        let cli = Cli::parse_from(["tsidd", "--allow-degraded", "generate", "-n", "5"]);
        assert!(cli.allow_degraded);
        assert!(matches!(cli.command, Commands::Generate { count: 5, numeric: false }));

        let cli = Cli::parse_from(["tsidd", "ls"]);
        assert!(matches!(cli.command, Commands::Slots));
    }
}
