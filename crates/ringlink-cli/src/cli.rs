//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Data directory for the persisted device record
    #[arg(short, long)]
    pub data_dir: Option<String>,

    /// Use the host Bluetooth adapter instead of the simulated radio
    #[arg(long)]
    pub ble: bool,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Scan for nearby rings
    Scan {
        /// Seconds to scan before stopping
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,
    },
    /// Connect to a ring and keep the link alive
    Connect {
        /// Radio address of the ring
        address: String,
        /// Advertised name of the ring
        #[arg(short, long)]
        name: Option<String>,
        /// Stay connected and show status until interrupted
        #[arg(short, long)]
        watch: bool,
    },
    /// Reconnect to the remembered ring and make it vibrate
    Locate,
    /// Reconnect to the remembered ring and send a named command
    Send {
        /// Command name (`locate` or a configured custom command)
        command: String,
        /// Command payload as hex
        #[arg(short, long)]
        payload: Option<String>,
    },
    /// Forget the remembered ring
    Forget,
    /// Show the remembered ring and file locations
    Status,
    /// Run a scripted session against the simulated radio
    Demo,
    /// Print the effective configuration
    Config {
        /// Write it to the configuration file
        #[arg(short, long)]
        write: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect() {
        let cli = Cli::try_parse_from([
            "ringlink",
            "-v",
            "connect",
            "AA:BB:CC:DD:EE:01",
            "--name",
            "Q_Ring_1",
            "--watch",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(!cli.ble);
        assert_eq!(
            cli.command,
            Commands::Connect {
                address: "AA:BB:CC:DD:EE:01".into(),
                name: Some("Q_Ring_1".into()),
                watch: true,
            }
        );
    }

    #[test]
    fn test_scan_default_duration() {
        let cli = Cli::try_parse_from(["ringlink", "scan"]).unwrap();
        assert_eq!(cli.command, Commands::Scan { seconds: 10 });
    }

    #[test]
    fn test_send_requires_command() {
        assert!(Cli::try_parse_from(["ringlink", "send"]).is_err());
        let cli = Cli::try_parse_from(["ringlink", "send", "battery", "-p", "03"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Send {
                command: "battery".into(),
                payload: Some("03".into()),
            }
        );
    }
}
