//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

#[derive(Parser)]
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

    /// Force a transport (native, store, kv, relay, simulate)
    #[arg(short = 't', long = "type")]
    pub transport: Option<String>,

    /// Channel flavour
    #[arg(long, value_enum)]
    pub mode: Option<ChannelMode>,

    /// Root directory of the persistent store
    #[arg(short, long)]
    pub data_dir: Option<String>,
}

/// Which channel implementation the commands open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    /// One channel on one transport
    #[default]
    Single,
    /// Send on one transport, fall back on failure
    Adaptive,
    /// Send on every transport, deduplicate on receipt
    Redundant,
}

impl ChannelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelMode::Single => "single",
            ChannelMode::Adaptive => "adaptive",
            ChannelMode::Redundant => "redundant",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Post one message and exit
    Send {
        /// Channel name
        channel: String,
        /// JSON payload; anything that does not parse is sent as a string
        message: String,
    },
    /// Print received messages
    Listen {
        /// Channel name
        channel: String,
        /// Exit after this many messages
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
    /// List the built-in transports in selection order
    Transports,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send_with_globals() {
        let cli = Cli::try_parse_from([
            "bridgecast", "-v", "-t", "store", "--mode", "adaptive", "send", "chat", r#"{"text":"hi"}"#,
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.transport.as_deref(), Some("store"));
        assert_eq!(cli.mode, Some(ChannelMode::Adaptive));
        match cli.command {
            Commands::Send { channel, message } => {
                assert_eq!(channel, "chat");
                assert_eq!(message, r#"{"text":"hi"}"#);
            }
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn test_parse_listen_count() {
        let cli = Cli::try_parse_from(["bridgecast", "listen", "chat", "--count", "3"]).unwrap();
        assert!(matches!(cli.command, Commands::Listen { count: Some(3), .. }));
        assert_eq!(cli.mode, None);
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(Cli::try_parse_from(["bridgecast", "--mode", "twice", "transports"]).is_err());
    }
}
