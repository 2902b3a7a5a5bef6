//! Bridgecast CLI library
//!
//! Argument parsing, layered configuration and the command handlers behind
//! the `bridgecast` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{ChannelMode, Cli, Commands};
pub use commands::{CommandDispatcher, Endpoint};
pub use config::{CliConfig, CliSettings};
pub use error::{CliError, Result};
