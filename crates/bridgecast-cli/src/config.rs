//! Bridgecast CLI Configuration Management
//!
//! Configuration is layered with figment, lowest priority first:
//! - Default values
//! - Configuration file (`bridgecast.toml`, or the file given with `--config`)
//! - Environment variables (`BRIDGECAST_*`, nested keys split on `__`)
//! - Command line arguments

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use bridgecast_core::transport::builtin_types;
use bridgecast_core::transport::{simulate, store};
use bridgecast_core::{ChannelOptions, DEFAULT_MAX_RETRIES};

use crate::cli::{ChannelMode, Cli};
use crate::error::{CliError, Result};

const DEFAULT_CONFIG_FILE: &str = "bridgecast.toml";
const ENV_PREFIX: &str = "BRIDGECAST_";

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration of the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Options every opened channel is constructed with
    pub channel: ChannelOptions,

    /// CLI behaviour
    pub cli: CliSettings,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            // the store is the only built-in transport another process can read
            channel: ChannelOptions::default().with_type(store::TYPE),
            cli: CliSettings::default(),
        }
    }
}

/// CLI-specific configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliSettings {
    /// Enable verbose logging output
    pub verbose: bool,

    /// Channel flavour the commands open
    pub mode: ChannelMode,

    /// Attempts per send in adaptive mode
    pub send_retries: usize,
}

impl Default for CliSettings {
    fn default() -> Self {
        Self {
            verbose: false,
            mode: ChannelMode::Single,
            send_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl CliConfig {
    /// Load configuration for `cli` with the standard priority order
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(DEFAULT_CONFIG_FILE));

        if let Some(path) = &cli.config {
            tracing::info!("Loading configuration from: {}", path);
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(Self::apply_overrides(figment, cli))
    }

    fn apply_overrides(mut figment: Figment, cli: &Cli) -> Figment {
        if let Some(transport) = &cli.transport {
            figment = figment.merge(("channel.type", transport.as_str()));
        }
        if let Some(mode) = cli.mode {
            figment = figment.merge(("cli.mode", mode.as_str()));
        }
        if let Some(directory) = &cli.data_dir {
            figment = figment.merge(("channel.store.directory", directory.as_str()));
        }
        if cli.verbose {
            figment = figment.merge(("cli.verbose", true));
        }
        figment
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: CliConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        if let Some(transport) = self.channel.transport_type.as_deref() {
            let known = transport == simulate::TYPE || builtin_types().contains(&transport);
            if !known && !transport.is_empty() {
                return Err(CliError::Config(format!("Unknown transport: {}", transport)));
            }
        }

        if self.cli.send_retries == 0 {
            return Err(CliError::Config(
                "Send retries must be greater than 0".to_string(),
            ));
        }

        if let Some(reason) = self.process_local_reason() {
            tracing::warn!("Channels will not reach other processes: {}", reason);
        }

        Ok(())
    }

    /// Why channels opened with this configuration stay inside this process
    pub fn process_local_reason(&self) -> Option<String> {
        match self.cli.mode {
            ChannelMode::Single => match self.channel.transport_type.as_deref() {
                Some(store::TYPE) => None,
                None | Some("") => Some("auto-selection picks the in-process native transport".to_string()),
                Some(transport) => Some(format!("the {} transport is in-process", transport)),
            },
            ChannelMode::Adaptive => {
                Some("adaptive mode sends over the in-process native transport first".to_string())
            }
            ChannelMode::Redundant => {
                Some("redundant mode leaves out the store, the only cross-process transport".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridgecast_core::Transport;
    use clap::Parser;

    fn layered(toml: &str, args: &[&str]) -> Result<CliConfig> {
        let cli = Cli::try_parse_from(args).map_err(|e| CliError::Config(e.to_string()))?;
        let figment = Figment::new()
            .merge(Serialized::defaults(CliConfig::default()))
            .merge(Toml::string(toml));
        CliConfig::extract(CliConfig::apply_overrides(figment, &cli))
    }

    #[test]
    fn test_defaults() {
        let config = layered("", &["bridgecast", "transports"]).unwrap();
        assert_eq!(config.cli.mode, ChannelMode::Single);
        assert_eq!(config.cli.send_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.channel.transport_type.as_deref(), Some("store"));
        assert!(config.channel.web_worker_support);
        assert_eq!(config.process_local_reason(), None);
    }

    #[test]
    fn test_default_channel_reaches_other_processes() {
        let config = layered("", &["bridgecast", "listen", "chat"]).unwrap();
        let chosen = bridgecast_core::choose_transport(&config.channel.clone().with_defaults()).unwrap();
        assert_eq!(chosen.transport_type(), "store");
    }

    #[test]
    fn test_in_process_setups_are_flagged() {
        for args in [
            ["bridgecast", "-t", "native", "send", "chat", "hi"],
            ["bridgecast", "-t", "kv", "send", "chat", "hi"],
            ["bridgecast", "--mode", "adaptive", "send", "chat", "hi"],
            ["bridgecast", "--mode", "redundant", "send", "chat", "hi"],
        ] {
            let config = layered("", &args).unwrap();
            assert!(config.process_local_reason().is_some(), "{:?}", args);
        }

        let store = layered("", &["bridgecast", "-t", "store", "send", "chat", "hi"]).unwrap();
        assert!(store.process_local_reason().is_none());
    }

    #[test]
    fn test_file_values_are_read() {
        let toml = r#"
            [cli]
            mode = "redundant"

            [channel]
            type = "kv"

            [channel.store]
            fallback_interval_ms = 40
        "#;
        let config = layered(toml, &["bridgecast", "transports"]).unwrap();
        assert_eq!(config.cli.mode, ChannelMode::Redundant);
        assert_eq!(config.channel.transport_type.as_deref(), Some("kv"));
        assert_eq!(config.channel.store.fallback_interval_ms, 40);
    }

    #[test]
    fn test_flags_override_file() {
        let toml = r#"
            [channel]
            type = "kv"
        "#;
        let args = ["bridgecast", "-t", "store", "-d", "/tmp/bc", "--mode", "adaptive", "transports"];
        let config = layered(toml, &args).unwrap();
        assert_eq!(config.channel.transport_type.as_deref(), Some("store"));
        assert_eq!(config.cli.mode, ChannelMode::Adaptive);
        assert_eq!(
            config.channel.store.directory.as_deref(),
            Some(std::path::Path::new("/tmp/bc"))
        );
    }

    #[test]
    fn test_unknown_transport_rejected() {
        let err = layered("", &["bridgecast", "-t", "carrier-pigeon", "transports"]).unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
    }
}
