//! Command handlers for the bridgecast CLI

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use bridgecast_core::transport::builtin_transports;
use bridgecast_core::{
    choose_transport, AdaptiveBroadcastChannel, BroadcastChannel, MessageCallback,
    RedundantAdaptiveBroadcastChannel,
};

use crate::cli::{ChannelMode, Cli, Commands};
use crate::config::CliConfig;
use crate::error::Result;

// ----------------------------------------------------------------------------
// Channel Flavours
// ----------------------------------------------------------------------------

/// One of the three channel flavours behind a common surface
pub enum Endpoint {
    Single(BroadcastChannel),
    Adaptive(AdaptiveBroadcastChannel),
    Redundant(RedundantAdaptiveBroadcastChannel),
}

impl Endpoint {
    pub fn open(name: &str, config: &CliConfig) -> Result<Self> {
        let options = Some(config.channel.clone());
        let endpoint = match config.cli.mode {
            ChannelMode::Single => Endpoint::Single(BroadcastChannel::new(name, options)?),
            ChannelMode::Adaptive => Endpoint::Adaptive(AdaptiveBroadcastChannel::new(name, options)?),
            ChannelMode::Redundant => {
                Endpoint::Redundant(RedundantAdaptiveBroadcastChannel::new(name, options)?)
            }
        };
        info!("Opened {} channel {} via {}", config.cli.mode.as_str(), name, endpoint.describe());
        Ok(endpoint)
    }

    /// Transport tags the endpoint runs on
    pub fn describe(&self) -> String {
        match self {
            Endpoint::Single(channel) => channel.transport_type().to_string(),
            Endpoint::Adaptive(channel) => channel.channel_types().join(", "),
            Endpoint::Redundant(channel) => channel.channel_types().join(", "),
        }
    }

    pub async fn post(&self, message: Value, retries: usize) -> Result<()> {
        match self {
            Endpoint::Single(channel) => channel.post_message(message).await?,
            Endpoint::Adaptive(channel) => channel.post_message_with_retries(message, retries).await?,
            Endpoint::Redundant(channel) => {
                channel.post_message(message).await?;
            }
        }
        Ok(())
    }

    pub fn set_onmessage(&self, callback: Option<MessageCallback>) {
        match self {
            Endpoint::Single(channel) => channel.set_onmessage(callback),
            Endpoint::Adaptive(channel) => channel.set_onmessage(callback),
            Endpoint::Redundant(channel) => channel.set_onmessage(callback),
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            Endpoint::Single(channel) => channel.close().await?,
            Endpoint::Adaptive(channel) => channel.close().await?,
            Endpoint::Redundant(channel) => channel.close().await?,
        }
        Ok(())
    }
}

/// Parse a payload argument, falling back to a JSON string
pub fn parse_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

// ----------------------------------------------------------------------------
// Command Dispatcher
// ----------------------------------------------------------------------------

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: CliConfig) -> Result<()> {
        match cli.command {
            Commands::Send { channel, message } => Self::handle_send_command(&config, &channel, &message).await,
            Commands::Listen { channel, count } => Self::handle_listen_command(&config, &channel, count).await,
            Commands::Transports => Self::handle_transports_command(&config),
        }
    }

    /// Handle the send command
    async fn handle_send_command(config: &CliConfig, channel: &str, message: &str) -> Result<()> {
        let endpoint = Endpoint::open(channel, config)?;
        let payload = parse_payload(message);

        let sent = endpoint.post(payload, config.cli.send_retries).await;
        // close even when the send failed so the transport is released
        endpoint.close().await?;
        sent?;

        println!("Message sent to {} via {}", channel, endpoint.describe());
        Ok(())
    }

    /// Handle the listen command
    async fn handle_listen_command(config: &CliConfig, channel: &str, count: Option<usize>) -> Result<()> {
        let endpoint = Endpoint::open(channel, config)?;
        let (inbox, mut received) = mpsc::unbounded_channel::<Value>();
        endpoint.set_onmessage(Some(Arc::new(move |payload: &Value| {
            let _ = inbox.send(payload.clone());
        })));

        info!("Listening on {}... Press Ctrl+C to stop", channel);
        let mut seen = 0usize;
        loop {
            tokio::select! {
                payload = received.recv() => {
                    let Some(payload) = payload else { break };
                    println!("{}", serde_json::to_string(&payload)?);
                    seen += 1;
                    if count.is_some_and(|limit| seen >= limit) {
                        break;
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        warn!("Failed to wait for Ctrl+C: {}", e);
                    }
                    break;
                }
            }
        }

        endpoint.set_onmessage(None);
        endpoint.close().await?;
        info!("Received {} messages on {}", seen, channel);
        Ok(())
    }

    /// Handle the transports command
    fn handle_transports_command(config: &CliConfig) -> Result<()> {
        let mut options = config.channel.clone().with_defaults();
        options.transport_type = None;

        println!("{:<10} {:<8} {:>10}", "TYPE", "USABLE", "RESPONSE");
        for transport in builtin_transports() {
            println!(
                "{:<10} {:<8} {:>8}ms",
                transport.transport_type(),
                if transport.can_be_used(&options) { "yes" } else { "no" },
                transport.average_response_time(&options).as_millis()
            );
        }

        let chosen = choose_transport(&options)?;
        println!("auto-selected: {}", chosen.transport_type());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_parsing() {
        assert_eq!(parse_payload(r#"{"text":"hi"}"#), json!({ "text": "hi" }));
        assert_eq!(parse_payload("42"), json!(42));
        assert_eq!(parse_payload("hello there"), json!("hello there"));
    }

    #[tokio::test]
    async fn test_endpoints_round_trip_in_every_mode() {
        for mode in [ChannelMode::Single, ChannelMode::Adaptive, ChannelMode::Redundant] {
            let mut config = CliConfig::default();
            config.channel = config.channel.with_type("simulate");
            config.cli.mode = mode;

            let name = format!("cli-{}", mode.as_str());
            let sender = Endpoint::open(&name, &config).unwrap();
            let receiver = Endpoint::open(&name, &config).unwrap();

            let (inbox, mut received) = mpsc::unbounded_channel::<Value>();
            receiver.set_onmessage(Some(Arc::new(move |payload: &Value| {
                let _ = inbox.send(payload.clone());
            })));

            sender.post(json!({ "text": "hi" }), 4).await.unwrap();
            let got = tokio::time::timeout(std::time::Duration::from_secs(1), received.recv())
                .await
                .unwrap();
            assert_eq!(got, Some(json!({ "text": "hi" })), "{:?}", mode);

            sender.close().await.unwrap();
            receiver.close().await.unwrap();
        }
    }
}
