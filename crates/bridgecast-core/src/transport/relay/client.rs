//! Relay connection
//!
//! [`RelayClient`] is the seam to the relay service: publish a signed, encrypted
//! record and subscribe to the records of one channel topic. [`InMemoryRelay`]
//! is an in-process relay that checks signatures the way the service does.

use alloc::string::String;
use alloc::sync::Arc;
use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tokio::sync::broadcast;

use super::crypto;
use super::TYPE;
use crate::config::RelayOptions;
use crate::{BroadcastError, Result};

const TOPIC_BUFFER: usize = 1024;

/// Body of a publish request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishBody {
    pub same_origin_check: bool,
    pub same_ip_check: bool,
    /// Channel public key (hex), the topic
    pub key: String,
    /// Encrypted record (hex)
    pub data: String,
    /// Signature over `sha256(data)` (hex)
    pub signature: String,
    /// Relay-side retention hint in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Connection to a relay service
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Publish one record to its topic
    async fn publish(&self, body: PublishBody) -> Result<()>;

    /// Encrypted records published to `channel_pub_key` from now on
    fn subscribe(&self, channel_pub_key: &str) -> broadcast::Receiver<String>;
}

/// In-process relay
///
/// Rejects publishes whose signature does not verify against their topic key
/// and fans the encrypted record out to every subscriber of the topic.
#[derive(Default)]
pub struct InMemoryRelay {
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, key: &str) -> broadcast::Sender<String> {
        self.topics
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_BUFFER).0)
            .clone()
    }

    /// Number of live subscriptions on `key`
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.topics
            .lock()
            .get(key)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl RelayClient for InMemoryRelay {
    async fn publish(&self, body: PublishBody) -> Result<()> {
        if !crypto::verify(&body.key, &body.data, &body.signature) {
            return Err(BroadcastError::transport_send(TYPE, "relay rejected signature"));
        }
        // a topic nobody listens to drops the record
        let _ = self.topic(&body.key).send(body.data);
        Ok(())
    }

    fn subscribe(&self, channel_pub_key: &str) -> broadcast::Receiver<String> {
        self.topic(channel_pub_key).subscribe()
    }
}

static CONNECTION: OnceLock<Arc<dyn RelayClient>> = OnceLock::new();

/// Client for `options`: the injected one, else the process-wide connection,
/// created on first use. The first caller's endpoints win.
pub fn connection(options: &RelayOptions) -> Arc<dyn RelayClient> {
    if let Some(client) = &options.client {
        return client.clone();
    }
    CONNECTION
        .get_or_init(|| {
            tracing::debug!(
                "opening relay connection to {} (publish {})",
                options.socket_url,
                options.api_url
            );
            let relay: Arc<dyn RelayClient> = Arc::new(InMemoryRelay::new());
            relay
        })
        .clone()
}

// ----------------------------------------------------------------------------
// Running Channels
// ----------------------------------------------------------------------------

static RUNNING_CHANNELS: Mutex<Option<HashMap<String, usize>>> = parking_lot::const_mutex(None);

/// Record one more open relay state for `name`
pub(crate) fn register_running(name: &str) {
    *RUNNING_CHANNELS
        .lock()
        .get_or_insert_with(HashMap::new)
        .entry(name.to_string())
        .or_insert(0) += 1;
}

pub(crate) fn unregister_running(name: &str) {
    let mut running = RUNNING_CHANNELS.lock();
    if let Some(channels) = running.as_mut() {
        if let Some(count) = channels.get_mut(name) {
            *count -= 1;
            if *count == 0 {
                channels.remove(name);
            }
        }
    }
}

/// Whether any relay state for `name` is still open
pub fn is_running(name: &str) -> bool {
    RUNNING_CHANNELS
        .lock()
        .as_ref()
        .map(|channels| channels.contains_key(name))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::relay::crypto::ChannelKeys;

    fn signed_body(keys: &ChannelKeys, data: &str) -> PublishBody {
        PublishBody {
            same_origin_check: true,
            same_ip_check: true,
            key: keys.public_key_hex(),
            data: data.to_string(),
            signature: keys.sign(data),
            timeout: None,
        }
    }

    #[test]
    fn test_publish_body_wire_shape() {
        let keys = ChannelKeys::derive("pubkey.broadcastChannel-wire");
        let mut body = signed_body(&keys, "00ff");
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["sameOriginCheck"], true);
        assert_eq!(value["sameIpCheck"], true);
        assert!(value.get("timeout").is_none());

        body.timeout = Some(5000);
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["timeout"], 5000);
    }

    #[tokio::test]
    async fn test_relay_fans_out_verified_records() {
        let relay = InMemoryRelay::new();
        let keys = ChannelKeys::derive("pubkey.broadcastChannel-fanout");
        let mut first = relay.subscribe(&keys.public_key_hex());
        let mut second = relay.subscribe(&keys.public_key_hex());
        assert_eq!(relay.subscriber_count(&keys.public_key_hex()), 2);

        relay.publish(signed_body(&keys, "cafe")).await.unwrap();
        assert_eq!(first.recv().await.unwrap(), "cafe");
        assert_eq!(second.recv().await.unwrap(), "cafe");
    }

    #[tokio::test]
    async fn test_relay_rejects_forged_signature() {
        let relay = InMemoryRelay::new();
        let keys = ChannelKeys::derive("pubkey.broadcastChannel-forged");
        let mut body = signed_body(&keys, "cafe");
        body.data = "beef".into();
        assert!(relay.publish(body).await.is_err());
    }

    #[test]
    fn test_running_channel_refcount() {
        let name = format!("running-{}", uuid::Uuid::new_v4());
        register_running(&name);
        register_running(&name);
        unregister_running(&name);
        assert!(is_running(&name));
        unregister_running(&name);
        assert!(!is_running(&name));
    }
}
