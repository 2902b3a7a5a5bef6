//! Network relay transport
//!
//! Records are encrypted with the channel key, signed, and published to the
//! relay under the channel public key. Every state subscribed to that topic
//! decrypts what arrives and emits records written by other states. Relayed
//! records may carry a remote clock, so no registration-time filter applies.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::kv::storage_key;
use super::{EnvelopeHandler, Preparation, Transport, TransportState, WriteChain};
use crate::config::ChannelOptions;
use crate::dedup::ObliviousSet;
use crate::types::{now_millis, Envelope};
use crate::{BroadcastError, Result};

pub mod client;
pub mod crypto;

pub use client::{connection, is_running, InMemoryRelay, PublishBody, RelayClient};
pub use crypto::ChannelKeys;

pub const TYPE: &str = "relay";

/// Plaintext of a relayed record
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RelayRecord {
    #[serde(default)]
    token: String,
    time: u64,
    data: Envelope,
    uuid: String,
}

/// The network-relay transport descriptor
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayTransport;

impl Transport for RelayTransport {
    fn transport_type(&self) -> &str {
        TYPE
    }

    fn can_be_used(&self, _options: &ChannelOptions) -> bool {
        true
    }

    fn create(&self, name: &str, options: &ChannelOptions) -> Preparation {
        Preparation::Ready(RelayState::create(name, options))
    }

    fn average_response_time(&self, _options: &ChannelOptions) -> Duration {
        Duration::from_millis(500)
    }
}

struct RelayShared {
    name: String,
    uuid: String,
    keys: ChannelKeys,
    emitted: Mutex<ObliviousSet<String>>,
    handler: Mutex<Option<EnvelopeHandler>>,
}

impl RelayShared {
    fn handle(&self, sealed: &str) {
        let record: RelayRecord = match self
            .keys
            .decrypt(sealed)
            .and_then(|plain| serde_json::from_slice(&plain).map_err(BroadcastError::from))
        {
            Ok(record) => record,
            Err(err) => {
                tracing::error!("dropping unreadable relay record on {}: {}", self.name, err);
                return;
            }
        };

        let Some(handler) = self.handler.lock().clone() else {
            return;
        };
        if record.uuid == self.uuid {
            return;
        }
        {
            let mut emitted = self.emitted.lock();
            if record.token.is_empty() || emitted.has(&record.token) {
                return;
            }
            emitted.add(record.token);
        }
        handler(record.data);
    }

    async fn pump(self: Arc<Self>, client: Arc<dyn RelayClient>, mut records: broadcast::Receiver<String>) {
        let topic = self.keys.public_key_hex();
        loop {
            match records.recv().await {
                Ok(sealed) => self.handle(&sealed),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("relay listener on {} lagged, {} records skipped", self.name, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    if !client::is_running(&self.name) {
                        break;
                    }
                    tracing::error!("relay subscription on {} closed unexpectedly, resubscribing", self.name);
                    records = client.subscribe(&topic);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Per-channel relay state
pub struct RelayState {
    client: Arc<dyn RelayClient>,
    shared: Arc<RelayShared>,
    timeout: Option<u64>,
    writes: WriteChain,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RelayState {
    fn create(name: &str, options: &ChannelOptions) -> Arc<dyn TransportState> {
        let client = client::connection(&options.relay);
        let shared = Arc::new(RelayShared {
            name: name.to_string(),
            uuid: uuid::Uuid::new_v4().to_string(),
            keys: ChannelKeys::derive(&storage_key(name)),
            emitted: Mutex::new(ObliviousSet::new(options.relay.remove_timeout())),
            handler: Mutex::new(None),
        });

        let records = client.subscribe(&shared.keys.public_key_hex());
        let pump = tokio::spawn(shared.clone().pump(client.clone(), records));
        client::register_running(name);

        Arc::new(RelayState {
            client,
            shared,
            timeout: options.relay.timeout_ms.filter(|ms| *ms > 0),
            writes: WriteChain::new(),
            pump: Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
        })
    }

    fn seal(&self, envelope: Envelope) -> Result<PublishBody> {
        let record = RelayRecord {
            token: uuid::Uuid::new_v4().simple().to_string(),
            time: now_millis(),
            data: envelope,
            uuid: self.shared.uuid.clone(),
        };
        let plain = serde_json::to_vec(&record).map_err(super::send_error(TYPE))?;
        let data = self.shared.keys.encrypt(&plain)?;
        Ok(PublishBody {
            same_origin_check: true,
            same_ip_check: true,
            key: self.shared.keys.public_key_hex(),
            signature: self.shared.keys.sign(&data),
            data,
            timeout: self.timeout,
        })
    }
}

impl TransportState for RelayState {
    fn post_message(&self, envelope: Envelope) -> BoxFuture<'static, Result<()>> {
        if self.closed.load(Ordering::Acquire) {
            return futures::future::ready(Err(BroadcastError::transport_send(TYPE, "state closed")))
                .boxed();
        }
        let body = match self.seal(envelope) {
            Ok(body) => body,
            Err(err) => return futures::future::ready(Err(err)).boxed(),
        };
        let client = self.client.clone();
        self.writes.push(async move { client.publish(body).await })
    }

    fn on_message(&self, handler: Option<EnvelopeHandler>, _since_micros: u64) {
        *self.shared.handler.lock() = handler;
    }

    fn close(&self) -> BoxFuture<'static, Result<()>> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            client::unregister_running(&self.shared.name);
            *self.shared.handler.lock() = None;
            if let Some(pump) = self.pump.lock().take() {
                pump.abort();
            }
        }
        futures::future::ready(Ok(())).boxed()
    }
}
