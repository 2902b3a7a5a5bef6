//! Shared key-value store with change notifications
//!
//! A post overwrites one well-known key per channel name; the store notifies
//! every subscriber of the change, and receivers keep only records written by
//! another state that they have not emitted before.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use futures::future::{BoxFuture, FutureExt};
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{EnvelopeHandler, Preparation, Transport, TransportState};
use crate::config::ChannelOptions;
use crate::dedup::ObliviousSet;
use crate::types::{now_millis, Envelope};
use crate::{BroadcastError, Result};

pub const TYPE: &str = "kv";

pub const KEY_PREFIX: &str = "pubkey.broadcastChannel-";
const CHECK_KEY: &str = "__broadcastchannel_check";
const EVENT_BUFFER: usize = 1024;

/// Storage key of channel `name`
pub fn storage_key(name: &str) -> String {
    format!("{}{}", KEY_PREFIX, name)
}

// ----------------------------------------------------------------------------
// Store Backend
// ----------------------------------------------------------------------------

/// Change notification fired after every write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub new_value: Option<String>,
}

/// Backend of the shared-kv-store transport
pub trait KeyValueStore: Send + Sync {
    fn set_item(&self, key: &str, value: String) -> Result<()>;

    fn get_item(&self, key: &str) -> Option<String>;

    fn remove_item(&self, key: &str);

    /// Receive every change made after this call, including the subscriber's own
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}

/// In-memory [`KeyValueStore`] with an optional byte quota
pub struct MemoryKvStore {
    items: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
    events: broadcast::Sender<StorageEvent>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A store that rejects writes once keys and values exceed `bytes`
    pub fn with_quota(bytes: usize) -> Self {
        Self::build(Some(bytes))
    }

    fn build(quota: Option<usize>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            items: Mutex::new(HashMap::new()),
            quota,
            events,
        }
    }

    /// Process-wide store shared by every kv channel without an injected store
    pub fn global() -> Arc<MemoryKvStore> {
        static STORE: OnceLock<Arc<MemoryKvStore>> = OnceLock::new();
        STORE.get_or_init(|| Arc::new(MemoryKvStore::new())).clone()
    }

    fn notify(&self, key: &str, new_value: Option<String>) {
        // no receivers is fine
        let _ = self.events.send(StorageEvent {
            key: key.to_string(),
            new_value,
        });
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryKvStore {
    fn set_item(&self, key: &str, value: String) -> Result<()> {
        {
            let mut items = self.items.lock();
            if let Some(quota) = self.quota {
                let used: usize = items
                    .iter()
                    .filter(|(k, _)| k.as_str() != key)
                    .map(|(k, v)| k.len() + v.len())
                    .sum();
                if used + key.len() + value.len() > quota {
                    return Err(BroadcastError::transport_send(TYPE, "storage quota exceeded"));
                }
            }
            items.insert(key.to_string(), value.clone());
        }
        self.notify(key, Some(value));
        Ok(())
    }

    fn get_item(&self, key: &str) -> Option<String> {
        self.items.lock().get(key).cloned()
    }

    fn remove_item(&self, key: &str) {
        let removed = self.items.lock().remove(key).is_some();
        if removed {
            self.notify(key, None);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}

fn resolve_store(options: &ChannelOptions) -> Arc<dyn KeyValueStore> {
    match &options.kv.store {
        Some(store) => store.clone(),
        None => MemoryKvStore::global(),
    }
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

/// Value written under the channel key
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvRecord {
    #[serde(default)]
    token: String,
    time: u64,
    data: Envelope,
    uuid: String,
}

/// The shared-kv-store transport descriptor
#[derive(Debug, Clone, Copy, Default)]
pub struct KvTransport;

impl Transport for KvTransport {
    fn transport_type(&self) -> &str {
        TYPE
    }

    fn can_be_used(&self, options: &ChannelOptions) -> bool {
        let store = resolve_store(options);
        if store.set_item(CHECK_KEY, "works".into()).is_err() {
            return false;
        }
        store.remove_item(CHECK_KEY);
        true
    }

    fn create(&self, name: &str, options: &ChannelOptions) -> Preparation {
        Preparation::from_result(KvState::create(name, options))
    }

    fn average_response_time(&self, _options: &ChannelOptions) -> Duration {
        Duration::from_millis(120)
    }
}

struct Listener {
    handler: EnvelopeHandler,
    since_micros: u64,
}

struct KvShared {
    uuid: String,
    emitted: Mutex<ObliviousSet<String>>,
    listener: Mutex<Option<Listener>>,
}

impl KvShared {
    fn handle(&self, record: KvRecord) {
        let (handler, since) = match self.listener.lock().as_ref() {
            Some(listener) => (listener.handler.clone(), listener.since_micros),
            None => return,
        };
        if record.uuid == self.uuid {
            return;
        }
        {
            let mut emitted = self.emitted.lock();
            if record.token.is_empty() || emitted.has(&record.token) {
                return;
            }
            if record.data.time < since {
                return;
            }
            emitted.add(record.token);
        }
        handler(record.data);
    }
}

/// Per-channel shared-kv-store state
pub struct KvState {
    key: String,
    store: Arc<dyn KeyValueStore>,
    shared: Arc<KvShared>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl KvState {
    fn create(name: &str, options: &ChannelOptions) -> Result<Arc<dyn TransportState>> {
        if !KvTransport.can_be_used(options) {
            return Err(BroadcastError::transport_unavailable(TYPE, "store cannot be used"));
        }

        let key = storage_key(name);
        let store = resolve_store(options);
        let shared = Arc::new(KvShared {
            uuid: uuid::Uuid::new_v4().to_string(),
            emitted: Mutex::new(ObliviousSet::new(options.kv.remove_timeout())),
            listener: Mutex::new(None),
        });

        let mut events = store.subscribe();
        let pump_shared = shared.clone();
        let pump_key = key.clone();
        let pump = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(StorageEvent {
                        key,
                        new_value: Some(value),
                    }) if key == pump_key => match serde_json::from_str::<KvRecord>(&value) {
                        Ok(record) => pump_shared.handle(record),
                        Err(err) => tracing::debug!("ignoring malformed kv record: {}", err),
                    },
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("kv listener lagged, {} changes skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Arc::new(KvState {
            key,
            store,
            shared,
            pump: Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
        }))
    }
}

impl TransportState for KvState {
    fn post_message(&self, envelope: Envelope) -> BoxFuture<'static, Result<()>> {
        if self.closed.load(Ordering::Acquire) {
            return futures::future::ready(Err(BroadcastError::transport_send(TYPE, "state closed")))
                .boxed();
        }

        let record = KvRecord {
            token: uuid::Uuid::new_v4().simple().to_string(),
            time: now_millis(),
            data: envelope,
            uuid: self.shared.uuid.clone(),
        };
        let result = serde_json::to_string(&record)
            .map_err(super::send_error(TYPE))
            .and_then(|value| self.store.set_item(&self.key, value));
        futures::future::ready(result).boxed()
    }

    fn on_message(&self, handler: Option<EnvelopeHandler>, since_micros: u64) {
        *self.shared.listener.lock() = handler.map(|handler| Listener {
            handler,
            since_micros,
        });
    }

    fn close(&self) -> BoxFuture<'static, Result<()>> {
        self.closed.store(true, Ordering::Release);
        *self.shared.listener.lock() = None;
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        futures::future::ready(Ok(())).boxed()
    }
}
