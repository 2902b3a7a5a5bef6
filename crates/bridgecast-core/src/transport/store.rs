//! Persistent message store with a polling read loop
//!
//! Every post appends one record to a per-channel store shared by every
//! process that opens the same root directory. Each state polls for records
//! newer than its cursor and emits the ones written by other states.
//!
//! The filesystem backend keeps one JSON file per record. Record ids are
//! allocated by hard-linking a fully written temporary file to the next free
//! id, so a record only becomes visible once complete and two writers never
//! share an id.

use alloc::sync::Arc;
use alloc::vec::Vec;
use async_trait::async_trait;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

use super::{EnvelopeHandler, Preparation, Transport, TransportState, WriteChain};
use crate::config::{Callback, ChannelOptions};
use crate::dedup::ObliviousSet;
use crate::types::{now_millis, Envelope};
use crate::{BroadcastError, Result};

pub const TYPE: &str = "store";

const STORE_PREFIX: &str = "pubkey.broadcast-channel-0-";
const RECORD_EXTENSION: &str = "json";

/// One in this many writes triggers a cleanup of expired records
const CLEANUP_ODDS: u8 = 11;

// ----------------------------------------------------------------------------
// Store Backend
// ----------------------------------------------------------------------------

/// A record as persisted in the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Auto-increment id, unique within one store
    pub id: u64,
    /// Writer state identity
    pub uuid: String,
    /// Wall-clock milliseconds at write time
    pub time: u64,
    pub data: Envelope,
}

/// Backend of the persistent-store transport
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a record and return the id it was stored under
    async fn append(&self, uuid: &str, time: u64, data: &Envelope) -> Result<u64>;

    /// All records with an id greater than `last_id`, in id order
    async fn read_after(&self, last_id: u64) -> Result<Vec<StoredMessage>>;

    /// Delete records written before `cutoff_millis`; returns how many were removed
    async fn remove_older_than(&self, cutoff_millis: u64) -> Result<usize>;

    /// Whether the store still exists
    async fn is_available(&self) -> bool;
}

fn io_error(err: io::Error) -> BroadcastError {
    BroadcastError::transport_send(TYPE, err.to_string())
}

/// Filesystem-backed [`MessageStore`]
pub struct FsMessageStore {
    directory: PathBuf,
    next_id: AtomicU64,
}

impl FsMessageStore {
    /// Open (creating if needed) the store of channel `name` below `root`
    pub async fn open(root: &Path, name: &str) -> Result<Self> {
        let directory = root.join(format!("{}{}", STORE_PREFIX, hex::encode(name.as_bytes())));
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(|e| BroadcastError::transport_unavailable(TYPE, e.to_string()))?;

        let store = Self {
            directory,
            next_id: AtomicU64::new(1),
        };
        let highest = store.record_ids().await?.into_iter().max().unwrap_or(0);
        store.next_id.store(highest + 1, Ordering::Release);
        tracing::debug!("opened message store {}", store.directory.display());
        Ok(store)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn record_path(&self, id: u64) -> PathBuf {
        self.directory.join(format!("{:020}.{}", id, RECORD_EXTENSION))
    }

    fn parse_id(path: &Path) -> Option<u64> {
        if path.extension()? != RECORD_EXTENSION {
            return None;
        }
        path.file_stem()?.to_str()?.parse().ok()
    }

    async fn record_ids(&self) -> Result<Vec<u64>> {
        let mut entries = tokio::fs::read_dir(&self.directory).await.map_err(io_error)?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            if let Some(id) = Self::parse_id(&entry.path()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Read a record; `None` if it vanished in between
    async fn read_record(&self, id: u64) -> Result<Option<StoredMessage>> {
        match tokio::fs::read(self.record_path(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(err)),
        }
    }
}

#[async_trait]
impl MessageStore for FsMessageStore {
    async fn append(&self, uuid: &str, time: u64, data: &Envelope) -> Result<u64> {
        let staging = self
            .directory
            .join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        let mut id = self.next_id.load(Ordering::Acquire);

        let linked = loop {
            let record = StoredMessage {
                id,
                uuid: uuid.to_string(),
                time,
                data: data.clone(),
            };
            let bytes = serde_json::to_vec(&record).map_err(super::send_error(TYPE))?;
            if let Err(err) = tokio::fs::write(&staging, bytes).await {
                break Err(io_error(err));
            }
            match tokio::fs::hard_link(&staging, self.record_path(id)).await {
                Ok(()) => break Ok(id),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => id += 1,
                Err(err) => break Err(io_error(err)),
            }
        };

        let _ = tokio::fs::remove_file(&staging).await;
        let id = linked?;
        self.next_id.fetch_max(id + 1, Ordering::AcqRel);
        Ok(id)
    }

    async fn read_after(&self, last_id: u64) -> Result<Vec<StoredMessage>> {
        let mut records = Vec::new();
        for id in self.record_ids().await?.into_iter().filter(|id| *id > last_id) {
            if let Some(record) = self.read_record(id).await? {
                records.push(record);
            }
        }
        if let Some(last) = records.last() {
            self.next_id.fetch_max(last.id + 1, Ordering::AcqRel);
        }
        Ok(records)
    }

    async fn remove_older_than(&self, cutoff_millis: u64) -> Result<usize> {
        let mut removed = 0;
        for id in self.record_ids().await? {
            let Some(record) = self.read_record(id).await? else {
                continue;
            };
            // ids grow with write time, so the first young record ends the scan
            if record.time >= cutoff_millis {
                break;
            }
            match tokio::fs::remove_file(self.record_path(id)).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_error(err)),
            }
        }
        Ok(removed)
    }

    async fn is_available(&self) -> bool {
        tokio::fs::metadata(&self.directory)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

/// The persistent-store transport descriptor
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreTransport;

impl Transport for StoreTransport {
    fn transport_type(&self) -> &str {
        TYPE
    }

    fn can_be_used(&self, options: &ChannelOptions) -> bool {
        std::fs::create_dir_all(options.store.root()).is_ok()
    }

    fn create(&self, name: &str, options: &ChannelOptions) -> Preparation {
        let root = options.store.root();
        let name = name.to_string();
        let options = options.clone();
        Preparation::Pending(
            async move {
                let store = FsMessageStore::open(&root, &name).await?;
                Ok(StoreState::spawn(Arc::new(store), &options))
            }
            .boxed(),
        )
    }

    fn average_response_time(&self, options: &ChannelOptions) -> Duration {
        options.store.fallback_interval() * 2
    }
}

struct ReadCursor {
    last_id: u64,
    emitted: ObliviousSet<u64>,
}

struct Listener {
    handler: EnvelopeHandler,
    since_micros: u64,
}

struct StoreShared {
    store: Arc<dyn MessageStore>,
    uuid: String,
    ttl: Duration,
    interval: Duration,
    on_close: Option<Callback>,
    closed: AtomicBool,
    listener: Mutex<Option<Listener>>,
    // serializes reads so the cursor never moves backwards
    cursor: tokio::sync::Mutex<ReadCursor>,
}

impl StoreShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Emit every new record written by another state
    async fn read_new_messages(&self) -> Result<()> {
        if self.is_closed() || self.listener.lock().is_none() {
            return Ok(());
        }

        let mut cursor = self.cursor.lock().await;
        let records = self.store.read_after(cursor.last_id).await?;
        if let Some(highest) = records.iter().map(|r| r.id).max() {
            cursor.last_id = cursor.last_id.max(highest);
        }

        let since = self
            .listener
            .lock()
            .as_ref()
            .map(|l| l.since_micros)
            .unwrap_or(u64::MAX);
        let mut fresh: Vec<StoredMessage> = records
            .into_iter()
            .filter(|r| r.uuid != self.uuid)
            .filter(|r| !cursor.emitted.has(&r.id))
            .filter(|r| r.data.time >= since)
            .collect();
        fresh.sort_by_key(|r| r.time);

        for record in fresh {
            let handler = self.listener.lock().as_ref().map(|l| l.handler.clone());
            if let Some(handler) = handler {
                cursor.emitted.add(record.id);
                handler(record.data);
            }
        }
        Ok(())
    }

    async fn read_loop(self: Arc<Self>) {
        while !self.is_closed() {
            if !self.store.is_available().await {
                tracing::warn!("message store disappeared underneath state {}", self.uuid);
                self.closed.store(true, Ordering::Release);
                if let Some(on_close) = &self.on_close {
                    on_close.call();
                }
                break;
            }
            if let Err(err) = self.read_new_messages().await {
                tracing::error!("message store read failed: {}", err);
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

/// Per-channel persistent-store state
pub struct StoreState {
    shared: Arc<StoreShared>,
    writes: WriteChain,
}

impl StoreState {
    /// Start a state over `store`, including its polling read loop
    pub fn spawn(store: Arc<dyn MessageStore>, options: &ChannelOptions) -> Arc<dyn TransportState> {
        let ttl = options.store.ttl();
        let shared = Arc::new(StoreShared {
            store,
            uuid: uuid::Uuid::new_v4().to_string(),
            ttl,
            interval: options.store.fallback_interval(),
            on_close: options.store.on_close.clone(),
            closed: AtomicBool::new(false),
            listener: Mutex::new(None),
            cursor: tokio::sync::Mutex::new(ReadCursor {
                last_id: 0,
                emitted: ObliviousSet::new(ttl * 2),
            }),
        });
        tokio::spawn(shared.clone().read_loop());

        Arc::new(StoreState {
            shared,
            writes: WriteChain::new(),
        })
    }
}

impl TransportState for StoreState {
    fn post_message(&self, envelope: Envelope) -> BoxFuture<'static, Result<()>> {
        if self.shared.is_closed() {
            return futures::future::ready(Err(BroadcastError::transport_send(TYPE, "store closed")))
                .boxed();
        }

        let shared = self.shared.clone();
        self.writes.push(async move {
            shared.store.append(&shared.uuid, now_millis(), &envelope).await?;

            if fastrand::u8(..CLEANUP_ODDS) == 0 {
                let store = shared.store.clone();
                let cutoff = now_millis().saturating_sub(shared.ttl.as_millis() as u64);
                tokio::spawn(async move {
                    match store.remove_older_than(cutoff).await {
                        Ok(removed) if removed > 0 => {
                            tracing::debug!("removed {} expired store records", removed)
                        }
                        Ok(_) => {}
                        Err(err) => tracing::error!("store cleanup failed: {}", err),
                    }
                });
            }
            Ok(())
        })
    }

    fn on_message(&self, handler: Option<EnvelopeHandler>, since_micros: u64) {
        let armed = handler.is_some();
        *self.shared.listener.lock() = handler.map(|handler| Listener {
            handler,
            since_micros,
        });

        if armed {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(err) = shared.read_new_messages().await {
                    tracing::error!("message store read failed: {}", err);
                }
            });
        }
    }

    fn close(&self) -> BoxFuture<'static, Result<()>> {
        self.shared.closed.store(true, Ordering::Release);
        *self.shared.listener.lock() = None;
        futures::future::ready(Ok(())).boxed()
    }
}
