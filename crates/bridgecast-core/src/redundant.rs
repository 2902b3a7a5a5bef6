//! Redundant broadcast channel
//!
//! Every message is wrapped with a nonce and sent over all transports at once.
//! Receivers keep a bounded window of processed nonces so each message reaches
//! the listeners exactly once, whichever transport delivered it first.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adaptive::{close_all, fan_out, method_priority, open_all};
use crate::channel::listeners::{ListenerId, MessageCallback, Subscribers};
use crate::channel::BroadcastChannel;
use crate::config::ChannelOptions;
use crate::dedup::{NonceWindow, DEFAULT_NONCE_CAPACITY};
use crate::transport::{kv, native, relay};
use crate::types::{now_millis, EventContext};
use crate::{BroadcastError, Result};

/// Payload as it travels over every transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrappedMessage {
    pub nonce: String,
    pub message: Value,
}

/// Built-in transports a redundant channel sends over; the store is left out
pub(crate) const REDUNDANT_BUILTINS: [&str; 3] = [native::TYPE, kv::TYPE, relay::TYPE];

/// Channel that sends every message over all transports
pub struct RedundantAdaptiveBroadcastChannel {
    name: String,
    channels: Mutex<Vec<(String, Arc<BroadcastChannel>)>>,
    subscribers: Arc<Mutex<Subscribers>>,
    nonce_counter: AtomicU64,
    closed: AtomicBool,
}

impl RedundantAdaptiveBroadcastChannel {
    pub fn new(name: &str, options: Option<ChannelOptions>) -> Result<Self> {
        let options = options.unwrap_or_default();
        let priority = method_priority(&options, &REDUNDANT_BUILTINS);
        let subscribers: Arc<Mutex<Subscribers>> = Arc::default();
        let processed = Arc::new(Mutex::new(NonceWindow::new(DEFAULT_NONCE_CAPACITY)));
        let handler = dedup_handler(name.to_string(), processed, fan_out(subscribers.clone()));
        let channels = open_all(name, &options, &priority, handler)?;

        Ok(Self {
            name: name.to_string(),
            channels: Mutex::new(channels),
            subscribers,
            nonce_counter: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn channel_types(&self) -> Vec<String> {
        self.channels.lock().iter().map(|(tag, _)| tag.clone()).collect()
    }

    /// Next `{millis}-{counter}` key, counting from 0 per instance
    ///
    /// The key is unique per sender only. Two senders posting within the same
    /// millisecond with equal counters produce the same key, and a receiver
    /// drops the later arrival as a duplicate.
    fn next_nonce(&self) -> String {
        let counter = self.nonce_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", now_millis(), counter)
    }

    /// Send over every transport concurrently
    ///
    /// Succeeds with the original message if at least one transport accepted
    /// it; per-transport failures are only logged.
    pub async fn post_message(&self, message: Value) -> Result<Value> {
        if self.is_closed() {
            return Err(BroadcastError::closed_channel(&self.name, &message));
        }

        let wrapped = serde_json::to_value(WrappedMessage {
            nonce: self.next_nonce(),
            message: message.clone(),
        })?;

        let channels = self.channels.lock().clone();
        let sends = channels.iter().map(|(tag, channel)| {
            let send = channel.post_message(wrapped.clone());
            async move { (tag.as_str(), send.await) }
        });
        let results = futures::future::join_all(sends).await;

        let mut delivered = 0;
        let mut last_error = None;
        for (tag, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::warn!("Failed to send message via {}: {}", tag, err);
                    last_error = Some(err);
                }
            }
        }

        if delivered > 0 {
            return Ok(message);
        }
        Err(BroadcastError::delivery_exhausted(
            channels.len(),
            last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no transport available".to_string()),
        ))
    }

    pub fn set_onmessage(&self, callback: Option<MessageCallback>) {
        self.subscribers.lock().set_primary(callback);
    }

    pub fn add_event_listener(&self, _context: EventContext, callback: MessageCallback) -> ListenerId {
        self.subscribers.lock().add(callback)
    }

    pub fn remove_event_listener(&self, _context: EventContext, id: ListenerId) -> bool {
        self.subscribers.lock().remove(id)
    }

    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.subscribers.lock().clear_primary();
        let channels = core::mem::take(&mut *self.channels.lock());
        let result = close_all(channels).await;
        self.subscribers.lock().clear();
        tracing::debug!("closed redundant channel {}", self.name);
        result
    }
}

/// Unwrap inbound payloads and pass each nonce through once
fn dedup_handler(
    name: String,
    processed: Arc<Mutex<NonceWindow>>,
    deliver: MessageCallback,
) -> MessageCallback {
    Arc::new(move |payload: &Value| {
        let Ok(wrapped) = serde_json::from_value::<WrappedMessage>(payload.clone()) else {
            return;
        };
        if wrapped.nonce.is_empty() {
            return;
        }
        if !processed.lock().insert(&wrapped.nonce) {
            tracing::debug!("{}: duplicate message {} dropped", name, wrapped.nonce);
            return;
        }
        deliver(&wrapped.message);
    })
}
