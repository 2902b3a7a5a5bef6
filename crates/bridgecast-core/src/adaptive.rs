//! Adaptive broadcast channel
//!
//! Opens one [`BroadcastChannel`] per transport and listens on all of them, but
//! sends over a single current transport. A failed send moves the cursor to the
//! next transport and retries; the cursor stays where the last send landed.
//! Receivers need no coordination because they hear every transport.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use parking_lot::Mutex;
use serde_json::Value;

use crate::channel::listeners::{ListenerId, MessageCallback, Subscribers};
use crate::channel::BroadcastChannel;
use crate::config::ChannelOptions;
use crate::transport::{builtin_types, simulate};
use crate::types::EventContext;
use crate::{BroadcastError, Result};

/// Attempts of one `post_message` call
pub const DEFAULT_MAX_RETRIES: usize = 4;

// ----------------------------------------------------------------------------
// Shared Construction
// ----------------------------------------------------------------------------

/// Custom transports first, then `builtins`; only simulate when forced
pub(crate) fn method_priority(options: &ChannelOptions, builtins: &[&str]) -> Vec<String> {
    if options.transport_type.as_deref() == Some(simulate::TYPE) {
        return vec![simulate::TYPE.to_string()];
    }
    options
        .methods
        .iter()
        .map(|method| method.transport_type().to_string())
        .chain(builtins.iter().map(|tag| tag.to_string()))
        .collect()
}

/// Open one channel per tag in `priority`, skipping the ones that fail
pub(crate) fn open_all(
    name: &str,
    options: &ChannelOptions,
    priority: &[String],
    handler: MessageCallback,
) -> Result<Vec<(String, Arc<BroadcastChannel>)>> {
    let mut channels = Vec::new();
    for method in priority {
        match BroadcastChannel::new(name, Some(options.clone().with_type(method.as_str()))) {
            Ok(channel) => {
                channel.set_onmessage(Some(handler.clone()));
                channels.push((method.clone(), Arc::new(channel)));
            }
            Err(err) => tracing::warn!("Failed to initialize {} method: {}", method, err),
        }
    }
    if channels.is_empty() {
        return Err(BroadcastError::config_error(
            "Failed to initialize any communication method",
        ));
    }
    Ok(channels)
}

/// Close every channel concurrently; the first failure is reported after all finished
pub(crate) async fn close_all(channels: Vec<(String, Arc<BroadcastChannel>)>) -> Result<()> {
    let results = futures::future::join_all(channels.iter().map(|(_, channel)| channel.close())).await;
    results.into_iter().collect()
}

pub(crate) fn fan_out(subscribers: Arc<Mutex<Subscribers>>) -> MessageCallback {
    Arc::new(move |payload: &Value| {
        let callbacks = subscribers.lock().snapshot();
        for callback in callbacks {
            callback(payload);
        }
    })
}

// ----------------------------------------------------------------------------
// Adaptive Channel
// ----------------------------------------------------------------------------

/// Channel that sends over one transport at a time with ordered fallback
pub struct AdaptiveBroadcastChannel {
    name: String,
    options: ChannelOptions,
    method_priority: Vec<String>,
    current_method_index: AtomicUsize,
    channels: Mutex<Vec<(String, Arc<BroadcastChannel>)>>,
    subscribers: Arc<Mutex<Subscribers>>,
    closed: AtomicBool,
}

impl AdaptiveBroadcastChannel {
    /// Open `name` on every transport that can be constructed. Fails only if
    /// none can.
    pub fn new(name: &str, options: Option<ChannelOptions>) -> Result<Self> {
        let options = options.unwrap_or_default();
        let method_priority = method_priority(&options, &builtin_types());
        let subscribers: Arc<Mutex<Subscribers>> = Arc::default();
        let channels = open_all(name, &options, &method_priority, fan_out(subscribers.clone()))?;

        Ok(Self {
            name: name.to_string(),
            options,
            method_priority,
            current_method_index: AtomicUsize::new(0),
            channels: Mutex::new(channels),
            subscribers,
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Transport tags, fastest first
    pub fn method_priority(&self) -> &[String] {
        &self.method_priority
    }

    pub fn current_method_index(&self) -> usize {
        self.current_method_index.load(Ordering::Acquire)
    }

    pub fn current_method(&self) -> &str {
        &self.method_priority[self.current_method_index()]
    }

    /// Tags of the transports that were constructed, in priority order
    pub fn channel_types(&self) -> Vec<String> {
        self.channels.lock().iter().map(|(tag, _)| tag.clone()).collect()
    }

    fn channel(&self, method: &str) -> Option<Arc<BroadcastChannel>> {
        self.channels
            .lock()
            .iter()
            .find(|(tag, _)| tag == method)
            .map(|(_, channel)| channel.clone())
    }

    fn advance(&self, from: usize) -> usize {
        let next = (from + 1) % self.method_priority.len();
        self.current_method_index.store(next, Ordering::Release);
        next
    }

    /// Send with [`DEFAULT_MAX_RETRIES`] attempts
    pub async fn post_message(&self, message: Value) -> Result<()> {
        self.post_message_with_retries(message, DEFAULT_MAX_RETRIES).await
    }

    pub async fn post_message_with_retries(&self, message: Value, max_retries: usize) -> Result<()> {
        if self.is_closed() {
            return Err(BroadcastError::closed_channel(&self.name, &message));
        }

        let fail_until = self.options.post_message_fail_until_attempt.unwrap_or(0);
        let mut last_error: Option<BroadcastError> = None;

        for attempt in 0..max_retries {
            let index = self.current_method_index();
            let method = &self.method_priority[index];
            let Some(channel) = self.channel(method) else {
                self.advance(index);
                continue;
            };

            let result = if attempt < fail_until {
                Err(BroadcastError::transport_send(method.as_str(), "Attempt fail manually"))
            } else {
                channel.post_message(message.clone()).await
            };

            match result {
                Ok(()) => return Ok(()),
                Err(err) if err.is_closed() => return Err(err),
                Err(err) => {
                    tracing::warn!("Attempt {} failed on {}: {}", attempt + 1, method, err);
                    let next = self.advance(index);
                    tracing::warn!("Switched to method: {}", self.method_priority[next]);
                    last_error = Some(err);
                }
            }
        }

        Err(BroadcastError::delivery_exhausted(
            max_retries,
            last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no constructed transport reached".to_string()),
        ))
    }

    pub fn set_onmessage(&self, callback: Option<MessageCallback>) {
        self.subscribers.lock().set_primary(callback);
    }

    /// The context is accepted for parity with [`BroadcastChannel`]; every
    /// listener sees every message.
    pub fn add_event_listener(&self, _context: EventContext, callback: MessageCallback) -> ListenerId {
        self.subscribers.lock().add(callback)
    }

    pub fn remove_event_listener(&self, _context: EventContext, id: ListenerId) -> bool {
        self.subscribers.lock().remove(id)
    }

    /// Close every underlying channel in parallel
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.subscribers.lock().clear_primary();
        let channels = core::mem::take(&mut *self.channels.lock());
        let result = close_all(channels).await;
        self.subscribers.lock().clear();
        tracing::debug!("closed adaptive channel {}", self.name);
        result
    }
}
