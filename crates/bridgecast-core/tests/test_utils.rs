//! Shared helpers for the bridgecast integration tests
//!
//! Included with `mod test_utils;`, so not every helper is used by every test
//! binary.

#![allow(dead_code)]

use bridgecast_core::transport::EnvelopeHandler;
use bridgecast_core::{
    BroadcastError, ChannelOptions, Envelope, MessageCallback, Preparation, Result, Transport,
    TransportState,
};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ----------------------------------------------------------------------------
// Logging
// ----------------------------------------------------------------------------

/// Route library logs into the test output; repeated calls are ignored
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

// ----------------------------------------------------------------------------
// Names and Options
// ----------------------------------------------------------------------------

/// Fresh channel name so parallel tests never share a channel
pub fn unique_name(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

/// Fresh store root below the system temp directory, removed on drop
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn new() -> Self {
        Self {
            path: std::env::temp_dir().join(format!("bridgecast-it-{}", uuid::Uuid::new_v4())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        // the store may never have been opened
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Options forcing `transport`, with a fast store poll and a store root in `scratch`
pub fn options_for(transport: &str, scratch: &ScratchDir) -> ChannelOptions {
    let mut options = ChannelOptions::default()
        .with_type(transport)
        .with_store_directory(scratch.path());
    options.store.fallback_interval_ms = 20;
    options
}

// ----------------------------------------------------------------------------
// Collecting Listeners
// ----------------------------------------------------------------------------

/// Listener that records every payload it sees
#[derive(Clone, Default)]
pub struct Collector {
    seen: Arc<Mutex<Vec<Value>>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> MessageCallback {
        let seen = self.seen.clone();
        Arc::new(move |payload: &Value| seen.lock().push(payload.clone()))
    }

    pub fn messages(&self) -> Vec<Value> {
        self.seen.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapsed
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Give transports with asynchronous preparation time to arm their listeners
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

// ----------------------------------------------------------------------------
// Scripted Transport
// ----------------------------------------------------------------------------

/// Transport whose sends always fail; counts how often it was asked to send
pub struct FailingTransport {
    tag: &'static str,
    attempts: Arc<AtomicUsize>,
}

impl FailingTransport {
    pub fn new(tag: &'static str) -> Self {
        Self {
            tag,
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn attempts(&self) -> Arc<AtomicUsize> {
        self.attempts.clone()
    }
}

struct FailingState {
    tag: &'static str,
    attempts: Arc<AtomicUsize>,
}

impl Transport for FailingTransport {
    fn transport_type(&self) -> &str {
        self.tag
    }

    fn can_be_used(&self, _options: &ChannelOptions) -> bool {
        true
    }

    fn create(&self, _name: &str, _options: &ChannelOptions) -> Preparation {
        Preparation::Ready(Arc::new(FailingState {
            tag: self.tag,
            attempts: self.attempts.clone(),
        }))
    }

    fn average_response_time(&self, _options: &ChannelOptions) -> Duration {
        Duration::from_millis(1)
    }
}

impl TransportState for FailingState {
    fn post_message(&self, _envelope: Envelope) -> BoxFuture<'static, Result<()>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let tag = self.tag;
        async move { Err(BroadcastError::transport_send(tag, "scripted failure")) }.boxed()
    }

    fn on_message(&self, _handler: Option<EnvelopeHandler>, _since_micros: u64) {}

    fn close(&self) -> BoxFuture<'static, Result<()>> {
        futures::future::ready(Ok(())).boxed()
    }
}
