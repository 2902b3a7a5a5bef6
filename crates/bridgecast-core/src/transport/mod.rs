//! Transport abstraction for bridgecast
//!
//! A transport is a pluggable delivery mechanism. [`Transport`] is the static
//! descriptor (identity, capability probe, clock, factory) and
//! [`TransportState`] is the per-channel state a descriptor creates.
//!
//! Built-in transports, in selection order (fastest first):
//! - [`native`]: process-local named fan-out hub
//! - [`store`]: persistent message store with a polling read loop
//! - [`kv`]: shared key-value store with change notifications
//! - [`relay`]: relay service with push notifications, encrypted and signed
//!
//! [`simulate`] is never auto-selected; it exists for deterministic tests.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::time::Duration;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::config::ChannelOptions;
use crate::types::{micro_seconds, Envelope};
use crate::{BroadcastError, Result};

pub mod kv;
pub mod native;
pub mod relay;
pub mod simulate;
pub mod store;

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// Callback a transport invokes with every inbound envelope
pub type EnvelopeHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Result of [`Transport::create`]: the state may be ready immediately or
/// still being prepared.
pub enum Preparation {
    Ready(Arc<dyn TransportState>),
    Pending(BoxFuture<'static, Result<Arc<dyn TransportState>>>),
}

impl Preparation {
    /// Wrap a synchronously created state, or its construction error
    pub fn from_result(result: Result<Arc<dyn TransportState>>) -> Self {
        match result {
            Ok(state) => Preparation::Ready(state),
            Err(err) => Preparation::Pending(futures::future::ready(Err(err)).boxed()),
        }
    }
}

/// Static descriptor of a delivery mechanism
pub trait Transport: Send + Sync + 'static {
    /// Unique tag across the registry
    fn transport_type(&self) -> &str;

    /// Lightweight capability probe; may touch the underlying platform feature
    fn can_be_used(&self, options: &ChannelOptions) -> bool;

    /// Monotonic, strictly increasing within the process
    fn micro_seconds(&self) -> u64 {
        micro_seconds()
    }

    /// Create the per-channel state for `name`
    fn create(&self, name: &str, options: &ChannelOptions) -> Preparation;

    /// Advisory latency, documentation only
    fn average_response_time(&self, options: &ChannelOptions) -> Duration;
}

/// Per-channel state owned by a transport
///
/// The synchronous part of `post_message` (the call itself) fixes the write
/// order: transports that serialize writes do so in call order.
pub trait TransportState: Send + Sync {
    /// Deliver `envelope` to other channels; rejection means delivery failure
    fn post_message(&self, envelope: Envelope) -> BoxFuture<'static, Result<()>>;

    /// Arm (`Some`) or disarm (`None`) inbound delivery
    fn on_message(&self, handler: Option<EnvelopeHandler>, since_micros: u64);

    /// Release the state
    fn close(&self) -> BoxFuture<'static, Result<()>>;
}

// ----------------------------------------------------------------------------
// Built-in Registry
// ----------------------------------------------------------------------------

/// Built-in transports in selection order: native, store, kv, relay
pub fn builtin_transports() -> Vec<Arc<dyn Transport>> {
    vec![
        Arc::new(native::NativeTransport),
        Arc::new(store::StoreTransport),
        Arc::new(kv::KvTransport),
        Arc::new(relay::RelayTransport),
    ]
}

/// Tags of the built-in transports in selection order
pub fn builtin_types() -> Vec<&'static str> {
    vec![native::TYPE, store::TYPE, kv::TYPE, relay::TYPE]
}

// ----------------------------------------------------------------------------
// Write Chain
// ----------------------------------------------------------------------------

type ChainLink = Shared<BoxFuture<'static, Result<()>>>;

/// Serializes writes in call order: each write starts after the previous one
/// settled, whatever its outcome.
pub struct WriteChain {
    last: Mutex<ChainLink>,
}

impl WriteChain {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(futures::future::ready(Ok(())).boxed().shared()),
        }
    }

    /// Queue `write` behind every previously queued write
    pub fn push<F>(&self, write: F) -> BoxFuture<'static, Result<()>>
    where
        F: core::future::Future<Output = Result<()>> + Send + 'static,
    {
        let mut last = self.last.lock();
        let previous = last.clone();
        let link: ChainLink = async move {
            let _ = previous.await;
            write.await
        }
        .boxed()
        .shared();
        *last = link.clone();
        link.boxed()
    }
}

impl Default for WriteChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a serialization failure of `transport` into a send error
pub(crate) fn send_error(transport: &str) -> impl Fn(serde_json::Error) -> BroadcastError + '_ {
    move |err| BroadcastError::transport_send(transport, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_builtin_order() {
        let types: Vec<String> = builtin_transports()
            .iter()
            .map(|t| t.transport_type().to_string())
            .collect();
        assert_eq!(types, vec!["native", "store", "kv", "relay"]);
        assert_eq!(builtin_types(), vec!["native", "store", "kv", "relay"]);
    }

    #[tokio::test]
    async fn test_write_chain_preserves_call_order() {
        let chain = WriteChain::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pending = Vec::new();

        for i in 0..20u64 {
            let log = log.clone();
            // later writes finish faster, but must still run after earlier ones
            let delay = Duration::from_millis(20 - i);
            pending.push(chain.push(async move {
                tokio::time::sleep(delay).await;
                log.lock().push(i);
                Ok(())
            }));
        }

        // poll in reverse to show that polling order does not matter
        let handles: Vec<_> = pending.into_iter().rev().map(tokio::spawn).collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*log.lock(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_write_chain_continues_after_failure() {
        let chain = WriteChain::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let first = chain.push(async { Err(BroadcastError::transport_send("store", "disk full")) });
        let ran_clone = ran.clone();
        let second = chain.push(async move {
            ran_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(first.await.is_err());
        assert!(second.await.is_ok());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
