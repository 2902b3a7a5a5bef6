//! Channel configuration
//!
//! `ChannelOptions` is the resolved configuration every channel carries. Plain
//! settings are serde-friendly so they can be layered from files and the
//! environment; injected collaborators (custom transports, stores, relay clients,
//! callbacks) are skipped by serde and only set from code.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::time::Duration;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::transport::kv::KeyValueStore;
use crate::transport::relay::RelayClient;
use crate::transport::Transport;

// ----------------------------------------------------------------------------
// Defaults
// ----------------------------------------------------------------------------

/// Persistent-store record lifetime
pub const DEFAULT_STORE_TTL_MS: u64 = 45_000;
/// Persistent-store polling interval
pub const DEFAULT_STORE_FALLBACK_INTERVAL_MS: u64 = 150;
/// Shared-kv-store emitted-token memory
pub const DEFAULT_KV_REMOVE_TIMEOUT_MS: u64 = 60_000;
/// Relay emitted-token memory
pub const DEFAULT_RELAY_REMOVE_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_RELAY_API_URL: &str = "https://session.web3auth.io/v2";
pub const DEFAULT_RELAY_SOCKET_URL: &str = "https://session.web3auth.io";

// ----------------------------------------------------------------------------
// Callbacks
// ----------------------------------------------------------------------------

/// A shareable no-argument callback
#[derive(Clone)]
pub struct Callback(Arc<dyn Fn() + Send + Sync>);

impl Callback {
    pub fn new<F: Fn() + Send + Sync + 'static>(f: F) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self) {
        (self.0)()
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback")
    }
}

// ----------------------------------------------------------------------------
// Persistent Store Options
// ----------------------------------------------------------------------------

/// Options for the persistent-store transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Records older than this are deleted
    pub ttl_ms: u64,
    /// Polling interval of the read loop
    pub fallback_interval_ms: u64,
    /// Root directory of the store; a per-channel directory is created below it
    pub directory: Option<PathBuf>,
    /// Fired when the store disappears underneath an open channel
    #[serde(skip)]
    pub on_close: Option<Callback>,
}

impl StoreOptions {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn fallback_interval(&self) -> Duration {
        Duration::from_millis(self.fallback_interval_ms)
    }

    /// Root directory, defaulting to `<tmp>/bridgecast`
    pub fn root(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("bridgecast"))
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            ttl_ms: DEFAULT_STORE_TTL_MS,
            fallback_interval_ms: DEFAULT_STORE_FALLBACK_INTERVAL_MS,
            directory: None,
            on_close: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Shared KV Store Options
// ----------------------------------------------------------------------------

/// Options for the shared-kv-store transport
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvOptions {
    /// How long an emitted token is remembered
    pub remove_timeout_ms: u64,
    /// Store to use instead of the process-wide one
    #[serde(skip)]
    pub store: Option<Arc<dyn KeyValueStore>>,
}

impl KvOptions {
    pub fn remove_timeout(&self) -> Duration {
        Duration::from_millis(self.remove_timeout_ms)
    }
}

impl Default for KvOptions {
    fn default() -> Self {
        Self {
            remove_timeout_ms: DEFAULT_KV_REMOVE_TIMEOUT_MS,
            store: None,
        }
    }
}

impl fmt::Debug for KvOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvOptions")
            .field("remove_timeout_ms", &self.remove_timeout_ms)
            .field("store", &self.store.as_ref().map(|_| "injected"))
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Relay Options
// ----------------------------------------------------------------------------

/// Options for the network-relay transport
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayOptions {
    /// Publish endpoint
    pub api_url: String,
    /// Push-notification endpoint
    pub socket_url: String,
    /// How long an emitted token is remembered
    pub remove_timeout_ms: u64,
    /// Relay-side retention hint forwarded with each publish
    pub timeout_ms: Option<u64>,
    /// Client to use instead of the process-wide connection
    #[serde(skip)]
    pub client: Option<Arc<dyn RelayClient>>,
}

impl RelayOptions {
    pub fn remove_timeout(&self) -> Duration {
        Duration::from_millis(self.remove_timeout_ms)
    }
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_RELAY_API_URL.into(),
            socket_url: DEFAULT_RELAY_SOCKET_URL.into(),
            remove_timeout_ms: DEFAULT_RELAY_REMOVE_TIMEOUT_MS,
            timeout_ms: None,
            client: None,
        }
    }
}

impl fmt::Debug for RelayOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayOptions")
            .field("api_url", &self.api_url)
            .field("socket_url", &self.socket_url)
            .field("remove_timeout_ms", &self.remove_timeout_ms)
            .field("timeout_ms", &self.timeout_ms)
            .field("client", &self.client.as_ref().map(|_| "injected"))
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Channel Options
// ----------------------------------------------------------------------------

/// Resolved configuration of a channel
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    /// Force a transport by tag, or `"simulate"`
    #[serde(rename = "type")]
    pub transport_type: Option<String>,
    /// Extra transports with the highest selection precedence
    #[serde(skip)]
    pub methods: Vec<Arc<dyn Transport>>,
    /// `false` removes the persistent-store transport from auto-selection
    pub web_worker_support: bool,
    /// Artificial delay before transport preparation completes
    pub prepare_delay_ms: Option<u64>,
    /// Adaptive channel: fail the first N attempts of every post
    pub post_message_fail_until_attempt: Option<usize>,
    pub store: StoreOptions,
    pub kv: KvOptions,
    pub relay: RelayOptions,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            transport_type: None,
            methods: Vec::new(),
            web_worker_support: true,
            prepare_delay_ms: None,
            post_message_fail_until_attempt: None,
            store: StoreOptions::default(),
            kv: KvOptions::default(),
            relay: RelayOptions::default(),
        }
    }
}

impl fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let methods: Vec<&str> = self.methods.iter().map(|m| m.transport_type()).collect();
        f.debug_struct("ChannelOptions")
            .field("transport_type", &self.transport_type)
            .field("methods", &methods)
            .field("web_worker_support", &self.web_worker_support)
            .field("prepare_delay_ms", &self.prepare_delay_ms)
            .field(
                "post_message_fail_until_attempt",
                &self.post_message_fail_until_attempt,
            )
            .field("store", &self.store)
            .field("kv", &self.kv)
            .field("relay", &self.relay)
            .finish()
    }
}

impl ChannelOptions {
    /// Create options with all defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Force a specific transport
    pub fn with_type<T: Into<String>>(mut self, transport_type: T) -> Self {
        self.transport_type = Some(transport_type.into());
        self
    }

    /// Add caller-supplied transports (highest selection precedence)
    pub fn with_methods(mut self, methods: Vec<Arc<dyn Transport>>) -> Self {
        self.methods = methods;
        self
    }

    pub fn with_web_worker_support(mut self, enabled: bool) -> Self {
        self.web_worker_support = enabled;
        self
    }

    pub fn with_prepare_delay(mut self, delay: Duration) -> Self {
        self.prepare_delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn with_fail_until_attempt(mut self, attempts: usize) -> Self {
        self.post_message_fail_until_attempt = Some(attempts);
        self
    }

    pub fn with_store_directory<P: Into<PathBuf>>(mut self, directory: P) -> Self {
        self.store.directory = Some(directory.into());
        self
    }

    pub fn prepare_delay(&self) -> Option<Duration> {
        self.prepare_delay_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Replace unset (zero) values with their defaults
    pub fn with_defaults(mut self) -> Self {
        if self.store.ttl_ms == 0 {
            self.store.ttl_ms = DEFAULT_STORE_TTL_MS;
        }
        if self.store.fallback_interval_ms == 0 {
            self.store.fallback_interval_ms = DEFAULT_STORE_FALLBACK_INTERVAL_MS;
        }
        if self.kv.remove_timeout_ms == 0 {
            self.kv.remove_timeout_ms = DEFAULT_KV_REMOVE_TIMEOUT_MS;
        }
        if self.relay.api_url.is_empty() {
            self.relay.api_url = DEFAULT_RELAY_API_URL.into();
        }
        if self.relay.socket_url.is_empty() {
            self.relay.socket_url = DEFAULT_RELAY_SOCKET_URL.into();
        }
        if self.relay.remove_timeout_ms == 0 {
            self.relay.remove_timeout_ms = DEFAULT_RELAY_REMOVE_TIMEOUT_MS;
        }
        if self.transport_type.as_deref() == Some("") {
            self.transport_type = None;
        }
        self
    }
}

// ----------------------------------------------------------------------------
// Process-wide Enforcement
// ----------------------------------------------------------------------------

static ENFORCED_OPTIONS: RwLock<Option<ChannelOptions>> = parking_lot::const_rwlock(None);

/// Force every subsequently constructed channel to use `options`, ignoring the
/// caller-supplied ones. `None` restores per-instance configuration.
pub fn enforce_options(options: Option<ChannelOptions>) {
    *ENFORCED_OPTIONS.write() = options;
}

/// The currently enforced options, if any
pub fn enforced_options() -> Option<ChannelOptions> {
    ENFORCED_OPTIONS.read().clone()
}

/// Options a new channel will actually use
pub fn resolve_options(options: Option<ChannelOptions>) -> ChannelOptions {
    enforced_options()
        .or(options)
        .unwrap_or_default()
        .with_defaults()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ChannelOptions::default();
        assert!(options.web_worker_support);
        assert_eq!(options.store.ttl(), Duration::from_secs(45));
        assert_eq!(options.store.fallback_interval(), Duration::from_millis(150));
        assert_eq!(options.kv.remove_timeout(), Duration::from_secs(60));
        assert_eq!(options.relay.remove_timeout(), Duration::from_secs(300));
        assert!(options.prepare_delay().is_none());
    }

    #[test]
    fn test_zero_values_are_filled() {
        let mut options = ChannelOptions::default();
        options.store.ttl_ms = 0;
        options.store.fallback_interval_ms = 0;
        options.relay.api_url.clear();
        options.transport_type = Some(String::new());

        let options = options.with_defaults();
        assert_eq!(options.store.ttl_ms, DEFAULT_STORE_TTL_MS);
        assert_eq!(options.store.fallback_interval_ms, DEFAULT_STORE_FALLBACK_INTERVAL_MS);
        assert_eq!(options.relay.api_url, DEFAULT_RELAY_API_URL);
        assert!(options.transport_type.is_none());
    }

    #[test]
    fn test_partial_deserialization_keeps_defaults() {
        let options: ChannelOptions = serde_json::from_str(
            r#"{"type": "simulate", "web_worker_support": false, "store": {"ttl_ms": 1000}}"#,
        )
        .unwrap();
        assert_eq!(options.transport_type.as_deref(), Some("simulate"));
        assert!(!options.web_worker_support);
        assert_eq!(options.store.ttl_ms, 1000);
        assert_eq!(
            options.store.fallback_interval_ms,
            DEFAULT_STORE_FALLBACK_INTERVAL_MS
        );
    }

    #[test]
    fn test_builder_helpers() {
        let options = ChannelOptions::new()
            .with_type("native")
            .with_web_worker_support(false)
            .with_prepare_delay(Duration::from_millis(30))
            .with_fail_until_attempt(2);
        assert_eq!(options.transport_type.as_deref(), Some("native"));
        assert!(!options.web_worker_support);
        assert_eq!(options.prepare_delay(), Some(Duration::from_millis(30)));
        assert_eq!(options.post_message_fail_until_attempt, Some(2));
    }
}
