//! Bridgecast Core
//!
//! Named broadcast channels between independent execution contexts of one
//! machine or application. Each channel binds to one of several transports
//! ranked by speed: an in-process hub, a filesystem message store, a shared
//! key-value store, and an encrypted remote relay. Adaptive and redundant
//! wrappers layer fallback and multi-path delivery on top.

extern crate alloc;

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod adaptive;
pub mod channel;
pub mod config;
pub mod dedup;
pub mod errors;
pub mod redundant;
pub mod selector;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use adaptive::{AdaptiveBroadcastChannel, DEFAULT_MAX_RETRIES};
pub use channel::{
    is_open, open_channel_count, open_channels, BeforeCloseHook, BroadcastChannel, ListenerId,
    MessageCallback, OpenChannelInfo, PendingSend,
};
pub use config::{
    enforce_options, enforced_options, Callback, ChannelOptions, KvOptions, RelayOptions,
    StoreOptions,
};
pub use dedup::{NonceWindow, ObliviousSet};
pub use errors::{BroadcastError, Result};
pub use redundant::{RedundantAdaptiveBroadcastChannel, WrappedMessage};
pub use selector::choose_transport;
pub use transport::{Preparation, Transport, TransportState};
pub use types::{micro_seconds, ChannelId, Envelope, EventContext};
