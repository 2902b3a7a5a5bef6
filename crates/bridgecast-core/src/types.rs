//! Core types shared by channels and transports
//!
//! This module defines the message envelope, event contexts, channel identity
//! and the process-local microsecond clock every transport stamps with.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Channel Identifier
// ----------------------------------------------------------------------------

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(0);

/// Process-wide channel identifier, monotonically increasing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocate the next identifier
    pub(crate) fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Event Context
// ----------------------------------------------------------------------------

/// Partition of listeners and envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventContext {
    /// User-visible messages
    Message,
    /// Library-internal traffic
    Internal,
}

// ----------------------------------------------------------------------------
// Message Envelope
// ----------------------------------------------------------------------------

/// Timestamped, typed wrapper around a user payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender-side `micro_seconds()` at post time
    pub time: u64,
    /// Which listener partition receives this envelope
    #[serde(rename = "type")]
    pub context: EventContext,
    /// User payload
    pub data: serde_json::Value,
}

impl Envelope {
    /// Wrap a payload stamped with the given time
    pub fn new(time: u64, context: EventContext, data: serde_json::Value) -> Self {
        Self {
            time,
            context,
            data,
        }
    }
}

// ----------------------------------------------------------------------------
// Clock
// ----------------------------------------------------------------------------

static LAST_MICROS: AtomicU64 = AtomicU64::new(0);

/// Wall-clock milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current time in pseudo-microseconds.
///
/// Seeded from wall-clock milliseconds × 1000 and bumped to `last + 1` whenever
/// the computed value would not move forward, so values are strictly increasing
/// within the process. No ordering holds across processes.
pub fn micro_seconds() -> u64 {
    let candidate = now_millis().saturating_mul(1000);
    let previous = LAST_MICROS
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
            Some(if candidate <= last { last + 1 } else { candidate })
        })
        .unwrap_or_else(|last| last);
    if candidate <= previous {
        previous + 1
    } else {
        candidate
    }
}
