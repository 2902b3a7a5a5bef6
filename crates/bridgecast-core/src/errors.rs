//! Error types for bridgecast
//!
//! A single `BroadcastError` covers every failure a channel can surface. It is
//! `Clone` because one transport preparation result is shared by every waiter
//! (send queue, listener arming, close).

use alloc::string::{String, ToString};

// ----------------------------------------------------------------------------
// Core Error Type
// ----------------------------------------------------------------------------

/// Errors surfaced by channels and transports
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BroadcastError {
    /// No transport satisfies the requested or auto-selected criteria
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// An operation was attempted after `close()`
    #[error("Cannot post message after channel {channel} has closed {payload}")]
    ClosedChannel { channel: String, payload: String },

    /// A single transport failed to deliver
    #[error("Transport {transport} failed to send: {reason}")]
    TransportSend { transport: String, reason: String },

    /// A transport could not be constructed in this runtime
    #[error("Transport {transport} is not available: {reason}")]
    TransportUnavailable { transport: String, reason: String },

    /// Every fallback attempt or every concurrent transport failed
    #[error("Failed to send message after {attempts} attempts: {reason}")]
    DeliveryExhausted { attempts: usize, reason: String },

    /// Payload or record (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BroadcastError {
    fn from(err: serde_json::Error) -> Self {
        BroadcastError::Serialization(err.to_string())
    }
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl BroadcastError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        BroadcastError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a closed-channel error, serializing the offending payload
    pub fn closed_channel<C: Into<String>>(channel: C, payload: &serde_json::Value) -> Self {
        BroadcastError::ClosedChannel {
            channel: channel.into(),
            payload: payload.to_string(),
        }
    }

    /// Create a transport send error
    pub fn transport_send<T: Into<String>, R: Into<String>>(transport: T, reason: R) -> Self {
        BroadcastError::TransportSend {
            transport: transport.into(),
            reason: reason.into(),
        }
    }

    /// Create a transport unavailable error
    pub fn transport_unavailable<T: Into<String>, R: Into<String>>(transport: T, reason: R) -> Self {
        BroadcastError::TransportUnavailable {
            transport: transport.into(),
            reason: reason.into(),
        }
    }

    /// Create a delivery exhausted error
    pub fn delivery_exhausted<R: Into<String>>(attempts: usize, reason: R) -> Self {
        BroadcastError::DeliveryExhausted {
            attempts,
            reason: reason.into(),
        }
    }

    /// Whether this error means the channel itself is closed (terminal, never retried)
    pub fn is_closed(&self) -> bool {
        matches!(self, BroadcastError::ClosedChannel { .. })
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, BroadcastError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_closed_channel_carries_payload() {
        let err = BroadcastError::closed_channel("chat", &json!({"text": "hi"}));
        assert!(err.is_closed());
        let rendered = err.to_string();
        assert!(rendered.contains("closed"));
        assert!(rendered.contains(r#"{"text":"hi"}"#));
    }

    #[test]
    fn test_only_closed_is_terminal() {
        assert!(!BroadcastError::transport_send("native", "boom").is_closed());
        assert!(!BroadcastError::delivery_exhausted(4, "all failed").is_closed());
        assert!(!BroadcastError::config_error("none").is_closed());
    }
}
