//! Transport selection
//!
//! Candidates are the caller-supplied transports followed by the built-ins in
//! speed order. An explicit type picks by tag (`"simulate"` always resolves to
//! the simulated transport); otherwise the first candidate whose capability
//! probe passes wins.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::ChannelOptions;
use crate::transport::simulate::{self, SimulateTransport};
use crate::transport::{builtin_transports, store, Transport};
use crate::{BroadcastError, Result};

/// Pick the transport a channel constructed with `options` binds to
pub fn choose_transport(options: &ChannelOptions) -> Result<Arc<dyn Transport>> {
    let mut candidates = options.methods.clone();
    candidates.extend(builtin_transports());
    choose_from(candidates, options)
}

/// Selection over an explicit candidate list, in precedence order
pub fn choose_from(
    mut candidates: Vec<Arc<dyn Transport>>,
    options: &ChannelOptions,
) -> Result<Arc<dyn Transport>> {
    if let Some(wanted) = options.transport_type.as_deref() {
        if wanted == simulate::TYPE {
            return Ok(Arc::new(SimulateTransport));
        }
        return candidates
            .into_iter()
            .find(|candidate| candidate.transport_type() == wanted)
            .ok_or_else(|| BroadcastError::config_error(format!("method-type {} not found", wanted)));
    }

    let known: Vec<String> = candidates
        .iter()
        .map(|candidate| candidate.transport_type().to_string())
        .collect();

    if !options.web_worker_support {
        candidates.retain(|candidate| candidate.transport_type() != store::TYPE);
    }

    candidates
        .into_iter()
        .find(|candidate| candidate.can_be_used(options))
        .ok_or_else(|| {
            BroadcastError::config_error(format!("No useable method found in {:?}", known))
        })
}
