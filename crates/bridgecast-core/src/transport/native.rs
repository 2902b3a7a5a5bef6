//! Process-local named fan-out
//!
//! Every state registers an inbox with a process-wide hub under its channel
//! name. A post pushes the envelope into the inbox of every other state with the
//! same name; a pump task per state drains its inbox into the armed handler.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use futures::future::{BoxFuture, FutureExt};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::OnceLock;
use tokio::sync::mpsc;

use super::{EnvelopeHandler, Preparation, Transport, TransportState};
use crate::config::ChannelOptions;
use crate::types::Envelope;
use crate::{BroadcastError, Result};

pub const TYPE: &str = "native";

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(0);

struct Endpoint {
    id: u64,
    inbox: mpsc::UnboundedSender<Envelope>,
}

/// Name-keyed registry of open native states
#[derive(Default)]
struct Hub {
    endpoints: Mutex<HashMap<String, Vec<Endpoint>>>,
}

impl Hub {
    fn global() -> &'static Hub {
        static HUB: OnceLock<Hub> = OnceLock::new();
        HUB.get_or_init(Hub::default)
    }

    fn join(&self, name: &str, id: u64, inbox: mpsc::UnboundedSender<Envelope>) {
        self.endpoints
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(Endpoint { id, inbox });
    }

    fn leave(&self, name: &str, id: u64) {
        let mut endpoints = self.endpoints.lock();
        if let Some(members) = endpoints.get_mut(name) {
            members.retain(|endpoint| endpoint.id != id);
            if members.is_empty() {
                endpoints.remove(name);
            }
        }
    }

    /// Push `envelope` to every member of `name` except `sender`
    fn fan_out(&self, name: &str, sender: u64, envelope: &Envelope) {
        let endpoints = self.endpoints.lock();
        if let Some(members) = endpoints.get(name) {
            for endpoint in members.iter().filter(|e| e.id != sender) {
                let _ = endpoint.inbox.send(envelope.clone());
            }
        }
    }
}

/// The native transport descriptor
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeTransport;

impl Transport for NativeTransport {
    fn transport_type(&self) -> &str {
        TYPE
    }

    fn can_be_used(&self, _options: &ChannelOptions) -> bool {
        true
    }

    fn create(&self, name: &str, _options: &ChannelOptions) -> Preparation {
        Preparation::Ready(NativeState::create(name))
    }

    fn average_response_time(&self, _options: &ChannelOptions) -> Duration {
        Duration::from_millis(150)
    }
}

/// Per-channel native state
pub struct NativeState {
    id: u64,
    name: String,
    handler: Arc<Mutex<Option<EnvelopeHandler>>>,
    closed: Mutex<bool>,
}

impl NativeState {
    fn create(name: &str) -> Arc<dyn TransportState> {
        let id = NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed);
        let (inbox, mut queue) = mpsc::unbounded_channel::<Envelope>();
        let handler: Arc<Mutex<Option<EnvelopeHandler>>> = Arc::new(Mutex::new(None));

        let slot = handler.clone();
        tokio::spawn(async move {
            while let Some(envelope) = queue.recv().await {
                let current = slot.lock().clone();
                if let Some(callback) = current {
                    callback(envelope);
                }
            }
        });

        Hub::global().join(name, id, inbox);
        tracing::debug!("native state {} joined {}", id, name);

        Arc::new(NativeState {
            id,
            name: name.to_string(),
            handler,
            closed: Mutex::new(false),
        })
    }
}

impl TransportState for NativeState {
    fn post_message(&self, envelope: Envelope) -> BoxFuture<'static, Result<()>> {
        let result = if *self.closed.lock() {
            Err(BroadcastError::transport_send(TYPE, "state closed"))
        } else {
            Hub::global().fan_out(&self.name, self.id, &envelope);
            Ok(())
        };
        futures::future::ready(result).boxed()
    }

    fn on_message(&self, handler: Option<EnvelopeHandler>, _since_micros: u64) {
        *self.handler.lock() = handler;
    }

    fn close(&self) -> BoxFuture<'static, Result<()>> {
        let mut closed = self.closed.lock();
        if !*closed {
            *closed = true;
            // dropping the hub entry drops the inbox sender and ends the pump task
            Hub::global().leave(&self.name, self.id);
            *self.handler.lock() = None;
        }
        futures::future::ready(Ok(())).boxed()
    }
}
