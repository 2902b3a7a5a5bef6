//! In-process simulated transport with artificial delay
//!
//! Only used when chosen explicitly with type `"simulate"`. Every post is
//! delivered `SIMULATE_DELAY` later to each other simulated state with the same
//! name that has a handler and was created before the envelope was stamped.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::{EnvelopeHandler, Preparation, Transport, TransportState};
use crate::config::ChannelOptions;
use crate::types::{micro_seconds, Envelope};
use crate::{BroadcastError, Result};

pub const TYPE: &str = "simulate";

/// Delay between a post and its delivery
pub const SIMULATE_DELAY: Duration = Duration::from_millis(5);

static SIMULATE_CHANNELS: Mutex<Vec<Arc<SimulateEndpoint>>> = parking_lot::const_mutex(Vec::new());
static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(0);

/// The simulated transport descriptor
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulateTransport;

impl Transport for SimulateTransport {
    fn transport_type(&self) -> &str {
        TYPE
    }

    fn can_be_used(&self, _options: &ChannelOptions) -> bool {
        true
    }

    fn create(&self, name: &str, _options: &ChannelOptions) -> Preparation {
        Preparation::Ready(SimulateState::create(name))
    }

    fn average_response_time(&self, _options: &ChannelOptions) -> Duration {
        SIMULATE_DELAY
    }
}

/// Registration of one state in the process-wide set
struct SimulateEndpoint {
    id: u64,
    name: String,
    time: u64,
    callback: Mutex<Option<EnvelopeHandler>>,
}

struct Delivery {
    deliver_at: Instant,
    envelope: Envelope,
    done: oneshot::Sender<()>,
}

/// Per-channel simulated state
pub struct SimulateState {
    endpoint: Arc<SimulateEndpoint>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    closed: AtomicBool,
}

impl SimulateState {
    fn create(name: &str) -> Arc<dyn TransportState> {
        let endpoint = Arc::new(SimulateEndpoint {
            id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            time: micro_seconds(),
            callback: Mutex::new(None),
        });
        SIMULATE_CHANNELS.lock().push(endpoint.clone());

        let (deliveries, queue) = mpsc::unbounded_channel();
        tokio::spawn(Self::delivery_loop(endpoint.id, endpoint.name.clone(), queue));

        Arc::new(SimulateState {
            endpoint,
            deliveries,
            closed: AtomicBool::new(false),
        })
    }

    /// Deliveries of one sender are processed in post order
    async fn delivery_loop(sender_id: u64, name: String, mut queue: mpsc::UnboundedReceiver<Delivery>) {
        while let Some(delivery) = queue.recv().await {
            tokio::time::sleep_until(delivery.deliver_at).await;

            let receivers: Vec<Arc<SimulateEndpoint>> = SIMULATE_CHANNELS
                .lock()
                .iter()
                .filter(|endpoint| {
                    endpoint.name == name
                        && endpoint.id != sender_id
                        && endpoint.time < delivery.envelope.time
                })
                .cloned()
                .collect();

            for receiver in receivers {
                let callback = receiver.callback.lock().clone();
                if let Some(callback) = callback {
                    callback(delivery.envelope.clone());
                }
            }
            let _ = delivery.done.send(());
        }
    }
}

impl TransportState for SimulateState {
    fn post_message(&self, envelope: Envelope) -> BoxFuture<'static, Result<()>> {
        if self.closed.load(Ordering::Acquire) {
            return futures::future::ready(Err(BroadcastError::transport_send(TYPE, "state closed")))
                .boxed();
        }

        let (done, settled) = oneshot::channel();
        let delivery = Delivery {
            deliver_at: Instant::now() + SIMULATE_DELAY,
            envelope,
            done,
        };
        if self.deliveries.send(delivery).is_err() {
            return futures::future::ready(Err(BroadcastError::transport_send(
                TYPE,
                "delivery loop stopped",
            )))
            .boxed();
        }

        async move {
            settled
                .await
                .map_err(|_| BroadcastError::transport_send(TYPE, "delivery dropped"))
        }
        .boxed()
    }

    fn on_message(&self, handler: Option<EnvelopeHandler>, _since_micros: u64) {
        *self.endpoint.callback.lock() = handler;
    }

    fn close(&self) -> BoxFuture<'static, Result<()>> {
        self.closed.store(true, Ordering::Release);
        let id = self.endpoint.id;
        SIMULATE_CHANNELS.lock().retain(|endpoint| endpoint.id != id);
        futures::future::ready(Ok(())).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventContext;
    use serde_json::json;

    fn collecting_handler() -> (EnvelopeHandler, Arc<Mutex<Vec<Envelope>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let handler: EnvelopeHandler = Arc::new(move |envelope: Envelope| sink.lock().push(envelope));
        (handler, received)
    }

    fn ready(preparation: Preparation) -> Arc<dyn TransportState> {
        match preparation {
            Preparation::Ready(state) => state,
            Preparation::Pending(_) => panic!("simulate creates synchronously"),
        }
    }

    #[tokio::test]
    async fn test_delivers_to_same_name_only() {
        let name = format!("sim-{}", uuid::Uuid::new_v4());
        let sender = ready(SimulateTransport.create(&name, &ChannelOptions::default()));
        let receiver = ready(SimulateTransport.create(&name, &ChannelOptions::default()));
        let other = ready(SimulateTransport.create("elsewhere", &ChannelOptions::default()));

        let (handler, received) = collecting_handler();
        receiver.on_message(Some(handler), 0);
        let (own_handler, own_received) = collecting_handler();
        sender.on_message(Some(own_handler), 0);
        let (other_handler, other_received) = collecting_handler();
        other.on_message(Some(other_handler), 0);

        let envelope = Envelope::new(micro_seconds(), EventContext::Message, json!("foo"));
        sender.post_message(envelope.clone()).await.unwrap();

        assert_eq!(*received.lock(), vec![envelope]);
        assert!(own_received.lock().is_empty());
        assert!(other_received.lock().is_empty());

        for state in [sender, receiver, other] {
            state.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_post_after_close_fails() {
        let state = ready(SimulateTransport.create("closing", &ChannelOptions::default()));
        state.close().await.unwrap();
        let envelope = Envelope::new(micro_seconds(), EventContext::Message, json!(1));
        assert!(state.post_message(envelope).await.is_err());
    }
}
