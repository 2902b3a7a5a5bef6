//! Broadcast channel bound to one transport
//!
//! A [`BroadcastChannel`] is created synchronously; transport preparation may
//! finish later and every send or listener arming waits for it. Sends go
//! through a per-channel queue so the transport sees them in call order, and
//! each one stays tracked until it settles so `close()` can drain them.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::task::{Context, Poll};
use futures::future::{BoxFuture, FutureExt, Shared};
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::config::{resolve_options, ChannelOptions};
use crate::selector::choose_transport;
use crate::transport::{relay, EnvelopeHandler, Preparation, Transport, TransportState};
use crate::types::{ChannelId, Envelope, EventContext};
use crate::{BroadcastError, Result};

pub mod listeners;
pub mod registry;

pub use listeners::{ListenerId, MessageCallback};
pub use registry::{is_open, open_channel_count, open_channels, OpenChannelInfo};

use listeners::ListenerSet;

type PreparedState = Shared<BoxFuture<'static, Result<Arc<dyn TransportState>>>>;
type TrackedSend = Shared<BoxFuture<'static, Result<()>>>;
type InFlight = Arc<Mutex<HashMap<u64, TrackedSend>>>;

/// Hook run by `close()` after in-flight sends drained
pub type BeforeCloseHook = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct QueuedSend {
    id: u64,
    envelope: Envelope,
    reply: oneshot::Sender<Result<()>>,
}

// ----------------------------------------------------------------------------
// Pending Send
// ----------------------------------------------------------------------------

/// Outcome of a post
///
/// The send is queued when `post_message` returns; awaiting only observes its
/// result.
#[must_use = "a send can fail; await it to observe the outcome"]
pub struct PendingSend {
    inner: PendingInner,
}

enum PendingInner {
    Rejected(Option<BroadcastError>),
    Tracked(TrackedSend),
}

impl PendingSend {
    fn rejected(err: BroadcastError) -> Self {
        Self {
            inner: PendingInner::Rejected(Some(err)),
        }
    }
}

impl Future for PendingSend {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            PendingInner::Rejected(err) => Poll::Ready(Err(err
                .take()
                .unwrap_or_else(|| BroadcastError::transport_send("channel", "send polled after completion")))),
            PendingInner::Tracked(send) => Pin::new(send).poll(cx),
        }
    }
}

// ----------------------------------------------------------------------------
// Broadcast Channel
// ----------------------------------------------------------------------------

/// Publish/subscribe endpoint for one channel name on one transport
pub struct BroadcastChannel {
    id: ChannelId,
    name: String,
    options: ChannelOptions,
    transport: Arc<dyn Transport>,
    prepared: PreparedState,
    closed: Arc<AtomicBool>,
    listeners: Arc<Mutex<ListenerSet>>,
    in_flight: InFlight,
    next_send: AtomicU64,
    before_close: Mutex<Vec<BeforeCloseHook>>,
    queue: Mutex<Option<mpsc::UnboundedSender<QueuedSend>>>,
}

impl BroadcastChannel {
    /// Open channel `name`. Must be called within a tokio runtime.
    ///
    /// `options` are ignored while process-wide options are enforced.
    pub fn new(name: &str, options: Option<ChannelOptions>) -> Result<Self> {
        let options = resolve_options(options);
        let transport = choose_transport(&options)?;
        let id = ChannelId::next();

        registry::register(OpenChannelInfo {
            id,
            name: name.to_string(),
            transport: transport.transport_type().to_string(),
        });

        let prepared = Self::prepare(transport.clone(), name, &options);
        let in_flight: InFlight = Arc::default();
        let (queue, sends) = mpsc::unbounded_channel();
        tokio::spawn(Self::drive_sends(prepared.clone(), sends, in_flight.clone()));

        tracing::debug!(
            "opened channel {} ({}) on {}",
            id,
            name,
            transport.transport_type()
        );

        Ok(Self {
            id,
            name: name.to_string(),
            options,
            transport,
            prepared,
            closed: Arc::new(AtomicBool::new(false)),
            listeners: Arc::default(),
            in_flight,
            next_send: AtomicU64::new(0),
            before_close: Mutex::new(Vec::new()),
            queue: Mutex::new(Some(queue)),
        })
    }

    fn prepare(transport: Arc<dyn Transport>, name: &str, options: &ChannelOptions) -> PreparedState {
        let preparation = match options.prepare_delay() {
            Some(delay) => {
                let name = name.to_string();
                let options = options.clone();
                Preparation::Pending(
                    async move {
                        tokio::time::sleep(delay).await;
                        match transport.create(&name, &options) {
                            Preparation::Ready(state) => Ok(state),
                            Preparation::Pending(pending) => pending.await,
                        }
                    }
                    .boxed(),
                )
            }
            None => transport.create(name, options),
        };

        match preparation {
            Preparation::Ready(state) => {
                let prepared = futures::future::ready(Ok(state)).boxed().shared();
                // resolve now so `peek` sees the state without a poll from a task
                let _ = prepared.clone().now_or_never();
                prepared
            }
            Preparation::Pending(pending) => {
                let prepared = pending.shared();
                let driver = prepared.clone();
                tokio::spawn(async move {
                    if let Err(err) = driver.await {
                        tracing::error!("transport preparation failed: {}", err);
                    }
                });
                prepared
            }
        }
    }

    /// Hands queued sends to the transport in order, once it is prepared
    async fn drive_sends(
        prepared: PreparedState,
        mut sends: mpsc::UnboundedReceiver<QueuedSend>,
        in_flight: InFlight,
    ) {
        while let Some(QueuedSend { id, envelope, reply }) = sends.recv().await {
            let write = match prepared.clone().await {
                Ok(state) => state.post_message(envelope),
                Err(err) => futures::future::ready(Err(err)).boxed(),
            };
            let in_flight = in_flight.clone();
            tokio::spawn(async move {
                let result = write.await;
                in_flight.lock().remove(&id);
                let _ = reply.send(result);
            });
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tag of the bound transport
    pub fn transport_type(&self) -> &str {
        self.transport.transport_type()
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of sends that have not settled yet
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Post `payload` to every other channel with the same name
    pub fn post_message(&self, payload: Value) -> PendingSend {
        if self.is_closed() {
            return PendingSend::rejected(BroadcastError::closed_channel(&self.name, &payload));
        }
        self.post(EventContext::Message, payload)
    }

    /// Post `payload` to the internal listeners of other channels
    pub fn post_internal(&self, payload: Value) -> PendingSend {
        if self.is_closed() {
            return PendingSend::rejected(BroadcastError::closed_channel(&self.name, &payload));
        }
        self.post(EventContext::Internal, payload)
    }

    fn post(&self, context: EventContext, payload: Value) -> PendingSend {
        let envelope = Envelope::new(self.transport.micro_seconds(), context, payload);
        let id = self.next_send.fetch_add(1, Ordering::Relaxed);
        let (reply, settled) = oneshot::channel();

        let tracked: TrackedSend = async move {
            settled
                .await
                .unwrap_or_else(|_| Err(BroadcastError::transport_send("channel", "send dropped")))
        }
        .boxed()
        .shared();

        let queue = self.queue.lock();
        let Some(queue) = queue.as_ref() else {
            return PendingSend::rejected(BroadcastError::closed_channel(&self.name, &envelope.data));
        };
        self.in_flight.lock().insert(id, tracked.clone());
        if let Err(mpsc::error::SendError(send)) = queue.send(QueuedSend { id, envelope, reply }) {
            self.in_flight.lock().remove(&id);
            return PendingSend::rejected(BroadcastError::closed_channel(&self.name, &send.envelope.data));
        }

        PendingSend {
            inner: PendingInner::Tracked(tracked),
        }
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    /// Set or clear the single-slot message listener
    pub fn set_onmessage(&self, callback: Option<MessageCallback>) {
        let time = self.transport.micro_seconds();
        let mut listeners = self.listeners.lock();
        listeners.set_primary(time, callback);
        self.update_listening(&mut listeners);
    }

    pub fn add_event_listener(&self, context: EventContext, callback: MessageCallback) -> ListenerId {
        let time = self.transport.micro_seconds();
        let mut listeners = self.listeners.lock();
        let id = listeners.add(context, time, callback);
        self.update_listening(&mut listeners);
        id
    }

    pub fn remove_event_listener(&self, context: EventContext, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let removed = listeners.remove(context, id);
        self.update_listening(&mut listeners);
        removed
    }

    /// Register a hook that `close()` runs after every send settled
    pub fn add_before_close<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.before_close
            .lock()
            .push(Box::new(move || hook().boxed()));
    }

    /// Arm the transport on the first listener and disarm it after the last
    fn update_listening(&self, listeners: &mut ListenerSet) {
        let wanted = listeners.has_listeners();
        if wanted == listeners.listening {
            return;
        }

        if !wanted {
            listeners.listening = false;
            if let Some(Ok(state)) = self.prepared.peek() {
                tracing::debug!("channel {} stops listening", self.id);
                state.on_message(None, self.transport.micro_seconds());
            }
            return;
        }

        let handler = self.dispatcher();
        match self.prepared.peek() {
            Some(Ok(state)) => {
                listeners.listening = true;
                tracing::debug!("channel {} starts listening", self.id);
                state.on_message(Some(handler), self.transport.micro_seconds());
            }
            Some(Err(_)) => {}
            None => {
                let prepared = self.prepared.clone();
                let set = self.listeners.clone();
                let transport = self.transport.clone();
                let id = self.id;
                tokio::spawn(async move {
                    let Ok(state) = prepared.await else {
                        return;
                    };
                    let mut listeners = set.lock();
                    if listeners.has_listeners() && !listeners.listening {
                        listeners.listening = true;
                        tracing::debug!("channel {} starts listening after preparation", id);
                        state.on_message(Some(handler), transport.micro_seconds());
                    }
                });
            }
        }
    }

    /// Shared dispatch function handed to the transport
    fn dispatcher(&self) -> EnvelopeHandler {
        let listeners = self.listeners.clone();
        let closed = self.closed.clone();
        let ignore_time = self.transport.transport_type() == relay::TYPE;
        Arc::new(move |envelope: Envelope| {
            if closed.load(Ordering::Acquire) {
                return;
            }
            let callbacks = listeners.lock().matching(&envelope, ignore_time);
            for callback in callbacks {
                callback(&envelope.data);
            }
        })
    }

    // ------------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------------

    /// Close the channel. Resolves after preparation finished, every earlier
    /// send settled, every before-close hook ran and the transport released.
    /// Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        registry::deregister(self.id);
        self.listeners.lock().clear_messages();

        let prepared = self.prepared.clone().await;

        loop {
            let pending: Vec<TrackedSend> = self.in_flight.lock().values().cloned().collect();
            if pending.is_empty() {
                break;
            }
            futures::future::join_all(pending).await;
        }

        let hooks: Vec<BeforeCloseHook> = core::mem::take(&mut *self.before_close.lock());
        for result in futures::future::join_all(hooks.into_iter().map(|hook| hook())).await {
            if let Err(err) = result {
                tracing::warn!("before-close hook of channel {} failed: {}", self.id, err);
            }
        }

        self.queue.lock().take();
        tracing::debug!("closed channel {} ({})", self.id, self.name);
        match prepared {
            Ok(state) => state.close().await,
            // nothing was created, so nothing to release
            Err(_) => Ok(()),
        }
    }
}

impl Drop for BroadcastChannel {
    fn drop(&mut self) {
        if !self.is_closed() {
            tracing::debug!("channel {} ({}) dropped without close", self.id, self.name);
        }
    }
}

impl core::fmt::Debug for BroadcastChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BroadcastChannel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("transport", &self.transport.transport_type())
            .field("closed", &self.is_closed())
            .finish()
    }
}
