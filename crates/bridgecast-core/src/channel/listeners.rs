//! Listener bookkeeping
//!
//! [`ListenerSet`] backs a single channel: listeners are partitioned by event
//! context and stamped with their registration time. [`Subscribers`] backs the
//! adaptive and redundant channels, which fan out to a flat set.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::types::{Envelope, EventContext};

/// Callback invoked with every delivered payload
pub type MessageCallback = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Handle of a registered listener, used to remove it again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

struct ListenerEntry {
    id: ListenerId,
    time: u64,
    callback: MessageCallback,
}

/// Listeners of one channel
#[derive(Default)]
pub(crate) struct ListenerSet {
    message: Vec<ListenerEntry>,
    internal: Vec<ListenerEntry>,
    primary: Option<ListenerId>,
    next_id: u64,
    /// Whether the transport's receive hook is armed
    pub(crate) listening: bool,
}

impl ListenerSet {
    fn partition(&mut self, context: EventContext) -> &mut Vec<ListenerEntry> {
        match context {
            EventContext::Message => &mut self.message,
            EventContext::Internal => &mut self.internal,
        }
    }

    pub(crate) fn add(&mut self, context: EventContext, time: u64, callback: MessageCallback) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.partition(context).push(ListenerEntry { id, time, callback });
        id
    }

    pub(crate) fn remove(&mut self, context: EventContext, id: ListenerId) -> bool {
        let partition = self.partition(context);
        let before = partition.len();
        partition.retain(|entry| entry.id != id);
        before != partition.len()
    }

    /// Replace the single-slot message listener
    pub(crate) fn set_primary(&mut self, time: u64, callback: Option<MessageCallback>) {
        if let Some(previous) = self.primary.take() {
            self.remove(EventContext::Message, previous);
        }
        if let Some(callback) = callback {
            self.primary = Some(self.add(EventContext::Message, time, callback));
        }
    }

    /// Drop the primary listener and every message listener; internal ones stay
    pub(crate) fn clear_messages(&mut self) {
        self.primary = None;
        self.message.clear();
    }

    pub(crate) fn has_listeners(&self) -> bool {
        !self.message.is_empty() || !self.internal.is_empty()
    }

    /// Callbacks that should receive `envelope`
    ///
    /// A listener only sees envelopes stamped at or after its registration,
    /// unless `ignore_time` is set.
    pub(crate) fn matching(&self, envelope: &Envelope, ignore_time: bool) -> Vec<MessageCallback> {
        let partition = match envelope.context {
            EventContext::Message => &self.message,
            EventContext::Internal => &self.internal,
        };
        partition
            .iter()
            .filter(|entry| ignore_time || envelope.time >= entry.time)
            .map(|entry| entry.callback.clone())
            .collect()
    }
}

/// Flat listener set of the adaptive and redundant channels
#[derive(Default)]
pub(crate) struct Subscribers {
    entries: Vec<(ListenerId, MessageCallback)>,
    primary: Option<ListenerId>,
    next_id: u64,
}

impl Subscribers {
    pub(crate) fn add(&mut self, callback: MessageCallback) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, callback));
        id
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        before != self.entries.len()
    }

    pub(crate) fn set_primary(&mut self, callback: Option<MessageCallback>) {
        if let Some(previous) = self.primary.take() {
            self.remove(previous);
        }
        if let Some(callback) = callback {
            self.primary = Some(self.add(callback));
        }
    }

    pub(crate) fn clear_primary(&mut self) {
        if let Some(previous) = self.primary.take() {
            self.remove(previous);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.primary = None;
    }

    pub(crate) fn snapshot(&self) -> Vec<MessageCallback> {
        self.entries.iter().map(|(_, callback)| callback.clone()).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
