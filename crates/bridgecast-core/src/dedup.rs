//! Duplicate suppression primitives
//!
//! Two structures are provided:
//! - [`ObliviousSet`]: membership that forgets entries after a fixed lifetime,
//!   used by transports to remember which message ids they already emitted.
//! - [`NonceWindow`]: a capacity-bounded, insertion-ordered set of nonces used by
//!   the redundant channel to collapse copies that arrive over several transports.

use alloc::collections::VecDeque;
use core::hash::Hash;
use core::time::Duration;
use hashbrown::{HashMap, HashSet};
use std::time::Instant;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Number of nonces the redundant channel remembers
pub const DEFAULT_NONCE_CAPACITY: usize = 1000;

// ----------------------------------------------------------------------------
// Oblivious Set
// ----------------------------------------------------------------------------

/// A set whose entries expire `ttl` after insertion
#[derive(Debug)]
pub struct ObliviousSet<K> {
    ttl: Duration,
    inserted: HashMap<K, Instant>,
    order: VecDeque<(K, Instant)>,
}

impl<K: Hash + Eq + Clone> ObliviousSet<K> {
    /// Create an empty set with the given entry lifetime
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inserted: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Whether `key` was added less than `ttl` ago
    pub fn has(&self, key: &K) -> bool {
        self.inserted
            .get(key)
            .map(|at| at.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    /// Add `key`, dropping every expired entry first
    pub fn add(&mut self, key: K) {
        let now = Instant::now();
        self.remove_expired(now);
        self.inserted.insert(key.clone(), now);
        self.order.push_back((key, now));
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.inserted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
    }

    fn remove_expired(&mut self, now: Instant) {
        while let Some((key, at)) = self.order.front() {
            if now.duration_since(*at) < self.ttl {
                break;
            }
            // Only drop the map entry if it was not re-added later
            if self.inserted.get(key) == Some(at) {
                self.inserted.remove(key);
            }
            self.order.pop_front();
        }
    }
}

// ----------------------------------------------------------------------------
// Nonce Window
// ----------------------------------------------------------------------------

/// Bounded set of recently processed nonces with oldest-first eviction
#[derive(Debug, Clone)]
pub struct NonceWindow {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl NonceWindow {
    /// Create a window remembering at most `capacity` nonces
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::with_capacity(capacity.max(1) + 1),
            seen: HashSet::with_capacity(capacity.max(1) + 1),
        }
    }

    /// Record `nonce`. Returns `false` if it was already present (a duplicate).
    pub fn insert(&mut self, nonce: &str) -> bool {
        if self.seen.contains(nonce) {
            return false;
        }
        self.seen.insert(nonce.to_string());
        self.order.push_back(nonce.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, nonce: &str) -> bool {
        self.seen.contains(nonce)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for NonceWindow {
    fn default() -> Self {
        Self::new(DEFAULT_NONCE_CAPACITY)
    }
}
