// ── Invalidation registry ──
//
// Maps an entity tag to a "last changed" stamp so independent consumers
// learn when data they depend on was mutated elsewhere, without an event
// bus or direct references between unrelated screens. A mutation call
// site bumps the tag; every fetcher watching it refetches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::debug;

/// Entity tag → stamp of the most recent bump.
///
/// Stamps come from a per-registry counter, not wall clock: they are
/// strictly increasing per tag, and a tag is absent until its first bump.
pub type TriggerMap = HashMap<String, u64>;

/// Listener invoked synchronously after every bump with the trigger map
/// after and before the change.
type Listener = Box<dyn Fn(&TriggerMap, &TriggerMap) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    callback: Arc<Listener>,
}

/// Tags and the counter that stamps them, guarded together: a bump must
/// produce a consistent (previous, current) pair, and stamps must be
/// assigned in insertion order.
struct TriggerTable {
    map: TriggerMap,
    next_stamp: u64,
    next_listener_id: u64,
}

/// Process-wide refetch trigger registry.
///
/// Production wires a single shared `Arc<RefetchRegistry>` through the
/// session; tests construct a fresh one per case. Tags are free-form and
/// normalized to upper-case -- producers and consumers agree on them by
/// convention only.
pub struct RefetchRegistry {
    table: Mutex<TriggerTable>,
    listeners: Arc<Mutex<Vec<ListenerEntry>>>,
    last_bump: watch::Sender<Option<DateTime<Utc>>>,
}

impl RefetchRegistry {
    pub fn new() -> Self {
        let (last_bump, _) = watch::channel(None);
        Self {
            table: Mutex::new(TriggerTable {
                map: TriggerMap::new(),
                next_stamp: 0,
                next_listener_id: 0,
            }),
            listeners: Arc::new(Mutex::new(Vec::new())),
            last_bump,
        }
    }

    /// Record that entities of the given tag changed.
    ///
    /// Normalizes the tag to upper-case, assigns it the next stamp, and
    /// synchronously notifies every listener in subscription order.
    /// Unknown tags initialize lazily on first bump.
    pub fn bump(&self, tag: &str) {
        let tag = tag.to_uppercase();

        let (current, previous) = {
            let mut table = self.table.lock().expect("trigger table lock poisoned");
            table.next_stamp += 1;
            let stamp = table.next_stamp;
            let previous = table.map.clone();
            table.map.insert(tag.clone(), stamp);
            (table.map.clone(), previous)
        };

        let _ = self.last_bump.send(Some(Utc::now()));
        debug!(%tag, stamp = current[&tag], "entity invalidated");

        // Snapshot the callback list so a listener may subscribe,
        // unsubscribe, or bump again without deadlocking.
        let callbacks: Vec<Arc<Listener>> = {
            let listeners = self.listeners.lock().expect("listener list lock poisoned");
            listeners.iter().map(|e| Arc::clone(&e.callback)).collect()
        };
        for callback in callbacks {
            callback(&current, &previous);
        }
    }

    /// Register a listener invoked synchronously after every bump.
    ///
    /// The returned guard deregisters the listener when dropped;
    /// [`Subscription::unsubscribe`] does the same eagerly and is
    /// idempotent.
    pub fn subscribe(
        &self,
        listener: impl Fn(&TriggerMap, &TriggerMap) + Send + Sync + 'static,
    ) -> Subscription {
        let id = {
            let mut table = self.table.lock().expect("trigger table lock poisoned");
            table.next_listener_id += 1;
            table.next_listener_id
        };

        self.listeners
            .lock()
            .expect("listener list lock poisoned")
            .push(ListenerEntry {
                id,
                callback: Arc::new(Box::new(listener)),
            });

        Subscription {
            listeners: Arc::downgrade(&self.listeners),
            id,
        }
    }

    /// Current trigger map.
    pub fn snapshot(&self) -> TriggerMap {
        self.table
            .lock()
            .expect("trigger table lock poisoned")
            .map
            .clone()
    }

    /// Stamp of the given tag, or `None` if it was never bumped.
    pub fn stamp(&self, tag: &str) -> Option<u64> {
        self.table
            .lock()
            .expect("trigger table lock poisoned")
            .map
            .get(&tag.to_uppercase())
            .copied()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .expect("listener list lock poisoned")
            .len()
    }

    // ── Metadata ─────────────────────────────────────────────────────

    /// Wall-clock instant of the most recent bump, or `None` if nothing
    /// was ever invalidated. Diagnostics only -- ordering always goes
    /// through the stamps.
    pub fn last_bump(&self) -> Option<DateTime<Utc>> {
        *self.last_bump.borrow()
    }

    /// How long ago the last bump occurred.
    pub fn bump_age(&self) -> Option<chrono::Duration> {
        self.last_bump().map(|t| Utc::now() - t)
    }
}

impl Default for RefetchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Deregistration guard for a registry listener.
///
/// Removal is keyed by a unique id, so calling [`unsubscribe`]
/// repeatedly (or after Drop already ran) is a no-op and can never
/// remove another listener.
///
/// [`unsubscribe`]: Self::unsubscribe
pub struct Subscription {
    listeners: Weak<Mutex<Vec<ListenerEntry>>>,
    id: u64,
}

impl Subscription {
    /// Remove the listener from the registry.
    pub fn unsubscribe(&self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .lock()
                .expect("listener list lock poisoned")
                .retain(|e| e.id != self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
