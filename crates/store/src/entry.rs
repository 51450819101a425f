//! Cached result set: one per fingerprint, shared by all its subscribers.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use lumen_core::{ChangeDescriptor, ChangeEvent, Document, Fingerprint, QueryParams};
use serde::Serialize;
use smallvec::SmallVec;
use uuid::Uuid;

use crate::debounce::Debouncer;

/// Process-unique subscription handle.
pub type SubscriptionId = Uuid;

/// Subscriber callback: refreshed list, the raw change event, and the slot that changed.
pub type Callback = Arc<dyn Fn(&[Document], &ChangeEvent, &ChangeDescriptor) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    /// Registered, baseline fetch not landed yet.
    Initializing,
    /// List reflects the last good fetch or reconciled state.
    Live,
    /// Terminal; removed from the registry.
    Closed,
}

#[derive(Clone)]
pub struct Subscriber {
    pub id: SubscriptionId,
    pub callback: Callback,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("id", &self.id).finish_non_exhaustive()
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

pub struct CachedResultSet {
    fingerprint: Fingerprint,
    params: QueryParams,
    list: ArcSwap<Vec<Document>>,
    state: Mutex<EntryState>,
    subscribers: Mutex<SmallVec<[Subscriber; 2]>>,
    debouncer: Option<Mutex<Debouncer>>,
    /// Serializes baseline fetch and reconciliation for this entry.
    pub(crate) gate: Arc<tokio::sync::Mutex<()>>,
}

impl CachedResultSet {
    pub(crate) fn new(fingerprint: Fingerprint, params: QueryParams, debouncer: Option<Debouncer>) -> Self {
        Self {
            fingerprint,
            params,
            list: ArcSwap::from_pointee(Vec::new()),
            state: Mutex::new(EntryState::Initializing),
            subscribers: Mutex::new(SmallVec::new()),
            debouncer: debouncer.filter(Debouncer::is_enabled).map(Mutex::new),
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint { &self.fingerprint }
    pub fn params(&self) -> &QueryParams { &self.params }
    pub fn state(&self) -> EntryState { *lock(&self.state) }
    pub fn is_closed(&self) -> bool { self.state() == EntryState::Closed }

    /// Current list snapshot; cheap, never blocks on reconciliation.
    pub fn list(&self) -> Arc<Vec<Document>> { self.list.load_full() }

    /// Store a freshly fetched list and go Live. No-op once closed.
    pub(crate) fn install(&self, list: Vec<Document>) -> bool {
        let mut state = lock(&self.state);
        if *state == EntryState::Closed { return false; }
        self.list.store(Arc::new(list));
        *state = EntryState::Live;
        true
    }

    /// Replace one slot in place, keeping position. No-op once closed or out of range.
    pub(crate) fn replace_at(&self, pos: usize, doc: Document) -> bool {
        let state = lock(&self.state);
        if *state == EntryState::Closed { return false; }
        let current = self.list.load();
        if pos >= current.len() { return false; }
        let mut next = Vec::clone(&current);
        next[pos] = doc;
        self.list.store(Arc::new(next));
        true
    }

    pub(crate) fn close(&self) { *lock(&self.state) = EntryState::Closed; }

    pub(crate) fn add_subscriber(&self, sub: Subscriber) { lock(&self.subscribers).push(sub); }

    /// Returns true if the subscriber was attached here.
    pub(crate) fn remove_subscriber(&self, id: SubscriptionId) -> bool {
        let mut subs = lock(&self.subscribers);
        match subs.iter().position(|s| s.id == id) {
            Some(i) => { subs.remove(i); true }
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize { lock(&self.subscribers).len() }

    /// Snapshot of the subscriber set so callbacks run without holding the lock.
    pub(crate) fn subscribers(&self) -> SmallVec<[Subscriber; 2]> { lock(&self.subscribers).clone() }

    /// Consult the debouncer, if configured.
    pub(crate) fn should_suppress(&self) -> bool {
        self.debouncer.as_ref().map(|d| lock(d).should_suppress()).unwrap_or(false)
    }
}

impl fmt::Debug for CachedResultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedResultSet")
            .field("fingerprint", &self.fingerprint.short())
            .field("state", &self.state())
            .field("len", &self.list.load().len())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn entry() -> CachedResultSet {
        let params = QueryParams::default();
        CachedResultSet::new(params.fingerprint(), params, None)
    }

    #[test]
    fn lifecycle_initializing_live_closed() {
        let e = entry();
        assert_eq!(e.state(), EntryState::Initializing);
        assert!(e.list().is_empty());
        assert!(e.install(vec![json!({"_id": 1})]));
        assert_eq!(e.state(), EntryState::Live);
        e.close();
        assert!(e.is_closed());
        assert!(!e.install(vec![]));
        assert_eq!(e.list().len(), 1, "closed entry must not be mutated");
    }

    #[test]
    fn replace_keeps_position_and_bounds() {
        let e = entry();
        e.install(vec![json!({"_id": 1}), json!({"_id": 2})]);
        assert!(e.replace_at(1, json!({"_id": 2, "v": true})));
        assert_eq!(e.list()[1], json!({"_id": 2, "v": true}));
        assert!(!e.replace_at(5, json!({})));
    }

    #[test]
    fn subscriber_add_remove() {
        let e = entry();
        let id = Uuid::new_v4();
        e.add_subscriber(Subscriber { id, callback: Arc::new(|_, _, _| {}) });
        assert_eq!(e.subscriber_count(), 1);
        assert!(!e.remove_subscriber(Uuid::new_v4()));
        assert!(e.remove_subscriber(id));
        assert_eq!(e.subscriber_count(), 0);
    }

    #[test]
    fn disabled_debouncer_is_dropped() {
        let params = QueryParams::default();
        let e = CachedResultSet::new(params.fingerprint(), params, Some(Debouncer::new(Duration::ZERO)));
        assert!(!e.should_suppress());
        assert!(!e.should_suppress());
    }
}
