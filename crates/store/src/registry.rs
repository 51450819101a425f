//! Subscription registry: fingerprint -> cached result set.
//!
//! Structural changes (entry create/remove, subscriber add/remove) happen
//! under one registry-wide lock. Reconciliation of a single entry is
//! serialized by that entry's gate; different entries reconcile concurrently.
//! Fan-out runs inside the gate, so subscribers of one entry observe changes
//! in feed order.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use lumen_core::{
    CacheConfig, ChangeDescriptor, ChangeEvent, DataSource, Document, Fingerprint, Identity, LumenError,
    LumenResult, Operation, QueryParams,
};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::debounce::Debouncer;
use crate::entry::{CachedResultSet, Callback, EntryState, Subscriber, SubscriptionId};
use crate::reconcile::{reconcile, timed_fetch, Outcome, ReconcilePath};

/// Background failure, published on the operator channel.
#[derive(Debug, Clone, Serialize)]
pub struct CacheFault {
    pub fingerprint: Option<Fingerprint>,
    pub error: LumenError,
    /// Wall clock, millis since epoch.
    pub at_ms: i64,
}

/// Per-event dispatch counts across all entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub entries: usize,
    pub notified: usize,
    pub suppressed: usize,
    pub unchanged: usize,
    pub failed: usize,
}

enum Delivery {
    Notified,
    Suppressed,
    Unchanged,
    Failed,
}

type EntryMap = FxHashMap<Fingerprint, Arc<CachedResultSet>>;

fn read(m: &RwLock<EntryMap>) -> RwLockReadGuard<'_, EntryMap> { m.read().unwrap_or_else(PoisonError::into_inner) }
fn write(m: &RwLock<EntryMap>) -> RwLockWriteGuard<'_, EntryMap> { m.write().unwrap_or_else(PoisonError::into_inner) }

struct Attached {
    id: SubscriptionId,
    entry: Arc<CachedResultSet>,
    created: bool,
    guard: Option<OwnedMutexGuard<()>>,
}

struct Inner {
    source: Arc<dyn DataSource>,
    identity: Identity,
    config: CacheConfig,
    entries: RwLock<EntryMap>,
    errors: broadcast::Sender<CacheFault>,
    runtime: Handle,
}

/// Shared live query cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    /// Identity uses `config.id_field` with canonical key comparison.
    pub fn new(source: Arc<dyn DataSource>, config: CacheConfig) -> LumenResult<Self> {
        let identity = Identity::canonical(config.id_field.clone());
        Self::with_identity(source, identity, config)
    }

    /// Must be called within a tokio runtime; background work is spawned onto it.
    pub fn with_identity(source: Arc<dyn DataSource>, identity: Identity, config: CacheConfig) -> LumenResult<Self> {
        let runtime = Handle::try_current().map_err(|e| LumenError::Config(format!("no tokio runtime: {}", e)))?;
        Self::with_runtime(source, identity, config, runtime)
    }

    /// Registry whose background work runs on `runtime`.
    pub fn with_runtime(source: Arc<dyn DataSource>, identity: Identity, config: CacheConfig, runtime: Handle) -> LumenResult<Self> {
        config.validate()?;
        let (errors, _) = broadcast::channel(config.error_channel_cap);
        info!(id_field = %identity.field(), debounce_ms = %config.debounce.as_millis(), "registry ready");
        Ok(Self {
            inner: Arc::new(Inner { source, identity, config, entries: RwLock::new(FxHashMap::default()), errors, runtime }),
        })
    }

    pub fn identity(&self) -> &Identity { &self.inner.identity }
    pub fn config(&self) -> &CacheConfig { &self.inner.config }
    pub fn source(&self) -> Arc<dyn DataSource> { Arc::clone(&self.inner.source) }
    pub fn runtime(&self) -> &Handle { &self.inner.runtime }

    /// Operator-facing fault channel. Subscribers never see errors.
    pub fn errors(&self) -> broadcast::Receiver<CacheFault> { self.inner.errors.subscribe() }

    pub fn report_fault(&self, fingerprint: Option<Fingerprint>, error: LumenError) { self.inner.report(fingerprint, error); }

    /// Register interest in `params`. A new fingerprint gets an entry in
    /// `Initializing` and a background baseline fetch; failures of that fetch
    /// go to the fault channel. The fetch runs on the registry's runtime, so
    /// this may be called from any thread.
    pub fn subscribe<F>(&self, params: QueryParams, callback: F) -> SubscriptionId
    where
        F: Fn(&[Document], &ChangeEvent, &ChangeDescriptor) + Send + Sync + 'static,
    {
        let att = self.attach(params, Arc::new(callback));
        if att.created {
            let inner = Arc::clone(&self.inner);
            let entry = Arc::clone(&att.entry);
            let early = att.guard;
            self.inner.runtime.spawn(async move {
                let _gate = match early {
                    Some(g) => g,
                    None => Arc::clone(&entry.gate).lock_owned().await,
                };
                if let Err(e) = inner.establish(&entry).await {
                    inner.report(Some(entry.fingerprint().clone()), e);
                }
            });
        }
        att.id
    }

    /// Like `subscribe`, but waits for the baseline. A failed baseline fetch
    /// is returned here and leaves no subscription behind.
    pub async fn subscribe_and_wait<F>(&self, params: QueryParams, callback: F) -> LumenResult<SubscriptionId>
    where
        F: Fn(&[Document], &ChangeEvent, &ChangeDescriptor) + Send + Sync + 'static,
    {
        let att = self.attach(params, Arc::new(callback));
        let _gate = match att.guard {
            Some(g) => g,
            None => Arc::clone(&att.entry.gate).lock_owned().await,
        };
        match self.inner.establish(&att.entry).await {
            Ok(()) => Ok(att.id),
            Err(e) => {
                warn!(fp = %att.entry.fingerprint().short(), error = %e, "baseline fetch failed; subscription dropped");
                self.unsubscribe(att.id);
                Err(e)
            }
        }
    }

    fn attach(&self, params: QueryParams, callback: Callback) -> Attached {
        let fp = params.fingerprint();
        let id = Uuid::new_v4();
        let mut map = write(&self.inner.entries);
        let (entry, created, guard) = if let Some(existing) = map.get(&fp).cloned() {
            (existing, false, None)
        } else {
            let debouncer = Debouncer::new(self.inner.config.debounce);
            let entry = Arc::new(CachedResultSet::new(fp.clone(), params, Some(debouncer)));
            let guard = Arc::clone(&entry.gate).try_lock_owned().ok();
            map.insert(fp.clone(), Arc::clone(&entry));
            gauge!("lumen_entries", map.len() as f64);
            info!(fp = %fp.short(), entries = map.len(), "entry created");
            (entry, true, guard)
        };
        entry.add_subscriber(Subscriber { id, callback });
        debug!(fp = %fp.short(), sub = %id, subscribers = entry.subscriber_count(), "subscribed");
        Attached { id, entry, created, guard }
    }

    /// Remove a subscription. Unknown ids are a no-op. The last subscriber
    /// leaving closes the entry and drops it from the registry.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut map = write(&self.inner.entries);
        let Some(fp) = map.iter().find_map(|(fp, e)| e.remove_subscriber(id).then(|| fp.clone())) else {
            debug!(sub = %id, "unsubscribe: unknown id");
            return false;
        };
        let emptied = map.get(&fp).map(|e| e.subscriber_count() == 0).unwrap_or(false);
        if emptied {
            if let Some(entry) = map.remove(&fp) {
                entry.close();
            }
            gauge!("lumen_entries", map.len() as f64);
            info!(fp = %fp.short(), entries = map.len(), "entry closed");
        }
        debug!(sub = %id, fp = %fp.short(), "unsubscribed");
        true
    }

    /// Current cached list for a fingerprint, or `None` if no entry exists.
    /// An entry still initializing yields an empty list.
    pub fn find(&self, fingerprint: &Fingerprint) -> Option<Arc<Vec<Document>>> {
        read(&self.inner.entries).get(fingerprint).map(|e| e.list())
    }

    pub fn find_params(&self, params: &QueryParams) -> Option<Arc<Vec<Document>>> { self.find(&params.fingerprint()) }

    /// Dispatch one change event to every entry; each decides relevance itself.
    pub async fn on_change_event(&self, event: &ChangeEvent) -> DispatchSummary {
        let entries: Vec<Arc<CachedResultSet>> = read(&self.inner.entries).values().cloned().collect();
        let t0 = Instant::now();
        let deliveries = futures::future::join_all(entries.iter().map(|e| self.inner.process(e, event))).await;
        let mut summary = DispatchSummary { entries: entries.len(), ..Default::default() };
        for d in deliveries {
            match d {
                Delivery::Notified => summary.notified += 1,
                Delivery::Suppressed => summary.suppressed += 1,
                Delivery::Unchanged => summary.unchanged += 1,
                Delivery::Failed => summary.failed += 1,
            }
        }
        debug!(op = event.operation.as_str(), entries = summary.entries, notified = summary.notified, failed = summary.failed, took_ms = %t0.elapsed().as_millis(), "change dispatched");
        summary
    }

    /// Parse a raw change-stream value and dispatch it. Malformed input is
    /// reported and still dispatched as `other` (full refetch).
    pub async fn on_raw_event(&self, raw: &Value) -> DispatchSummary {
        let event = ChangeEvent::from_raw(raw, &self.inner.identity);
        if let Some(reason) = malformed_reason(raw, &event) {
            counter!("lumen_malformed_events_total", 1u64);
            self.inner.report(None, LumenError::MalformedEvent(reason.to_string()));
        }
        self.on_change_event(&event).await
    }

    /// Refetch every entry, e.g. after the change feed reconnected.
    pub async fn resync(&self) -> DispatchSummary {
        info!(entries = self.len(), "resync");
        self.on_change_event(&ChangeEvent::other()).await
    }

    pub fn len(&self) -> usize { read(&self.inner.entries).len() }
    pub fn is_empty(&self) -> bool { read(&self.inner.entries).is_empty() }

    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        let mut fps: Vec<_> = read(&self.inner.entries).keys().cloned().collect();
        fps.sort_unstable();
        fps
    }

    pub fn subscriber_count(&self, fingerprint: &Fingerprint) -> Option<usize> {
        read(&self.inner.entries).get(fingerprint).map(|e| e.subscriber_count())
    }

    pub fn state(&self, fingerprint: &Fingerprint) -> Option<EntryState> {
        read(&self.inner.entries).get(fingerprint).map(|e| e.state())
    }

    pub fn params(&self, fingerprint: &Fingerprint) -> Option<QueryParams> {
        read(&self.inner.entries).get(fingerprint).map(|e| e.params().clone())
    }
}

impl Inner {
    fn report(&self, fingerprint: Option<Fingerprint>, error: LumenError) {
        warn!(fp = %fingerprint.as_ref().map(|f| f.short()).unwrap_or("-"), error = %error, "cache fault");
        let _ = self.errors.send(CacheFault { fingerprint, error, at_ms: chrono::Utc::now().timestamp_millis() });
    }

    /// Baseline fetch for an entry still `Initializing`. Caller holds the gate.
    async fn establish(&self, entry: &CachedResultSet) -> LumenResult<()> {
        if entry.state() != EntryState::Initializing {
            return Ok(());
        }
        let list = timed_fetch(self.source.as_ref(), entry).await.map_err(|e| LumenError::fetch(&e))?;
        let len = list.len();
        if entry.install(list) {
            info!(fp = %entry.fingerprint().short(), len, "entry live");
        } else {
            debug!(fp = %entry.fingerprint().short(), "baseline discarded; entry closed");
        }
        Ok(())
    }

    async fn process(&self, entry: &CachedResultSet, event: &ChangeEvent) -> Delivery {
        let _gate = entry.gate.lock().await;
        let t0 = Instant::now();
        match reconcile(entry, event, self.source.as_ref(), &self.identity).await {
            Ok(Outcome { path, descriptor: Some(desc) }) => {
                if entry.should_suppress() {
                    counter!("lumen_notify_suppressed_total", 1u64);
                    debug!(fp = %entry.fingerprint().short(), ?path, "fan-out debounced");
                    return Delivery::Suppressed;
                }
                let list = entry.list();
                let subs = entry.subscribers();
                for s in subs.iter() {
                    (s.callback)(&list, event, &desc);
                }
                counter!("lumen_notify_total", subs.len() as u64);
                debug!(
                    fp = %entry.fingerprint().short(),
                    ?path,
                    op = ?desc.operation,
                    position = desc.position,
                    subscribers = subs.len(),
                    took_ms = %t0.elapsed().as_millis(),
                    "notified"
                );
                Delivery::Notified
            }
            Ok(Outcome { path, descriptor: None }) => {
                if path == ReconcilePath::Baseline {
                    info!(fp = %entry.fingerprint().short(), "entry live after deferred baseline");
                }
                Delivery::Unchanged
            }
            Err(e) => {
                self.report(Some(entry.fingerprint().clone()), e);
                Delivery::Failed
            }
        }
    }
}

fn malformed_reason(raw: &Value, event: &ChangeEvent) -> Option<&'static str> {
    if !raw.is_object() {
        return Some("event is not an object");
    }
    let Some(op) = raw.get("operationType").and_then(|v| v.as_str()) else {
        return Some("missing operationType");
    };
    let keyed = matches!(Operation::parse(op), Operation::Insert | Operation::Update | Operation::Delete);
    (keyed && event.document_key.is_none()).then_some("missing documentKey")
}
