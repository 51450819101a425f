//! Change reconciler: apply one change event to one cached result set.
//!
//! Two paths:
//! - in place: `update` carrying the full document. If its key is in the
//!   list the slot is replaced; otherwise nothing happens. Never fetches.
//! - refetch: everything else; the entry's params are re-run against the
//!   source and the old and new lists are compared position by position.
//!
//! At most one descriptor is produced per event. Several unrelated changes
//! folded into one event are reported as the first divergence only.

use std::time::Instant;

use lumen_core::{ChangeDescriptor, ChangeEvent, DataSource, Document, Identity, LumenError, Operation};
use metrics::{counter, histogram};
use tracing::debug;

use crate::entry::{CachedResultSet, EntryState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePath {
    InPlace,
    /// `update` with a full document this entry does not hold; no fetch.
    Untouched,
    Refetch,
    /// Entry had no baseline yet; the fetch became the baseline.
    Baseline,
    /// Entry closed before or during reconciliation; nothing touched.
    Discarded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub path: ReconcilePath,
    pub descriptor: Option<ChangeDescriptor>,
}

impl Outcome {
    fn new(path: ReconcilePath, descriptor: Option<ChangeDescriptor>) -> Self { Self { path, descriptor } }
}

/// Fetch through the source with timing and counters.
pub(crate) async fn timed_fetch(source: &dyn DataSource, entry: &CachedResultSet) -> anyhow::Result<Vec<Document>> {
    let t0 = Instant::now();
    counter!("lumen_fetch_total", 1u64);
    let res = source.fetch(entry.params()).await;
    histogram!("lumen_fetch_ms", t0.elapsed().as_secs_f64() * 1000.0);
    match &res {
        Ok(list) => debug!(fp = %entry.fingerprint().short(), len = list.len(), took_ms = %t0.elapsed().as_millis(), "fetch ok"),
        Err(_) => { counter!("lumen_fetch_errors_total", 1u64); }
    }
    res
}

/// Reconcile `event` into `entry`. The caller holds the entry's gate.
///
/// A fetch failure leaves the cached list untouched and is returned to the
/// caller; it is never delivered to subscribers.
pub async fn reconcile(
    entry: &CachedResultSet,
    event: &ChangeEvent,
    source: &dyn DataSource,
    identity: &Identity,
) -> Result<Outcome, LumenError> {
    if entry.is_closed() {
        return Ok(Outcome::new(ReconcilePath::Discarded, None));
    }

    let had_baseline = entry.state() == EntryState::Live;

    // Without a baseline there is nothing to patch; the refetch below establishes it.
    if let (true, Some(doc), Some(key)) = (had_baseline, event.patch_document(), event.document_key.as_ref()) {
        let current = entry.list();
        let Some(pos) = identity.position_of(&current, key) else {
            return Ok(Outcome::new(ReconcilePath::Untouched, None));
        };
        if !entry.replace_at(pos, doc.clone()) {
            return Ok(Outcome::new(ReconcilePath::Discarded, None));
        }
        counter!("lumen_reconcile_in_place_total", 1u64);
        return Ok(Outcome::new(ReconcilePath::InPlace, Some(ChangeDescriptor::update(pos, doc.clone()))));
    }

    let new_list = timed_fetch(source, entry).await.map_err(|e| LumenError::fetch(&e))?;
    counter!("lumen_reconcile_refetch_total", 1u64);
    let old_list = entry.list();
    let descriptor = if had_baseline { diff(&old_list, &new_list, event, identity) } else { None };
    if !entry.install(new_list) {
        return Ok(Outcome::new(ReconcilePath::Discarded, None));
    }
    let path = if had_baseline { ReconcilePath::Refetch } else { ReconcilePath::Baseline };
    Ok(Outcome::new(path, descriptor))
}

/// Positional diff between the cached list and the freshly fetched one.
///
/// The first index whose identities differ is the change point; if the shared
/// prefix is identical but lengths differ, the change point is the shared
/// length. Without a positional change, `update` and `other` events still
/// report the slot holding the event's key (or, failing that, the first slot
/// whose content changed).
pub fn diff(old: &[Document], new: &[Document], event: &ChangeEvent, identity: &Identity) -> Option<ChangeDescriptor> {
    let shared = old.len().min(new.len());
    let split = (0..shared)
        .find(|&i| !identity.same_document(&old[i], &new[i]))
        .or_else(|| (old.len() != new.len()).then_some(shared));

    if let Some(pos) = split {
        return Some(match (event.operation, new.get(pos)) {
            (Operation::Delete, _) | (_, None) => ChangeDescriptor::delete(pos),
            (Operation::Insert, Some(doc)) => ChangeDescriptor::insert(pos, doc.clone()),
            (Operation::Update, Some(doc)) => ChangeDescriptor::update(pos, doc.clone()),
            (Operation::Other, Some(doc)) => {
                if new.len() > old.len() {
                    ChangeDescriptor::insert(pos, doc.clone())
                } else if new.len() < old.len() {
                    ChangeDescriptor::delete(pos)
                } else {
                    ChangeDescriptor::update(pos, doc.clone())
                }
            }
        });
    }

    match event.operation {
        Operation::Update | Operation::Other => {
            let by_key = event.document_key.as_ref().and_then(|k| identity.position_of(new, k));
            let pos = by_key.or_else(|| (0..shared).find(|&i| old[i] != new[i]))?;
            Some(ChangeDescriptor::update(pos, new[pos].clone()))
        }
        Operation::Insert | Operation::Delete => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::{ChangeKind, QueryParams, RawChangeStream};
    use serde_json::json;

    struct NoFetch;

    #[async_trait::async_trait]
    impl DataSource for NoFetch {
        async fn fetch(&self, _params: &QueryParams) -> anyhow::Result<Vec<Document>> { anyhow::bail!("fetch not expected") }
        async fn watch(&self) -> anyhow::Result<RawChangeStream> { anyhow::bail!("watch not expected") }
    }

    fn d(id: u32, tag: &str) -> Document { json!({"_id": id, "tag": tag}) }

    fn abc() -> Vec<Document> { vec![d(1, "A"), d(2, "B"), d(3, "C")] }

    #[test]
    fn delete_in_middle() {
        let id = Identity::default();
        let new = vec![d(1, "A"), d(3, "C")];
        let got = diff(&abc(), &new, &ChangeEvent::delete(json!(2)), &id);
        assert_eq!(got, Some(ChangeDescriptor::delete(1)));
    }

    #[test]
    fn insert_in_middle() {
        let id = Identity::default();
        let new = vec![d(1, "A"), d(9, "X"), d(2, "B"), d(3, "C")];
        let got = diff(&abc(), &new, &ChangeEvent::insert(json!(9), d(9, "X")), &id);
        assert_eq!(got, Some(ChangeDescriptor::insert(1, d(9, "X"))));
    }

    #[test]
    fn tail_append_and_tail_removal() {
        let id = Identity::default();
        let mut grown = abc();
        grown.push(d(4, "D"));
        assert_eq!(diff(&abc(), &grown, &ChangeEvent::insert(json!(4), d(4, "D")), &id), Some(ChangeDescriptor::insert(3, d(4, "D"))));
        let shrunk = vec![d(1, "A"), d(2, "B")];
        assert_eq!(diff(&abc(), &shrunk, &ChangeEvent::delete(json!(3)), &id), Some(ChangeDescriptor::delete(2)));
    }

    #[test]
    fn unrelated_insert_yields_nothing() {
        let id = Identity::default();
        assert_eq!(diff(&abc(), &abc(), &ChangeEvent::insert(json!(7), d(7, "Z")), &id), None);
        assert_eq!(diff(&abc(), &abc(), &ChangeEvent::delete(json!(7)), &id), None);
    }

    #[test]
    fn update_without_document_is_located_by_key() {
        let id = Identity::default();
        let new = vec![d(1, "A"), d(2, "B2"), d(3, "C")];
        let got = diff(&abc(), &new, &ChangeEvent::update(json!(2), None), &id).unwrap();
        assert_eq!(got.operation, ChangeKind::Update);
        assert_eq!(got.position, 1);
        assert_eq!(got.document, Some(d(2, "B2")));
    }

    #[test]
    fn update_that_reorders_reports_first_divergence() {
        let id = Identity::default();
        let new = vec![d(2, "B"), d(1, "A"), d(3, "C")];
        let got = diff(&abc(), &new, &ChangeEvent::update(json!(2), None), &id).unwrap();
        assert_eq!(got, ChangeDescriptor::update(0, d(2, "B")));
    }

    #[test]
    fn other_infers_kind_from_length() {
        let id = Identity::default();
        let other = ChangeEvent::other();
        let grown = vec![d(0, "Z"), d(1, "A"), d(2, "B"), d(3, "C")];
        assert_eq!(diff(&abc(), &grown, &other, &id).unwrap().operation, ChangeKind::Insert);
        let shrunk = vec![d(2, "B"), d(3, "C")];
        assert_eq!(diff(&abc(), &shrunk, &other, &id), Some(ChangeDescriptor::delete(0)));
        let edited = vec![d(1, "A"), d(2, "B"), d(3, "C3")];
        assert_eq!(diff(&abc(), &edited, &other, &id), Some(ChangeDescriptor::update(2, d(3, "C3"))));
        assert_eq!(diff(&abc(), &abc(), &other, &id), None);
    }

    #[test]
    fn insert_event_with_vanished_slot_reports_delete() {
        let id = Identity::default();
        let new = vec![d(1, "A"), d(2, "B")];
        let got = diff(&abc(), &new, &ChangeEvent::insert(json!(5), d(5, "E")), &id);
        assert_eq!(got, Some(ChangeDescriptor::delete(2)));
    }

    #[tokio::test]
    async fn full_document_update_never_fetches() {
        let params = QueryParams::default();
        let entry = CachedResultSet::new(params.fingerprint(), params, None);
        entry.install(abc());
        let id = Identity::default();

        let hit = reconcile(&entry, &ChangeEvent::update(json!(2), Some(d(2, "B2"))), &NoFetch, &id).await.unwrap();
        assert_eq!(hit, Outcome::new(ReconcilePath::InPlace, Some(ChangeDescriptor::update(1, d(2, "B2")))));

        let miss = reconcile(&entry, &ChangeEvent::update(json!(9), Some(d(9, "Z"))), &NoFetch, &id).await.unwrap();
        assert_eq!(miss, Outcome::new(ReconcilePath::Untouched, None));
        assert_eq!(*entry.list(), vec![d(1, "A"), d(2, "B2"), d(3, "C")]);
    }
}
