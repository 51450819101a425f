//! In-process collection: a queryable document list with a change stream.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use lumen_core::{ChangeEvent, DataSource, Direction, Document, Identity, QueryParams, RawChangeStream};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::matcher::{compare, lookup, matches};

const DEFAULT_FEED_CAP: usize = 1024;

pub struct MemoryCollection {
    identity: Identity,
    docs: RwLock<Vec<Document>>,
    events: broadcast::Sender<Value>,
    update_lookup: bool,
}

impl MemoryCollection {
    pub fn new(identity: Identity) -> Self { Self::with_capacity(identity, DEFAULT_FEED_CAP) }

    /// `feed_cap` bounds how far a slow watcher may fall behind before it sees a lag error.
    pub fn with_capacity(identity: Identity, feed_cap: usize) -> Self {
        let (events, _) = broadcast::channel(feed_cap.max(1));
        Self { identity, docs: RwLock::new(Vec::new()), events, update_lookup: true }
    }

    /// Whether update events carry the full post-image. Defaults to true.
    pub fn with_update_lookup(mut self, on: bool) -> Self { self.update_lookup = on; self }

    /// Seed documents without emitting change events.
    pub fn seed(&self, docs: impl IntoIterator<Item = Document>) -> Result<()> {
        let mut guard = self.write();
        for doc in docs {
            let doc = self.with_id(doc)?;
            self.ensure_absent(&guard, &doc)?;
            guard.push(doc);
        }
        Ok(())
    }

    pub fn len(&self) -> usize { self.read().len() }
    pub fn is_empty(&self) -> bool { self.read().is_empty() }
    pub fn snapshot(&self) -> Vec<Document> { self.read().clone() }

    /// Insert a document, assigning a uuid id if it has none. Returns the id.
    pub fn insert(&self, doc: Document) -> Result<Value> {
        let doc = self.with_id(doc)?;
        let key = self.key(&doc)?;
        let mut guard = self.write();
        self.ensure_absent(&guard, &doc)?;
        guard.push(doc.clone());
        self.emit(ChangeEvent::insert(key.clone(), doc));
        Ok(key)
    }

    /// Replace the document with id `key`. The id field is forced to `key`.
    pub fn update(&self, key: &Value, mut doc: Document) -> Result<()> {
        let Value::Object(m) = &mut doc else {
            bail!("document must be an object");
        };
        m.insert(self.identity.field().to_string(), key.clone());
        let mut guard = self.write();
        let pos = self.identity.position_of(&guard, key).ok_or_else(|| anyhow!("no document with id {}", key))?;
        guard[pos] = doc.clone();
        let full = self.update_lookup.then_some(doc);
        self.emit(ChangeEvent::update(key.clone(), full));
        Ok(())
    }

    /// Remove the document with id `key`, returning it.
    pub fn delete(&self, key: &Value) -> Result<Document> {
        let mut guard = self.write();
        let pos = self.identity.position_of(&guard, key).ok_or_else(|| anyhow!("no document with id {}", key))?;
        let doc = guard.remove(pos);
        self.emit(ChangeEvent::delete(key.clone()));
        Ok(doc)
    }

    /// Run a query against the current contents.
    pub fn query(&self, params: &QueryParams) -> Result<Vec<Document>> {
        let guard = self.read();
        let mut out = Vec::new();
        for d in guard.iter() {
            if matches(&params.filter, d)? {
                out.push(d.clone());
            }
        }
        drop(guard);
        if let Some(keys) = params.sort.as_ref().filter(|k| !k.is_empty()) {
            out.sort_by(|a, b| {
                keys.iter()
                    .map(|k| {
                        let null = Value::Null;
                        let o = compare(lookup(a, &k.field).unwrap_or(&null), lookup(b, &k.field).unwrap_or(&null));
                        match k.direction { Direction::Asc => o, Direction::Desc => o.reverse() }
                    })
                    .find(|o| o.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        let skip = usize::try_from(params.skip).unwrap_or(usize::MAX);
        let take = match params.limit {
            0 => usize::MAX,
            n => usize::try_from(n).unwrap_or(usize::MAX),
        };
        Ok(out.into_iter().skip(skip).take(take).collect())
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Document>> { self.docs.read().unwrap_or_else(PoisonError::into_inner) }
    fn write(&self) -> RwLockWriteGuard<'_, Vec<Document>> { self.docs.write().unwrap_or_else(PoisonError::into_inner) }

    fn with_id(&self, mut doc: Document) -> Result<Document> {
        let Value::Object(m) = &mut doc else {
            bail!("document must be an object");
        };
        let field = self.identity.field();
        if m.get(field).map_or(true, Value::is_null) {
            m.insert(field.to_string(), Value::String(Uuid::new_v4().to_string()));
        }
        Ok(doc)
    }

    fn key(&self, doc: &Document) -> Result<Value> {
        self.identity.key_of(doc).cloned().ok_or_else(|| anyhow!("document has no {}", self.identity.field()))
    }

    fn ensure_absent(&self, docs: &[Document], doc: &Document) -> Result<()> {
        let key = self.key(doc)?;
        if self.identity.position_of(docs, &key).is_some() {
            bail!("duplicate id {}", key);
        }
        Ok(())
    }

    /// Called with the write lock held so the feed order matches the write order.
    fn emit(&self, event: ChangeEvent) {
        let raw = event.to_raw(self.identity.field());
        let receivers = self.events.send(raw).unwrap_or(0);
        debug!(op = event.operation.as_str(), receivers, "collection change");
    }
}

#[async_trait]
impl DataSource for MemoryCollection {
    async fn fetch(&self, params: &QueryParams) -> Result<Vec<Document>> { self.query(params) }

    async fn watch(&self) -> Result<RawChangeStream> {
        let rx = self.events.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(v) => Some((Ok(v), rx)),
                Err(RecvError::Lagged(n)) => {
                    warn!(skipped = n, "watcher lagged");
                    Some((Err(anyhow!("change stream lagged by {} events", n)), rx))
                }
                Err(RecvError::Closed) => None,
            }
        });
        Ok(stream.boxed())
    }
}
