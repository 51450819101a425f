//! Change-feed events and the positional change descriptors derived from them.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::identity::Identity;

/// Opaque record with an extractable identity field.
pub type Document = Value;

/// Operation type carried by a change event. Anything the cache does not
/// branch on specifically (replace, drop, invalidate, malformed input) is `Other`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Other,
}

impl Operation {
    pub fn parse(s: &str) -> Self {
        match s {
            "insert" => Self::Insert,
            "update" => Self::Update,
            "delete" => Self::Delete,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Other => "other",
        }
    }
}

/// One upstream change notification, not pre-filtered by query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub operation: Operation,
    /// Identity value of the changed document.
    pub document_key: Option<Value>,
    pub full_document: Option<Document>,
}

impl ChangeEvent {
    pub fn insert(key: Value, doc: Document) -> Self {
        Self { operation: Operation::Insert, document_key: Some(key), full_document: Some(doc) }
    }

    pub fn update(key: Value, doc: Option<Document>) -> Self {
        Self { operation: Operation::Update, document_key: Some(key), full_document: doc }
    }

    pub fn delete(key: Value) -> Self {
        Self { operation: Operation::Delete, document_key: Some(key), full_document: None }
    }

    pub fn other() -> Self {
        Self { operation: Operation::Other, document_key: None, full_document: None }
    }

    /// Parse a change-stream shaped value:
    /// `{ "operationType": .., "documentKey": { <id>: .. }, "fullDocument": {..} }`.
    ///
    /// Never fails. Unknown operation types, or an insert/update/delete without
    /// a resolvable key, come back as `Operation::Other`, which always takes
    /// the refetch path.
    pub fn from_raw(raw: &Value, identity: &Identity) -> Self {
        let parsed = raw
            .get("operationType")
            .and_then(|v| v.as_str())
            .map(Operation::parse)
            .unwrap_or(Operation::Other);
        let full_document = raw.get("fullDocument").filter(|d| d.is_object()).cloned();
        let document_key = match raw.get("documentKey") {
            Some(k @ Value::Object(_)) => identity.key_of(k).cloned(),
            Some(Value::Null) | None => None,
            Some(k) => Some(k.clone()),
        }
        .or_else(|| full_document.as_ref().and_then(|d| identity.key_of(d)).cloned());
        let operation = match parsed {
            Operation::Insert | Operation::Update | Operation::Delete if document_key.is_none() => Operation::Other,
            op => op,
        };
        Self { operation, document_key, full_document }
    }

    /// Inverse of `from_raw` for a given identity field.
    pub fn to_raw(&self, id_field: &str) -> Value {
        let mut out = json!({ "operationType": self.operation.as_str() });
        if let Some(key) = &self.document_key {
            out["documentKey"] = json!({ id_field: key });
        }
        if let Some(doc) = &self.full_document {
            out["fullDocument"] = doc.clone();
        }
        out
    }

    /// Full document usable for an in-place patch (update events only).
    pub fn patch_document(&self) -> Option<&Document> {
        match self.operation {
            Operation::Update => self.full_document.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Which single slot of a cached list changed. Ephemeral; handed to
/// subscriber callbacks next to the refreshed list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeDescriptor {
    pub operation: ChangeKind,
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Document>,
}

impl ChangeDescriptor {
    pub fn insert(position: usize, doc: Document) -> Self {
        Self { operation: ChangeKind::Insert, position, document: Some(doc) }
    }

    pub fn update(position: usize, doc: Document) -> Self {
        Self { operation: ChangeKind::Update, position, document: Some(doc) }
    }

    pub fn delete(position: usize) -> Self {
        Self { operation: ChangeKind::Delete, position, document: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_change_stream_shape() {
        let id = Identity::default();
        let raw = json!({
            "operationType": "update",
            "documentKey": {"_id": "2"},
            "fullDocument": {"_id": "2", "n": 20},
        });
        let ev = ChangeEvent::from_raw(&raw, &id);
        assert_eq!(ev.operation, Operation::Update);
        assert_eq!(ev.document_key, Some(json!("2")));
        assert_eq!(ev.patch_document(), Some(&json!({"_id": "2", "n": 20})));
    }

    #[test]
    fn unknown_and_malformed_become_other() {
        let id = Identity::default();
        assert_eq!(ChangeEvent::from_raw(&json!({"operationType": "replace", "documentKey": {"_id": 1}}), &id).operation, Operation::Other);
        assert_eq!(ChangeEvent::from_raw(&json!({"documentKey": {"_id": 1}}), &id).operation, Operation::Other);
        assert_eq!(ChangeEvent::from_raw(&json!({"operationType": "delete"}), &id).operation, Operation::Other);
        assert_eq!(ChangeEvent::from_raw(&json!("garbage"), &id).operation, Operation::Other);
    }

    #[test]
    fn key_falls_back_to_full_document() {
        let id = Identity::default();
        let ev = ChangeEvent::from_raw(&json!({"operationType": "insert", "fullDocument": {"_id": 9}}), &id);
        assert_eq!(ev.operation, Operation::Insert);
        assert_eq!(ev.document_key, Some(json!(9)));
    }

    #[test]
    fn scalar_document_key_is_accepted() {
        let id = Identity::default();
        let ev = ChangeEvent::from_raw(&json!({"operationType": "delete", "documentKey": "k1"}), &id);
        assert_eq!(ev.operation, Operation::Delete);
        assert_eq!(ev.document_key, Some(json!("k1")));
    }

    #[test]
    fn raw_round_trip_keeps_shape() {
        let id = Identity::structural("uid");
        let ev = ChangeEvent::update(json!("a"), Some(json!({"uid": "a", "v": 1})));
        let raw = ev.to_raw(id.field());
        assert_eq!(raw["documentKey"], json!({"uid": "a"}));
        assert_eq!(ChangeEvent::from_raw(&raw, &id), ev);
    }

    #[test]
    fn only_updates_patch_in_place() {
        let doc = json!({"_id": 1});
        assert!(ChangeEvent::insert(json!(1), doc.clone()).patch_document().is_none());
        assert!(ChangeEvent::update(json!(1), None).patch_document().is_none());
        assert!(ChangeEvent::update(json!(1), Some(doc)).patch_document().is_some());
    }

    #[test]
    fn delete_descriptor_serializes_without_document() {
        let v = serde_json::to_value(ChangeDescriptor::delete(3)).unwrap();
        assert_eq!(v, json!({"operation": "delete", "position": 3}));
    }
}
