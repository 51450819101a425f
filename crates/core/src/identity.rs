//! Document identity: which field carries the key and how two keys compare.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Equality over identity values. Ids may be opaque (binary, wrapped) and
/// must compare by value.
pub trait KeyEquivalence: Send + Sync {
    fn same_key(&self, a: &Value, b: &Value) -> bool;
}

/// Plain JSON equality.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralEq;

impl KeyEquivalence for StructuralEq {
    fn same_key(&self, a: &Value, b: &Value) -> bool { a == b }
}

/// Compares rendered forms: `"abc"`, `{"$oid": "abc"}` and `{"$uuid": "abc"}`
/// are the same key, `7` and `"7"` are the same key.
#[derive(Debug, Clone, Copy, Default)]
pub struct CanonicalEq;

impl CanonicalEq {
    fn render(v: &Value) -> Option<String> {
        match v {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Object(map) if map.len() == 1 => {
                match map.iter().next() {
                    Some((k, Value::String(s))) if k.starts_with('$') => Some(s.clone()),
                    _ => serde_json::to_string(v).ok(),
                }
            }
            _ => serde_json::to_string(v).ok(),
        }
    }
}

impl KeyEquivalence for CanonicalEq {
    fn same_key(&self, a: &Value, b: &Value) -> bool {
        match (Self::render(a), Self::render(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }
}

/// Identity capability resolved once per cache instance.
#[derive(Clone)]
pub struct Identity {
    field: String,
    eq: Arc<dyn KeyEquivalence>,
}

impl Identity {
    pub fn new(field: impl Into<String>, eq: Arc<dyn KeyEquivalence>) -> Self {
        Self { field: field.into(), eq }
    }

    pub fn structural(field: impl Into<String>) -> Self { Self::new(field, Arc::new(StructuralEq)) }
    pub fn canonical(field: impl Into<String>) -> Self { Self::new(field, Arc::new(CanonicalEq)) }

    pub fn field(&self) -> &str { &self.field }

    pub fn key_of<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        doc.get(&self.field).filter(|v| !v.is_null())
    }

    pub fn same_key(&self, a: &Value, b: &Value) -> bool { self.eq.same_key(a, b) }

    /// True when both documents carry a key and the keys are equal.
    /// Documents without a key never match anything.
    pub fn same_document(&self, a: &Value, b: &Value) -> bool {
        match (self.key_of(a), self.key_of(b)) {
            (Some(x), Some(y)) => self.same_key(x, y),
            _ => false,
        }
    }

    pub fn has_key(&self, doc: &Value, key: &Value) -> bool {
        self.key_of(doc).map(|k| self.same_key(k, key)).unwrap_or(false)
    }

    pub fn position_of(&self, docs: &[Value], key: &Value) -> Option<usize> {
        docs.iter().position(|d| self.has_key(d, key))
    }
}

impl Default for Identity {
    fn default() -> Self { Self::canonical("_id") }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity").field("field", &self.field).finish_non_exhaustive()
    }
}
