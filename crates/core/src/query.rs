//! Query parameters and the fingerprint used as the cache key.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

/// One sort component. Key order inside a sort is significant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SortKey {
    pub field: String,
    pub direction: Direction,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self { Self { field: field.into(), direction: Direction::Asc } }
    pub fn desc(field: impl Into<String>) -> Self { Self { field: field.into(), direction: Direction::Desc } }

    /// Parse `field`, `field:asc`, `field:desc` or `-field`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() { return None; }
        if let Some(rest) = s.strip_prefix('-') {
            return (!rest.is_empty()).then(|| Self::desc(rest));
        }
        match s.split_once(':') {
            None => Some(Self::asc(s)),
            Some((f, d)) if !f.is_empty() => match d.to_ascii_lowercase().as_str() {
                "asc" | "1" => Some(Self::asc(f)),
                "desc" | "-1" => Some(Self::desc(f)),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Shape of a query against the document collection.
///
/// `filter` is an opaque predicate document interpreted by the data source.
/// `limit == 0` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryParams {
    #[serde(default = "empty_filter")]
    pub filter: Value,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub skip: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<SortKey>>,
}

fn empty_filter() -> Value { Value::Object(serde_json::Map::new()) }

impl Default for QueryParams {
    fn default() -> Self { Self { filter: empty_filter(), limit: 0, skip: 0, sort: None } }
}

impl QueryParams {
    pub fn new(filter: Value) -> Self { Self { filter, ..Self::default() } }
    pub fn with_limit(mut self, limit: u64) -> Self { self.limit = limit; self }
    pub fn with_skip(mut self, skip: u64) -> Self { self.skip = skip; self }
    pub fn with_sort(mut self, sort: Vec<SortKey>) -> Self { self.sort = Some(sort); self }

    pub fn fingerprint(&self) -> Fingerprint { Fingerprint::of(self) }
}

/// Content digest of a `QueryParams` (hex SHA-256 over a canonical encoding).
///
/// Object keys are visited in sorted order, so two parameter sets that are
/// deep-equal hash equal regardless of how their filter documents were built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(params: &QueryParams) -> Self {
        let mut h = Sha256::new();
        h.update(b"filter");
        feed_value(&mut h, &params.filter);
        h.update(b"limit");
        h.update(params.limit.to_le_bytes());
        h.update(b"skip");
        h.update(params.skip.to_le_bytes());
        h.update(b"sort");
        match &params.sort {
            None => h.update(b"-"),
            Some(keys) => {
                h.update(b"[");
                feed_len(&mut h, keys.len());
                for k in keys {
                    feed_str(&mut h, &k.field);
                    h.update(match k.direction { Direction::Asc => b"+", Direction::Desc => b"-" });
                }
            }
        }
        Self(hex::encode(h.finalize()))
    }

    /// Accepts a previously rendered fingerprint (64 lowercase hex chars).
    pub fn parse(s: &str) -> Option<Self> {
        let ok = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        ok.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str { &self.0 }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> &str { &self.0[..12.min(self.0.len())] }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

fn feed_len(h: &mut Sha256, n: usize) { h.update((n as u64).to_le_bytes()); }

fn feed_str(h: &mut Sha256, s: &str) {
    feed_len(h, s.len());
    h.update(s.as_bytes());
}

fn feed_value(h: &mut Sha256, v: &Value) {
    match v {
        Value::Null => h.update(b"n"),
        Value::Bool(b) => h.update(if *b { b"t" } else { b"f" }),
        Value::Number(n) => { h.update(b"d"); feed_str(h, &n.to_string()); }
        Value::String(s) => { h.update(b"s"); feed_str(h, s); }
        Value::Array(items) => {
            h.update(b"a");
            feed_len(h, items.len());
            for item in items { feed_value(h, item); }
        }
        Value::Object(map) => {
            h.update(b"o");
            feed_len(h, map.len());
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            for (k, v) in entries {
                feed_str(h, k);
                feed_value(h, v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"status":"open","owner":{"id":7,"team":"x"}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"owner":{"team":"x","id":7},"status":"open"}"#).unwrap();
        let pa = QueryParams::new(a).with_limit(50);
        let pb = QueryParams::new(b).with_limit(50);
        assert_eq!(pa.fingerprint(), pb.fingerprint());
    }

    #[test]
    fn every_field_participates() {
        let base = QueryParams::new(json!({"a": 1})).with_limit(10).with_skip(0);
        let fp = base.fingerprint();
        assert_ne!(fp, QueryParams::new(json!({"a": 2})).with_limit(10).fingerprint());
        assert_ne!(fp, base.clone().with_limit(11).fingerprint());
        assert_ne!(fp, base.clone().with_skip(1).fingerprint());
        assert_ne!(fp, base.clone().with_sort(vec![SortKey::asc("a")]).fingerprint());
        assert_ne!(
            base.clone().with_sort(vec![SortKey::asc("a")]).fingerprint(),
            base.clone().with_sort(vec![SortKey::desc("a")]).fingerprint()
        );
    }

    #[test]
    fn sort_key_order_is_significant() {
        let p = QueryParams::default();
        let ab = p.clone().with_sort(vec![SortKey::asc("a"), SortKey::asc("b")]).fingerprint();
        let ba = p.with_sort(vec![SortKey::asc("b"), SortKey::asc("a")]).fingerprint();
        assert_ne!(ab, ba);
    }

    #[test]
    fn string_and_number_do_not_collide() {
        let s = QueryParams::new(json!({"a": "1"})).fingerprint();
        let n = QueryParams::new(json!({"a": 1})).fingerprint();
        assert_ne!(s, n);
    }

    #[test]
    fn fingerprint_is_stable_and_parseable() {
        let fp = QueryParams::default().fingerprint();
        assert_eq!(fp, QueryParams::default().fingerprint());
        assert_eq!(fp.as_str().len(), 64);
        assert_eq!(Fingerprint::parse(fp.as_str()), Some(fp.clone()));
        assert_eq!(Fingerprint::parse("xyz"), None);
        assert_eq!(fp.short().len(), 12);
    }

    #[test]
    fn params_deserialize_with_defaults() {
        let p: QueryParams = serde_json::from_value(json!({"limit": 5, "sort": [{"field": "n", "direction": "desc"}]})).unwrap();
        assert_eq!(p.filter, json!({}));
        assert_eq!(p.limit, 5);
        assert_eq!(p.skip, 0);
        assert_eq!(p.sort, Some(vec![SortKey::desc("n")]));
    }

    #[test]
    fn sort_key_parse() {
        assert_eq!(SortKey::parse("name"), Some(SortKey::asc("name")));
        assert_eq!(SortKey::parse("-ts"), Some(SortKey::desc("ts")));
        assert_eq!(SortKey::parse("ts:desc"), Some(SortKey::desc("ts")));
        assert_eq!(SortKey::parse("ts:1"), Some(SortKey::asc("ts")));
        assert_eq!(SortKey::parse("ts:sideways"), None);
        assert_eq!(SortKey::parse(""), None);
        assert_eq!(SortKey::parse("-"), None);
    }
}
