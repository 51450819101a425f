//! Filter evaluation and value ordering for the memory collection.

use std::cmp::Ordering;

use anyhow::{anyhow, bail, Result};
use serde_json::{Map, Value};

/// Resolve a dotted path (`a.b.0.c`); numeric segments index arrays.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |cur, seg| match cur {
        Value::Object(m) => m.get(seg),
        Value::Array(a) => seg.parse::<usize>().ok().and_then(|i| a.get(i)),
        _ => None,
    })
}

/// Evaluate a query filter against one document. An empty object matches everything.
pub fn matches(filter: &Value, doc: &Value) -> Result<bool> {
    let Value::Object(clauses) = filter else {
        bail!("filter must be an object, got {}", kind(filter));
    };
    for (key, cond) in clauses {
        let ok = match key.as_str() {
            "$and" => logical(cond, doc, true)?,
            "$or" => logical(cond, doc, false)?,
            op if op.starts_with('$') => bail!("unsupported top-level operator {}", op),
            path => field_matches(lookup(doc, path), cond)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn logical(cond: &Value, doc: &Value, all: bool) -> Result<bool> {
    let parts = cond.as_array().ok_or_else(|| anyhow!("$and/$or expects an array"))?;
    for p in parts {
        if matches(p, doc)? != all {
            return Ok(!all);
        }
    }
    Ok(all)
}

fn is_operator_doc(m: &Map<String, Value>) -> bool { !m.is_empty() && m.keys().all(|k| k.starts_with('$')) }

fn field_matches(field: Option<&Value>, cond: &Value) -> Result<bool> {
    match cond {
        Value::Object(ops) if is_operator_doc(ops) => {
            for (op, arg) in ops {
                if !apply_op(field, op, arg)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        _ => Ok(equals_or_contains(field, cond)),
    }
}

fn apply_op(field: Option<&Value>, op: &str, arg: &Value) -> Result<bool> {
    Ok(match op {
        "$eq" => equals_or_contains(field, arg),
        "$ne" => !equals_or_contains(field, arg),
        "$gt" => ordered(field, arg, |o| o == Ordering::Greater),
        "$gte" => ordered(field, arg, |o| o != Ordering::Less),
        "$lt" => ordered(field, arg, |o| o == Ordering::Less),
        "$lte" => ordered(field, arg, |o| o != Ordering::Greater),
        "$in" => in_list(field, arg)?,
        "$nin" => !in_list(field, arg)?,
        "$exists" => {
            let want = arg.as_bool().ok_or_else(|| anyhow!("$exists expects a boolean"))?;
            field.is_some() == want
        }
        other => bail!("unsupported operator {}", other),
    })
}

fn in_list(field: Option<&Value>, arg: &Value) -> Result<bool> {
    let list = arg.as_array().ok_or_else(|| anyhow!("$in/$nin expects an array"))?;
    Ok(list.iter().any(|v| equals_or_contains(field, v)))
}

/// Equality, plus membership when the field holds an array. A missing field equals `null`.
fn equals_or_contains(field: Option<&Value>, want: &Value) -> bool {
    match field {
        None => want.is_null(),
        Some(v) if values_eq(v, want) => true,
        Some(Value::Array(items)) => items.iter().any(|i| values_eq(i, want)),
        Some(_) => false,
    }
}

/// Range comparisons only hold between values of the same type class.
fn ordered(field: Option<&Value>, arg: &Value, pred: impl Fn(Ordering) -> bool) -> bool {
    match field {
        Some(v) if rank(v) == rank(arg) && !v.is_null() => pred(compare(v, arg)),
        _ => false,
    }
}

fn values_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Total order used for sorting: null < numbers < strings < objects < arrays < bools.
pub fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            x.iter().zip(y).map(|(p, q)| compare(p, q)).find(|o| o.is_ne()).unwrap_or_else(|| x.len().cmp(&y.len()))
        }
        (Value::Object(_), Value::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn person() -> Value {
        json!({"_id": 1, "name": "ada", "age": 36, "tags": ["math", "eng"], "addr": {"city": "London"}})
    }

    #[test]
    fn empty_filter_matches() {
        assert!(matches(&json!({}), &person()).unwrap());
    }

    #[test]
    fn implicit_equality_and_dotted_paths() {
        let p = person();
        assert!(matches(&json!({"name": "ada", "addr.city": "London"}), &p).unwrap());
        assert!(!matches(&json!({"addr.city": "Paris"}), &p).unwrap());
        assert!(matches(&json!({"tags": "eng"}), &p).unwrap());
        assert!(matches(&json!({"tags.0": "math"}), &p).unwrap());
        assert!(matches(&json!({"age": 36.0}), &p).unwrap());
    }

    #[test]
    fn comparison_operators() {
        let p = person();
        assert!(matches(&json!({"age": {"$gt": 30, "$lte": 36}}), &p).unwrap());
        assert!(!matches(&json!({"age": {"$lt": 36}}), &p).unwrap());
        assert!(!matches(&json!({"age": {"$gt": "10"}}), &p).unwrap(), "no cross-type ordering");
        assert!(matches(&json!({"name": {"$ne": "bob"}}), &p).unwrap());
        assert!(matches(&json!({"name": {"$in": ["bob", "ada"]}}), &p).unwrap());
        assert!(matches(&json!({"name": {"$nin": ["bob"]}}), &p).unwrap());
        assert!(matches(&json!({"email": {"$exists": false}}), &p).unwrap());
        assert!(matches(&json!({"email": null}), &p).unwrap());
    }

    #[test]
    fn logical_operators() {
        let p = person();
        assert!(matches(&json!({"$or": [{"name": "bob"}, {"age": 36}]}), &p).unwrap());
        assert!(!matches(&json!({"$and": [{"name": "ada"}, {"age": 1}]}), &p).unwrap());
    }

    #[test]
    fn bad_filters_are_errors() {
        let p = person();
        assert!(matches(&json!([1]), &p).is_err());
        assert!(matches(&json!({"age": {"$regex": "x"}}), &p).is_err());
        assert!(matches(&json!({"$nor": []}), &p).is_err());
        assert!(matches(&json!({"name": {"$in": "ada"}}), &p).is_err());
    }

    #[test]
    fn ordering_across_types() {
        let mut v = vec![json!("b"), json!(true), json!(2), json!(null), json!("a"), json!(1.5)];
        v.sort_by(compare);
        assert_eq!(v, vec![json!(null), json!(1.5), json!(2), json!("a"), json!("b"), json!(true)]);
    }
}
