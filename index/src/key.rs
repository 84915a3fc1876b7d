use data_types::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// An index key: one value, or a tuple of values for composite indexes.
///
/// Uniqueness is tuple-wide, equality/hashing go through the canonical
/// JSON encoding (so `1.0` and `1` stay distinct keys), and ordering uses
/// the total value order so SST range scans behave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexKey(Vec<Value>);

impl IndexKey {
    /// Single-component key.
    pub fn single(value: Value) -> Self {
        Self(vec![value])
    }

    /// Composite key from path components.
    pub fn composite(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// The key components.
    pub fn components(&self) -> &[Value] {
        &self.0
    }

    /// True when every component is null, the shape `sparse` indexes
    /// exempt from uniqueness.
    pub fn is_null_like(&self) -> bool {
        self.0.iter().all(|v| v.is_null())
    }

    /// Canonical string encoding, used for hashing and diagnostics.
    pub fn encode(&self) -> String {
        serde_json::to_string(&self.0).expect("values serialize")
    }
}

impl From<Value> for IndexKey {
    fn from(value: Value) -> Self {
        Self::single(value)
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl Hash for IndexKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // must agree with the Ord-based equality: Int(1) == Float(1.0), so
        // both numeric kinds hash through their f64 bits
        for v in &self.0 {
            hash_value(v, state);
        }
        self.0.len().hash(state);
    }
}

fn hash_value<H: Hasher>(v: &Value, state: &mut H) {
    match v {
        Value::Null => 0u8.hash(state),
        Value::Bool(b) => {
            1u8.hash(state);
            b.hash(state);
        }
        Value::Int(i) => {
            2u8.hash(state);
            (*i as f64).to_bits().hash(state);
        }
        Value::Float(f) => {
            2u8.hash(state);
            f.to_bits().hash(state);
        }
        Value::String(s) => {
            3u8.hash(state);
            s.hash(state);
        }
        Value::Date(ms) => {
            4u8.hash(state);
            ms.hash(state);
        }
        Value::Array(items) => {
            5u8.hash(state);
            for item in items {
                hash_value(item, state);
            }
            items.len().hash(state);
        }
        Value::Object(map) => {
            6u8.hash(state);
            for (k, item) in map {
                k.hash(state);
                hash_value(item, state);
            }
            map.len().hash(state);
        }
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            match a.cmp_total(b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_value_order() {
        let a = IndexKey::single(Value::Int(1));
        let b = IndexKey::single(Value::Int(2));
        let c = IndexKey::single(Value::Float(1.5));
        assert!(a < b);
        assert!(a < c && c < b);
    }

    #[test]
    fn composite_compares_lexicographically() {
        let a = IndexKey::composite(vec![Value::from("x"), Value::Int(1)]);
        let b = IndexKey::composite(vec![Value::from("x"), Value::Int(2)]);
        let c = IndexKey::composite(vec![Value::from("y"), Value::Int(0)]);
        assert!(a < b && b < c);

        // a strict prefix sorts first
        let short = IndexKey::composite(vec![Value::from("x")]);
        assert!(short < a);
    }

    #[test]
    fn null_like_detection() {
        assert!(IndexKey::single(Value::Null).is_null_like());
        assert!(IndexKey::composite(vec![Value::Null, Value::Null]).is_null_like());
        assert!(!IndexKey::composite(vec![Value::Null, Value::Int(1)]).is_null_like());
    }

    #[test]
    fn hash_equals_follow_equality() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(IndexKey::single(Value::from("a")), 1);
        assert_eq!(map.get(&IndexKey::single(Value::from("a"))), Some(&1));
        assert_eq!(map.get(&IndexKey::single(Value::from("b"))), None);

        // hash distinguishes value kinds: cross-kind equality is by value
        // order, where Int(1) and Float(1.0) compare equal
        assert_eq!(
            IndexKey::single(Value::Int(1)),
            IndexKey::single(Value::Float(1.0))
        );
    }
}
