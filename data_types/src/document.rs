use crate::Value;
use std::collections::BTreeMap;

/// An open-keyed document body.
pub type Document = BTreeMap<String, Value>;

/// Look up a possibly dot-separated path inside a document.
///
/// `get_path(doc, "a.b.c")` descends through nested objects; any missing or
/// non-object intermediate yields `None`.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = doc.get(first)?;
    for segment in segments {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

/// Set `path` to `value`, creating intermediate objects as needed.
pub fn set_path(doc: &mut Document, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().expect("path is non-empty");

    let mut current = doc;
    for segment in segments {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(BTreeMap::new()));
        if !matches!(entry, Value::Object(_)) {
            *entry = Value::Object(BTreeMap::new());
        }
        current = match entry {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
    }
    current.insert(last.to_string(), value);
}

/// Remove the value at `path`. Returns the removed value, if any.
pub fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop()?;

    let mut current = doc;
    for segment in segments {
        match current.get_mut(segment) {
            Some(Value::Object(map)) => current = map,
            _ => return None,
        }
    }
    current.remove(last)
}

/// Deep-merge `patch` on top of `base`.
///
/// Nested objects merge recursively; every other value (including arrays
/// and explicit nulls) replaces wholesale.
pub fn deep_merge(base: &mut Document, patch: &Document) {
    for (key, patch_value) in patch {
        match (base.get_mut(key), patch_value) {
            (Some(Value::Object(base_map)), Value::Object(patch_map)) => {
                deep_merge(base_map, patch_map);
            }
            _ => {
                base.insert(key.clone(), patch_value.clone());
            }
        }
    }
}

/// Convenience macro building a [`Document`] from `key => value` pairs.
#[macro_export]
macro_rules! doc {
    () => { $crate::Document::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut d = $crate::Document::new();
        $(d.insert($key.to_string(), $crate::Value::from($value));)+
        d
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested() -> Document {
        let mut inner = Document::new();
        inner.insert("b".to_string(), Value::Int(1));
        let mut doc = Document::new();
        doc.insert("a".to_string(), Value::Object(inner));
        doc.insert("top".to_string(), Value::String("x".into()));
        doc
    }

    #[test]
    fn path_lookup() {
        let doc = nested();
        assert_eq!(get_path(&doc, "a.b"), Some(&Value::Int(1)));
        assert_eq!(get_path(&doc, "top"), Some(&Value::String("x".into())));
        assert_eq!(get_path(&doc, "a.missing"), None);
        assert_eq!(get_path(&doc, "top.b"), None);
    }

    #[test]
    fn set_creates_intermediates() {
        let mut doc = Document::new();
        set_path(&mut doc, "x.y.z", Value::Int(7));
        assert_eq!(get_path(&doc, "x.y.z"), Some(&Value::Int(7)));
    }

    #[test]
    fn remove_leaves_siblings() {
        let mut doc = nested();
        assert_eq!(remove_path(&mut doc, "a.b"), Some(Value::Int(1)));
        assert_eq!(get_path(&doc, "a.b"), None);
        assert!(doc.contains_key("a"));
        assert_eq!(remove_path(&mut doc, "nope.deep"), None);
    }

    #[test]
    fn merge_recurses_into_objects_only() {
        let mut base = nested();
        let mut patch_inner = Document::new();
        patch_inner.insert("c".to_string(), Value::Int(2));
        let mut patch = Document::new();
        patch.insert("a".to_string(), Value::Object(patch_inner));
        patch.insert("top".to_string(), Value::Null);

        deep_merge(&mut base, &patch);

        assert_eq!(get_path(&base, "a.b"), Some(&Value::Int(1)));
        assert_eq!(get_path(&base, "a.c"), Some(&Value::Int(2)));
        // explicit null replaces, not removes
        assert_eq!(base.get("top"), Some(&Value::Null));
    }
}
