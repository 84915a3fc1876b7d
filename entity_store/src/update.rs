use crate::{Result, ValidationSnafu};
use data_types::{get_path, remove_path, set_path, Document, EntityId, Value};
use snafu::ensure;
use std::collections::BTreeMap;

/// Parsed update operators, applied atomically under the version check.
///
/// `$set` replaces fields, `$unset` removes them, `$inc` adds to numeric
/// fields, `$link`/`$unlink` edit forward relationship fields (storing
/// canonical `"ns/id"` strings, one or a list).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateDoc {
    set: Document,
    unset: Vec<String>,
    inc: BTreeMap<String, f64>,
    link: BTreeMap<String, Vec<EntityId>>,
    unlink: BTreeMap<String, Vec<EntityId>>,
}

impl UpdateDoc {
    /// Empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// `$set` a field (dot-paths descend).
    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(path.into(), value.into());
        self
    }

    /// `$unset` a field.
    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.unset.push(path.into());
        self
    }

    /// `$inc` a numeric field.
    pub fn inc(mut self, path: impl Into<String>, by: f64) -> Self {
        *self.inc.entry(path.into()).or_insert(0.0) += by;
        self
    }

    /// `$link` a forward relationship to `target`.
    pub fn link(mut self, relation: impl Into<String>, target: EntityId) -> Self {
        self.link.entry(relation.into()).or_default().push(target);
        self
    }

    /// `$unlink` a forward relationship from `target`.
    pub fn unlink(mut self, relation: impl Into<String>, target: EntityId) -> Self {
        self.unlink.entry(relation.into()).or_default().push(target);
        self
    }

    /// Whether the update touches relationship fields.
    pub fn touches_links(&self) -> bool {
        !self.link.is_empty() || !self.unlink.is_empty()
    }

    /// Relations named by `$link`/`$unlink`.
    pub fn linked_relations(&self) -> impl Iterator<Item = &str> {
        self.link.keys().chain(self.unlink.keys()).map(String::as_str)
    }

    /// Apply to a body, yielding the new body.
    pub fn apply(&self, body: &Document) -> Result<Document> {
        let mut next = body.clone();

        for (path, value) in &self.set {
            set_path(&mut next, path, value.clone());
        }
        for path in &self.unset {
            remove_path(&mut next, path);
        }
        for (path, by) in &self.inc {
            let current = match get_path(&next, path) {
                None | Some(Value::Null) => 0.0,
                Some(v) => {
                    ensure!(
                        v.as_f64().is_some(),
                        ValidationSnafu {
                            reason: format!("$inc target {path:?} is not numeric"),
                        }
                    );
                    v.as_f64().expect("checked numeric")
                }
            };
            let next_value = current + by;
            // keep integers integral when both sides are
            let value = if next_value.fract() == 0.0
                && by.fract() == 0.0
                && matches!(get_path(&next, path), None | Some(Value::Int(_)) | Some(Value::Null))
            {
                Value::Int(next_value as i64)
            } else {
                Value::Float(next_value)
            };
            set_path(&mut next, path, value);
        }

        for (relation, targets) in &self.link {
            for target in targets {
                link_forward(&mut next, relation, target);
            }
        }
        for (relation, targets) in &self.unlink {
            for target in targets {
                unlink_forward(&mut next, relation, target);
            }
        }

        Ok(next)
    }
}

/// Add a forward link: a single link stays a string, a second link turns
/// the field into a list.
fn link_forward(body: &mut Document, relation: &str, target: &EntityId) {
    let canonical = target.canonical();
    match body.get_mut(relation) {
        None | Some(Value::Null) => {
            body.insert(relation.to_string(), Value::String(canonical));
        }
        Some(Value::String(existing)) => {
            if *existing != canonical {
                let first = existing.clone();
                body.insert(
                    relation.to_string(),
                    Value::Array(vec![Value::String(first), Value::String(canonical)]),
                );
            }
        }
        Some(Value::Array(items)) => {
            if !items.iter().any(|v| v.as_str() == Some(&canonical)) {
                items.push(Value::String(canonical));
            }
        }
        Some(other) => {
            *other = Value::String(canonical);
        }
    }
}

fn unlink_forward(body: &mut Document, relation: &str, target: &EntityId) {
    let canonical = target.canonical();
    match body.get_mut(relation) {
        Some(Value::String(existing)) if *existing == canonical => {
            body.remove(relation);
        }
        Some(Value::Array(items)) => {
            items.retain(|v| v.as_str() != Some(&canonical));
            if items.is_empty() {
                body.remove(relation);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use data_types::doc;

    #[test]
    fn set_unset_inc() {
        let body = doc! {"title" => "V1", "views" => 10i64};
        let update = UpdateDoc::new()
            .set("title", "V2")
            .set("meta.lang", "en")
            .unset("views")
            .inc("likes", 3.0);

        let next = update.apply(&body).unwrap();
        assert_eq!(next.get("title"), Some(&Value::String("V2".into())));
        assert_eq!(get_path(&next, "meta.lang"), Some(&Value::String("en".into())));
        assert_eq!(next.get("views"), None);
        assert_eq!(next.get("likes"), Some(&Value::Int(3)));
    }

    #[test]
    fn inc_preserves_integer_shape() {
        let body = doc! {"n" => 10i64, "f" => 1.5f64};
        let next = UpdateDoc::new().inc("n", 5.0).inc("f", 1.0).apply(&body).unwrap();
        assert_eq!(next.get("n"), Some(&Value::Int(15)));
        assert_eq!(next.get("f"), Some(&Value::Float(2.5)));
    }

    #[test]
    fn inc_rejects_non_numeric() {
        let body = doc! {"title" => "x"};
        let err = UpdateDoc::new().inc("title", 1.0).apply(&body).unwrap_err();
        assert_matches!(err, crate::Error::Validation { .. });
    }

    #[test]
    fn link_promotes_to_list() {
        let u1 = EntityId::new("users", "u1").unwrap();
        let u2 = EntityId::new("users", "u2").unwrap();

        let body = Document::new();
        let next = UpdateDoc::new().link("author", u1.clone()).apply(&body).unwrap();
        assert_eq!(next.get("author"), Some(&Value::String("users/u1".into())));

        // linking the same target twice is idempotent
        let next = UpdateDoc::new().link("author", u1.clone()).apply(&next).unwrap();
        assert_eq!(next.get("author"), Some(&Value::String("users/u1".into())));

        let next = UpdateDoc::new().link("author", u2).apply(&next).unwrap();
        assert_eq!(
            next.get("author"),
            Some(&Value::Array(vec![
                Value::String("users/u1".into()),
                Value::String("users/u2".into()),
            ]))
        );
    }

    #[test]
    fn unlink_removes_and_collapses() {
        let u1 = EntityId::new("users", "u1").unwrap();
        let u2 = EntityId::new("users", "u2").unwrap();

        let body = Document::new();
        let linked = UpdateDoc::new()
            .link("author", u1.clone())
            .link("author", u2.clone())
            .apply(&body)
            .unwrap();

        let next = UpdateDoc::new().unlink("author", u1).apply(&linked).unwrap();
        assert_eq!(
            next.get("author"),
            Some(&Value::Array(vec![Value::String("users/u2".into())]))
        );

        let next = UpdateDoc::new().unlink("author", u2).apply(&next).unwrap();
        assert_eq!(next.get("author"), None);

        // unlinking something absent is a no-op
        let lone = EntityId::new("users", "u9").unwrap();
        let next = UpdateDoc::new().unlink("author", lone).apply(&next).unwrap();
        assert_eq!(next.get("author"), None);
    }
}
