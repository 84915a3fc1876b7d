use data_types::{Document, EntityId, NamespaceSchema, RelationshipDef, Value};
use std::collections::{BTreeMap, BTreeSet};

/// One forward link found in an entity body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardLink {
    /// Field name on the source entity.
    pub relation: String,
    /// Name the target side sees the relation under.
    pub inverse: String,
    /// The linked-to entity.
    pub target: EntityId,
}

/// Read the declared forward links out of a body.
///
/// Only relations the schema declares as forward count; the stored shape
/// is a canonical id string or a list of them. Dangling strings that do
/// not parse as canonical ids are skipped.
pub fn extract_forward_links(schema: &NamespaceSchema, body: &Document) -> Vec<ForwardLink> {
    let mut links = vec![];
    for (relation, def) in schema.forward_relations() {
        let RelationshipDef::Forward { inverse, .. } = def else {
            continue;
        };
        let Some(value) = body.get(relation) else {
            continue;
        };
        let mut push = |raw: &str| {
            if let Ok(target) = EntityId::parse_canonical(raw) {
                links.push(ForwardLink {
                    relation: relation.to_string(),
                    inverse: inverse.clone(),
                    target,
                });
            }
        };
        match value {
            Value::String(raw) => push(raw),
            Value::Array(items) => {
                for item in items {
                    if let Some(raw) = item.as_str() {
                        push(raw);
                    }
                }
            }
            _ => {}
        }
    }
    links
}

/// The reverse relationship index:
/// `(target_ns, target_id, inverse_name) -> sources`.
///
/// Pure lookups, no back-pointers: the index is fully reconstructible
/// from the forward links stored in entity bodies, and every transaction
/// that edits forward links repairs it (and un-repairs it on rollback).
#[derive(Debug, Default)]
pub struct RelationshipIndex {
    map: BTreeMap<(String, String, String), BTreeSet<String>>,
}

impl RelationshipIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(target: &EntityId, inverse: &str) -> (String, String, String) {
        (
            target.namespace().to_string(),
            target.local_id().to_string(),
            inverse.to_string(),
        )
    }

    /// Record that `source` links to `target` under `inverse`.
    pub fn add(&mut self, target: &EntityId, inverse: &str, source: &EntityId) {
        self.map
            .entry(Self::key(target, inverse))
            .or_default()
            .insert(source.canonical());
    }

    /// Drop the link from `source` to `target` under `inverse`.
    pub fn remove(&mut self, target: &EntityId, inverse: &str, source: &EntityId) {
        let key = Self::key(target, inverse);
        if let Some(sources) = self.map.get_mut(&key) {
            sources.remove(&source.canonical());
            if sources.is_empty() {
                self.map.remove(&key);
            }
        }
    }

    /// Canonical ids of the entities linking to `target` under `inverse`.
    pub fn sources(&self, target: &EntityId, inverse: &str) -> Vec<String> {
        self.map
            .get(&Self::key(target, inverse))
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Index every forward link of `source`.
    pub fn add_links(&mut self, source: &EntityId, links: &[ForwardLink]) {
        for link in links {
            self.add(&link.target, &link.inverse, source);
        }
    }

    /// Drop every forward link of `source`.
    pub fn remove_links(&mut self, source: &EntityId, links: &[ForwardLink]) {
        for link in links {
            self.remove(&link.target, &link.inverse, source);
        }
    }

    /// Replace the indexed links of `source`: used when an update changed
    /// its forward links, and inverted verbatim on rollback.
    pub fn replace_links(
        &mut self,
        source: &EntityId,
        old_links: &[ForwardLink],
        new_links: &[ForwardLink],
    ) {
        self.remove_links(source, old_links);
        self.add_links(source, new_links);
    }

    /// Number of `(target, inverse)` keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Rebuild from scratch out of entity bodies.
    pub fn rebuild<'a>(
        &mut self,
        entries: impl Iterator<Item = (&'a EntityId, &'a NamespaceSchema, &'a Document)>,
    ) {
        self.map.clear();
        for (id, schema, body) in entries {
            let links = extract_forward_links(schema, body);
            self.add_links(id, &links);
        }
    }
}
