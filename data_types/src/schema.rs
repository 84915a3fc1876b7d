use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Column type of a typed, flat column eligible for predicate pushdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Boolean column.
    Bool,
    /// 64-bit integer column.
    Int,
    /// 64-bit float column.
    Float,
    /// UTF-8 string column.
    String,
    /// Millisecond timestamp column.
    Date,
}

/// Declared direction of a relationship field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "lowercase")]
pub enum RelationshipDef {
    /// A forward link stored in this entity's body: `-> Target.inverse`.
    Forward {
        /// Namespace the link points into.
        target_ns: String,
        /// Name under which the reverse side sees this link.
        inverse: String,
        /// Whether the field holds a list of targets.
        #[serde(default)]
        many: bool,
    },
    /// The reverse side, served by the reverse index: `<- Source.forward[]`.
    Reverse {
        /// Namespace the links come from.
        source_ns: String,
        /// The forward field name on the source side.
        forward: String,
    },
}

/// Per-namespace schema: typed columns for pushdown plus relationship
/// declarations. Everything else in a document is schemaless.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSchema {
    /// Schema tag stored as `$type` on entities of this namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    /// Flat columns with a declared type, eligible for pushdown.
    #[serde(default)]
    pub typed_columns: BTreeMap<String, ColumnType>,
    /// Relationship fields by name.
    #[serde(default)]
    pub relationships: BTreeMap<String, RelationshipDef>,
}

impl NamespaceSchema {
    /// Forward relationship names declared on this namespace.
    pub fn forward_relations(&self) -> impl Iterator<Item = (&str, &RelationshipDef)> {
        self.relationships
            .iter()
            .filter(|(_, def)| matches!(def, RelationshipDef::Forward { .. }))
            .map(|(name, def)| (name.as_str(), def))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_serde() {
        let mut schema = NamespaceSchema::default();
        schema
            .typed_columns
            .insert("age".to_string(), ColumnType::Int);
        schema.relationships.insert(
            "author".to_string(),
            RelationshipDef::Forward {
                target_ns: "users".to_string(),
                inverse: "posts".to_string(),
                many: false,
            },
        );

        let json = serde_json::to_string(&schema).unwrap();
        let back: NamespaceSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schema);
        assert_eq!(back.forward_relations().count(), 1);
    }
}
