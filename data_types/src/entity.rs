use crate::{Document, EntityId, Value};
use serde::{Deserialize, Serialize};

/// System-maintained metadata of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMeta {
    /// Schema tag, if the namespace declares one.
    #[serde(rename = "$type", default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    /// Monotonically increasing, starts at 1 on create.
    pub version: u64,
    /// Creation timestamp (ms since epoch).
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    /// Last-update timestamp (ms since epoch); never decreases.
    #[serde(rename = "updatedAt")]
    pub updated_at: i64,
    /// Actor that created the entity.
    #[serde(rename = "createdBy", default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Actor of the last update.
    #[serde(rename = "updatedBy", default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    /// Soft-delete timestamp; set entities are hidden from default queries.
    #[serde(rename = "deletedAt", default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
    /// Actor of the soft delete.
    #[serde(rename = "deletedBy", default, skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,
}

impl EntityMeta {
    /// Metadata for a freshly created entity.
    pub fn new(created_at: i64, created_by: Option<String>) -> Self {
        Self {
            entity_type: None,
            version: 1,
            created_at,
            updated_at: created_at,
            created_by: created_by.clone(),
            updated_by: created_by,
            deleted_at: None,
            deleted_by: None,
        }
    }

    /// True once the entity is soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A document with stable identity and versioned metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identity.
    #[serde(rename = "$id")]
    pub id: EntityId,
    /// System metadata.
    #[serde(flatten)]
    pub meta: EntityMeta,
    /// User fields.
    #[serde(flatten)]
    pub body: Document,
}

impl Entity {
    /// Create a new version-1 entity.
    pub fn new(id: EntityId, body: Document, created_at: i64, actor: Option<String>) -> Self {
        Self {
            id,
            meta: EntityMeta::new(created_at, actor),
            body,
        }
    }

    /// Flatten into a single document: `$id` + metadata fields + body.
    ///
    /// This is the shape events carry in `before`/`after` and the shape
    /// rows take inside data files.
    pub fn to_full_document(&self) -> Document {
        let mut doc = self.body.clone();
        doc.insert("$id".to_string(), Value::String(self.id.canonical()));
        if let Some(t) = &self.meta.entity_type {
            doc.insert("$type".to_string(), Value::String(t.clone()));
        }
        doc.insert("version".to_string(), Value::Int(self.meta.version as i64));
        doc.insert("createdAt".to_string(), Value::Date(self.meta.created_at));
        doc.insert("updatedAt".to_string(), Value::Date(self.meta.updated_at));
        if let Some(a) = &self.meta.created_by {
            doc.insert("createdBy".to_string(), Value::String(a.clone()));
        }
        if let Some(a) = &self.meta.updated_by {
            doc.insert("updatedBy".to_string(), Value::String(a.clone()));
        }
        if let Some(ts) = self.meta.deleted_at {
            doc.insert("deletedAt".to_string(), Value::Date(ts));
        }
        if let Some(a) = &self.meta.deleted_by {
            doc.insert("deletedBy".to_string(), Value::String(a.clone()));
        }
        doc
    }

    /// Rebuild from the flattened form produced by [`Self::to_full_document`].
    pub fn from_full_document(mut doc: Document) -> Option<Self> {
        let id = match doc.remove("$id")? {
            Value::String(s) => EntityId::parse_canonical(&s).ok()?,
            _ => return None,
        };
        let entity_type = match doc.remove("$type") {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };
        let version = match doc.remove("version")? {
            Value::Int(v) if v >= 1 => v as u64,
            _ => return None,
        };
        let date = |v: Option<Value>| match v {
            Some(Value::Date(ms)) => Some(ms),
            Some(Value::Int(ms)) => Some(ms),
            _ => None,
        };
        let string = |v: Option<Value>| match v {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };

        let created_at = date(doc.remove("createdAt"))?;
        let updated_at = date(doc.remove("updatedAt"))?;
        let created_by = string(doc.remove("createdBy"));
        let updated_by = string(doc.remove("updatedBy"));
        let deleted_at = date(doc.remove("deletedAt"));
        let deleted_by = string(doc.remove("deletedBy"));

        Some(Self {
            id,
            meta: EntityMeta {
                entity_type,
                version,
                created_at,
                updated_at,
                created_by,
                updated_by,
                deleted_at,
                deleted_by,
            },
            body: doc,
        })
    }
}
