use crate::{Result, ValidationSnafu};
use data_types::{Document, Value};
use snafu::ensure;

/// Keys the system maintains; user-supplied bodies must not carry them.
const RESERVED_KEYS: &[&str] = &[
    "$id",
    "$type",
    "version",
    "createdAt",
    "updatedAt",
    "createdBy",
    "updatedBy",
    "deletedAt",
    "deletedBy",
];

/// One rejected document and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidDocument {
    /// Position in the submitted batch.
    pub index: usize,
    /// What was wrong.
    pub reason: String,
}

/// The `{valid, invalid}` split of a submitted batch.
///
/// Invalid entries are counted and reported; they only abort the batch
/// when the caller asked for `throw_on_error`.
#[derive(Debug, Default)]
pub struct ValidationSplit {
    /// Documents that passed, in submission order.
    pub valid: Vec<Document>,
    /// Rejected documents with their positions.
    pub invalid: Vec<InvalidDocument>,
}

fn check_document(doc: &Document) -> std::result::Result<(), String> {
    for key in doc.keys() {
        if RESERVED_KEYS.contains(&key.as_str()) {
            return Err(format!("reserved field {key:?} in body"));
        }
        if key.is_empty() {
            return Err("empty field name".to_string());
        }
    }
    // forward-link shaped values must at least be strings or string lists
    for (key, value) in doc {
        if let Value::Object(nested) = value {
            if nested.keys().any(|k| k.starts_with('$') && k != "$date") {
                return Err(format!("operator key inside body field {key:?}"));
            }
        }
    }
    Ok(())
}

/// Split a batch into valid and invalid documents.
pub fn validate_batch(bodies: &[Document]) -> ValidationSplit {
    let mut split = ValidationSplit::default();
    for (index, body) in bodies.iter().enumerate() {
        match check_document(body) {
            Ok(()) => split.valid.push(body.clone()),
            Err(reason) => split.invalid.push(InvalidDocument { index, reason }),
        }
    }
    split
}

/// Validate and fail on the first invalid document.
pub fn validate_batch_strict(bodies: &[Document]) -> Result<Vec<Document>> {
    let split = validate_batch(bodies);
    ensure!(
        split.invalid.is_empty(),
        ValidationSnafu {
            reason: format!(
                "document {} invalid: {}",
                split.invalid[0].index, split.invalid[0].reason
            ),
        }
    );
    Ok(split.valid)
}
