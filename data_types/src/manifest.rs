use crate::NamespaceSchema;
use serde::{Deserialize, Serialize};

/// One data file tracked by a namespace manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Store-relative path of the Parquet file.
    pub path: String,
    /// Size in bytes.
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
    /// SHA-256 of the file contents, hex-encoded.
    #[serde(rename = "contentHash")]
    pub content_hash: String,
}

/// Per-namespace metadata: the current file list, schema and snapshot
/// pointer.
///
/// The manifest is the unit of cross-process coordination: every update
/// goes through a compare-and-swap against the ETag it was read at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Live data files of the namespace.
    #[serde(default)]
    pub files: Vec<ManifestFile>,
    /// Declared schema, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<NamespaceSchema>,
    /// Pointer to the latest metadata snapshot (iceberg layout).
    #[serde(
        rename = "latestSnapshot",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub latest_snapshot: Option<String>,
    /// Optional monotonically increasing version hint.
    #[serde(
        rename = "versionHint",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub version_hint: Option<u64>,
}

impl Manifest {
    /// Total bytes across tracked files.
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }

    /// Remove `paths` from the file list, returning how many were removed.
    pub fn remove_files(&mut self, paths: &[String]) -> usize {
        let before = self.files.len();
        self.files.retain(|f| !paths.contains(&f.path));
        before - self.files.len()
    }
}

/// Operation recorded by an iceberg-style metadata snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotOperation {
    /// New files were added.
    Append,
    /// Files were rewritten (compaction, bulk update).
    Overwrite,
    /// Files were removed.
    Delete,
}

/// One iceberg-style table snapshot inside `<n>.metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    /// Snapshot sequence number.
    #[serde(rename = "snapshotId")]
    pub snapshot_id: u64,
    /// When the snapshot was committed (ms since epoch).
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: i64,
    /// What produced the snapshot.
    pub operation: SnapshotOperation,
    /// Data files live as of this snapshot.
    pub files: Vec<ManifestFile>,
    /// Records across the live files.
    #[serde(rename = "recordCount")]
    pub record_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_file_accounting() {
        let mut m = Manifest {
            files: vec![
                ManifestFile {
                    path: "data/posts/a.parquet".into(),
                    size_bytes: 100,
                    content_hash: "aa".into(),
                },
                ManifestFile {
                    path: "data/posts/b.parquet".into(),
                    size_bytes: 50,
                    content_hash: "bb".into(),
                },
            ],
            ..Default::default()
        };
        assert_eq!(m.total_bytes(), 150);
        assert_eq!(m.remove_files(&["data/posts/a.parquet".to_string()]), 1);
        assert_eq!(m.total_bytes(), 50);
    }

    #[test]
    fn snapshot_operation_wire_names() {
        let snap = TableSnapshot {
            snapshot_id: 3,
            timestamp_ms: 1_000,
            operation: SnapshotOperation::Overwrite,
            files: vec![],
            record_count: 0,
        };
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"operation\":\"overwrite\""));
    }
}
