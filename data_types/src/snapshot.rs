use crate::{Document, EventId};
use serde::{Deserialize, Serialize};

/// A full captured entity state at a known event.
///
/// Replaying the events strictly after `event_id` on top of `state` yields
/// the entity state at any later time; `sequence_number` counts how many
/// events were folded into the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot identifier.
    pub id: String,
    /// Namespace of the entity.
    pub ns: String,
    /// Local id of the entity.
    #[serde(rename = "entityId")]
    pub entity_id: String,
    /// Number of events folded into this snapshot.
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u64,
    /// Id of the last folded event.
    #[serde(rename = "eventId")]
    pub event_id: EventId,
    /// Timestamp (ms) of the last folded event.
    pub ts: i64,
    /// When the snapshot was taken (ms since epoch).
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    /// Entity state as a flattened full document; `None` when the entity
    /// did not exist at the snapshot point.
    pub state: Option<Document>,
    /// Whether the persisted form is gzip-compressed.
    pub compressed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn snapshot_serde_round_trip() {
        let snap = Snapshot {
            id: "snap-1".to_string(),
            ns: "posts".to_string(),
            entity_id: "p1".to_string(),
            sequence_number: 25,
            event_id: EventId::from_string("0000000003e8-abc"),
            ts: 1_000,
            created_at: 2_000,
            state: Some(doc! {"title" => "V25"}),
            compressed: true,
        };
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"sequenceNumber\":25"));
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
    }
}
