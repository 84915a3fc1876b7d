use crate::{Document, EntityId, EventId, IdError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// The mutation kind an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventOp {
    /// Entity came into existence; `after` holds the initial state.
    #[serde(rename = "CREATE")]
    Create,
    /// Entity changed; `before`/`after` hold the states around the change.
    #[serde(rename = "UPDATE")]
    Update,
    /// Entity was removed; `before` holds the final state.
    #[serde(rename = "DELETE")]
    Delete,
}

impl EventOp {
    /// The wire name (`CREATE` / `UPDATE` / `DELETE`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// Parse the wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(Self::Create),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for EventOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable record of a single mutation.
///
/// Events are append-only: once recorded they are never changed, only
/// re-packed into larger batches by compaction (which preserves `id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Sortable identifier, unique per event.
    pub id: EventId,
    /// Milliseconds since epoch at which the mutation happened.
    pub ts: i64,
    /// What happened.
    pub op: EventOp,
    /// The affected entity in `"ns:id"` form, never `"ns/id"`.
    pub target: String,
    /// Who did it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Entity state before the mutation (absent for CREATE).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Document>,
    /// Entity state after the mutation (absent for DELETE).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Document>,
}

impl Event {
    /// Build an event for `target` at `ts`, generating a sortable id.
    pub fn new(op: EventOp, target: &EntityId, ts: i64) -> Self {
        Self {
            id: EventId::generate(ts),
            ts,
            op,
            target: target.event_target(),
            actor: None,
            before: None,
            after: None,
        }
    }

    /// The target parsed back into an [`EntityId`].
    pub fn target_entity(&self) -> Result<EntityId, IdError> {
        EntityId::parse_event_target(&self.target)
    }

    /// The `(ts, id)` replay ordering; id breaks timestamp ties, op breaks
    /// (pathological) full ties so the fold stays deterministic.
    pub fn replay_cmp(&self, other: &Self) -> Ordering {
        self.ts
            .cmp(&other.ts)
            .then_with(|| self.id.cmp(&other.id))
            .then_with(|| self.op.cmp(&other.op))
    }
}

/// Sort a slice of events into replay order.
pub fn sort_for_replay(events: &mut [Event]) {
    events.sort_by(|a, b| a.replay_cmp(b));
}
