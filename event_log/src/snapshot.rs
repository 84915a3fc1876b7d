//! Snapshot persistence and snapshot-accelerated replay.

use crate::{
    replay::{EventReplayer, ReplayResult, ReplayStats},
    Result, StoreSnafu,
};
use bytes::Bytes;
use data_types::{Event, Snapshot};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use object_store::{ObjectStore, Path};
use snafu::ResultExt;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::debug;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Snapshot policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotConfig {
    /// Take a snapshot automatically once this many events accumulated
    /// since the last one. Zero disables auto-snapshots.
    pub auto_snapshot_threshold: usize,
    /// Gzip snapshot payloads.
    pub compress: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            auto_snapshot_threshold: 100,
            compress: true,
        }
    }
}

/// Stores snapshots under `snapshots/<ns>/<entityId>/<sequence>.snap`.
#[derive(Debug)]
pub struct SnapshotStore {
    store: Arc<dyn ObjectStore>,
    config: SnapshotConfig,
    replayer: EventReplayer,
}

impl SnapshotStore {
    /// Create a snapshot store.
    pub fn new(store: Arc<dyn ObjectStore>, config: SnapshotConfig) -> Self {
        Self {
            store,
            config,
            replayer: EventReplayer::new(),
        }
    }

    fn path(ns: &str, entity_id: &str, sequence: u64) -> Path {
        Path::parse(format!("snapshots/{ns}/{entity_id}/{sequence:010}.snap"))
            .expect("snapshot components are validated ids")
    }

    /// Persist a snapshot.
    pub async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_vec(snapshot).expect("snapshots serialize");
        let payload = if snapshot.compressed {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&json).expect("in-memory gzip");
            encoder.finish().expect("in-memory gzip")
        } else {
            json
        };
        let path = Self::path(&snapshot.ns, &snapshot.entity_id, snapshot.sequence_number);
        self.store
            .write_atomic(&path, Bytes::from(payload))
            .await
            .context(StoreSnafu)
    }

    /// Load the snapshot at `sequence`, sniffing compression.
    pub async fn load(&self, ns: &str, entity_id: &str, sequence: u64) -> Result<Snapshot> {
        let raw = self
            .store
            .read(&Self::path(ns, entity_id, sequence))
            .await
            .context(StoreSnafu)?;
        let json = if raw.len() >= 2 && raw[..2] == GZIP_MAGIC {
            let mut decoder = GzDecoder::new(&raw[..]);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| crate::Error::SnapshotCorrupt { source: e.into() })?;
            out
        } else {
            raw.to_vec()
        };
        serde_json::from_slice(&json)
            .map_err(|e| crate::Error::SnapshotCorrupt { source: e.into() })
    }

    /// Sequence numbers of every snapshot of one entity, ascending.
    pub async fn list_sequences(&self, ns: &str, entity_id: &str) -> Result<Vec<u64>> {
        let prefix = Path::parse(format!("snapshots/{ns}/{entity_id}"))
            .expect("snapshot components are validated ids");
        let entries = self.store.list_all(&prefix).await.context(StoreSnafu)?;
        let mut sequences: Vec<u64> = entries
            .iter()
            .filter_map(|e| {
                e.path
                    .file_name()
                    .strip_suffix(".snap")
                    .and_then(|s| s.parse().ok())
            })
            .collect();
        sequences.sort_unstable();
        Ok(sequences)
    }

    /// The newest snapshot taken at or before `ts`, if any.
    pub async fn latest_at_or_before(
        &self,
        ns: &str,
        entity_id: &str,
        ts: i64,
    ) -> Result<Option<Snapshot>> {
        let sequences = self.list_sequences(ns, entity_id).await?;
        for sequence in sequences.into_iter().rev() {
            let snapshot = self.load(ns, entity_id, sequence).await?;
            if snapshot.ts <= ts {
                return Ok(Some(snapshot));
            }
        }
        Ok(None)
    }

    /// Build (and persist) a snapshot folding the first `upto` events of
    /// `history`.
    pub async fn create(
        &self,
        ns: &str,
        entity_id: &str,
        history: &[Event],
        upto: usize,
        now_ms: i64,
    ) -> Result<Snapshot> {
        let events = &history[..upto.min(history.len())];
        let folded = self.replayer.replay_forward(None, events)?;
        let last = events.last().expect("snapshot of at least one event");
        let snapshot = Snapshot {
            id: format!("snap-{ns}-{entity_id}-{}", events.len()),
            ns: ns.to_string(),
            entity_id: entity_id.to_string(),
            sequence_number: events.len() as u64,
            event_id: last.id.clone(),
            ts: last.ts,
            created_at: now_ms,
            state: folded.state,
            compressed: self.config.compress,
        };
        self.save(&snapshot).await?;
        debug!(ns, entity_id, sequence = snapshot.sequence_number, "snapshot created");
        Ok(snapshot)
    }

    /// Take a snapshot when `history` has grown `auto_snapshot_threshold`
    /// events past the newest existing snapshot.
    pub async fn maybe_auto_snapshot(
        &self,
        ns: &str,
        entity_id: &str,
        history: &[Event],
        now_ms: i64,
    ) -> Result<Option<Snapshot>> {
        if self.config.auto_snapshot_threshold == 0 || history.is_empty() {
            return Ok(None);
        }
        let last_sequence = self
            .list_sequences(ns, entity_id)
            .await?
            .last()
            .copied()
            .unwrap_or(0);
        let pending = history.len() as u64 - last_sequence.min(history.len() as u64);
        if pending < self.config.auto_snapshot_threshold as u64 {
            return Ok(None);
        }
        self.create(ns, entity_id, history, history.len(), now_ms)
            .await
            .map(Some)
    }

    /// Replay `history` to `at`, starting from the best snapshot.
    ///
    /// Equivalent to a full forward replay (tested invariant), just
    /// cheaper: only the events after the snapshot re-fold.
    pub async fn replay_at(
        &self,
        ns: &str,
        entity_id: &str,
        history: &[Event],
        at: i64,
    ) -> Result<(ReplayResult, ReplayStats)> {
        let snapshot = self.latest_at_or_before(ns, entity_id, at).await?;

        match snapshot {
            Some(snapshot) => {
                let tail: Vec<Event> = history
                    .iter()
                    .filter(|e| {
                        e.ts <= at
                            && (e.ts, e.id.as_str()) > (snapshot.ts, snapshot.event_id.as_str())
                    })
                    .cloned()
                    .collect();
                let result = self.replayer.replay_forward(snapshot.state.clone(), &tail)?;
                let stats = ReplayStats {
                    events_replayed: tail.len(),
                    snapshot_used_at: Some(snapshot.sequence_number),
                    snapshots_used: 1,
                };
                Ok((result, stats))
            }
            None => {
                let result = self.replayer.replay_at(history, at)?;
                let stats = ReplayStats {
                    events_replayed: result.events_replayed,
                    snapshot_used_at: None,
                    snapshots_used: 0,
                };
                Ok((result, stats))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{doc, EntityId, EventOp, Value};
    use object_store::InMemory;

    fn snapshot_store(compress: bool) -> SnapshotStore {
        SnapshotStore::new(
            Arc::new(InMemory::new()),
            SnapshotConfig {
                auto_snapshot_threshold: 10,
                compress,
            },
        )
    }

    fn history(n: usize) -> Vec<Event> {
        let id = EntityId::new("posts", "p1").unwrap();
        (0..n)
            .map(|i| {
                let ts = 1_000 * (i as i64 + 1);
                let mut e = if i == 0 {
                    Event::new(EventOp::Create, &id, ts)
                } else {
                    Event::new(EventOp::Update, &id, ts)
                };
                e.after = Some(doc! {"title" => format!("V{}", i + 1)});
                e
            })
            .collect()
    }

    #[tokio::test]
    async fn save_load_round_trip_compressed_and_not() {
        for compress in [true, false] {
            let store = snapshot_store(compress);
            let snapshot = store
                .create("posts", "p1", &history(5), 5, 99_000)
                .await
                .unwrap();
            assert_eq!(snapshot.sequence_number, 5);
            assert_eq!(snapshot.compressed, compress);

            let loaded = store.load("posts", "p1", 5).await.unwrap();
            assert_eq!(loaded, snapshot);
            assert_eq!(
                loaded.state.unwrap().get("title"),
                Some(&Value::String("V5".into()))
            );
        }
    }

    #[tokio::test]
    async fn snapshot_accelerated_replay_matches_full_replay() {
        let store = snapshot_store(true);
        let history = history(50);

        // snapshot at event 25
        store
            .create("posts", "p1", &history, 25, 99_000)
            .await
            .unwrap();

        // query at event 30's timestamp
        let at = 30_000;
        let (result, stats) = store.replay_at("posts", "p1", &history, at).await.unwrap();

        assert_eq!(stats.snapshot_used_at, Some(25));
        assert_eq!(stats.events_replayed, 5);
        assert_eq!(stats.snapshots_used, 1);

        let naive = EventReplayer::new().replay_at(&history, at).unwrap();
        assert_eq!(result.state, naive.state);
        assert_eq!(
            result.state.unwrap().get("title"),
            Some(&Value::String("V30".into()))
        );
    }

    #[tokio::test]
    async fn replay_before_any_snapshot_goes_forward() {
        let store = snapshot_store(true);
        let history = history(10);
        store
            .create("posts", "p1", &history, 8, 99_000)
            .await
            .unwrap();

        // at event 3: the snapshot at 8 is too new to help
        let (result, stats) = store
            .replay_at("posts", "p1", &history, 3_000)
            .await
            .unwrap();
        assert_eq!(stats.snapshot_used_at, None);
        assert_eq!(stats.events_replayed, 3);
        assert_eq!(
            result.state.unwrap().get("title"),
            Some(&Value::String("V3".into()))
        );
    }

    #[tokio::test]
    async fn auto_snapshot_respects_threshold() {
        let store = snapshot_store(true);

        // 9 events: below the threshold of 10
        assert!(store
            .maybe_auto_snapshot("posts", "p1", &history(9), 99_000)
            .await
            .unwrap()
            .is_none());

        // 10 events: snapshot appears
        let snapshot = store
            .maybe_auto_snapshot("posts", "p1", &history(10), 99_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.sequence_number, 10);

        // 5 more events: below threshold relative to the last snapshot
        assert!(store
            .maybe_auto_snapshot("posts", "p1", &history(15), 99_000)
            .await
            .unwrap()
            .is_none());

        // 20 events total: next snapshot
        let snapshot = store
            .maybe_auto_snapshot("posts", "p1", &history(20), 99_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.sequence_number, 20);
    }
}
