//! Compaction: batches of small Parquet files rewritten into fewer large
//! ones, driven by a persistent job queue in `.compaction-state.json`.
//!
//! Jobs move `pending → processing → completed | failed`; `completed` is
//! terminal and only `failed` jobs can be retried. Compacted outputs are
//! named `compacted-<ts>.parquet` and never become candidates again.
//! Entity rows fold to their newest version during the merge; event
//! batches re-emit every event, identity preserved.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use bytes::Bytes;
use columnar::ColumnarCodec;
use data_types::{Entity, ManifestFile, NamespaceSchema};
use db_time::TimeProvider;
use entity_store::ManifestStore;
use object_store::{ObjectStore, Path};
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Compactor errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Job not found: {}", job_id))]
    JobNotFound { job_id: String },

    #[snafu(display("job {} is not in failed state (currently {})", job_id, status))]
    NotRetryable { job_id: String, status: JobStatus },

    #[snafu(display("object store failure: {}", source))]
    Store { source: object_store::Error },

    #[snafu(display("codec failure: {}", source))]
    Codec { source: columnar::Error },

    #[snafu(display("compaction state corrupt: {}", source))]
    StateCorrupt { source: serde_json::Error },

    #[snafu(display("manifest update failed: {}", source))]
    Manifest { source: entity_store::Error },
}

/// Result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Scheduler knobs.
#[derive(Debug, Clone, Copy)]
pub struct CompactorConfig {
    /// A window needs at least this many candidates to form a job.
    pub min_files: usize,
    /// At most this many inputs per job.
    pub max_files: usize,
    /// Stop adding inputs once a job's combined size crosses this.
    pub target_size: u64,
    /// Candidate files group into windows of this width (by the
    /// timestamp embedded in their names).
    pub window_ms: i64,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            min_files: 2,
            max_files: 10,
            target_size: 128 * 1024 * 1024,
            window_ms: 60 * 60 * 1000,
        }
    }
}

/// Lifecycle of one compaction job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Queued, not yet picked up.
    Pending,
    /// Currently executing.
    Processing,
    /// Done; terminal.
    Completed,
    /// Execution failed; eligible for retry.
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One queued rewrite of `files` into a single compacted output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionJob {
    /// Job id, `compact-<ts>-<suffix>`.
    pub id: String,
    /// Namespace the inputs belong to.
    pub namespace: String,
    /// Window start (ms).
    #[serde(rename = "windowStart")]
    pub window_start: i64,
    /// Window end (ms, exclusive).
    #[serde(rename = "windowEnd")]
    pub window_end: i64,
    /// Input file paths.
    pub files: Vec<String>,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Creation time (ms).
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    /// Failure message of the last attempt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CompactionState {
    jobs: Vec<CompactionJob>,
}

/// Counts plus the most recent jobs, for `status`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusSummary {
    /// Jobs per lifecycle state.
    pub pending: usize,
    /// See [`StatusSummary::pending`].
    pub processing: usize,
    /// See [`StatusSummary::pending`].
    pub completed: usize,
    /// See [`StatusSummary::pending`].
    pub failed: usize,
    /// Most recent jobs, newest first (up to 10).
    pub recent: Vec<CompactionJob>,
}

/// Result of a `trigger` scan.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerSummary {
    /// Jobs appended to the queue.
    pub jobs_created: usize,
    /// Human-readable outcome ("nothing to do" when no candidates).
    pub message: String,
}

/// Result of a `cleanup` pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupSummary {
    /// Orphan temporary files found.
    pub orphans: Vec<String>,
    /// How many were deleted (0 without `force`).
    pub deleted: usize,
}

/// The compaction scheduler.
#[derive(Debug)]
pub struct CompactionScheduler {
    store: Arc<dyn ObjectStore>,
    codec: Arc<dyn ColumnarCodec>,
    time_provider: Arc<dyn TimeProvider>,
    manifests: ManifestStore,
    config: CompactorConfig,
    state_path: Path,
    // serializes state-file read-modify-write cycles
    state_lock: tokio::sync::Mutex<()>,
}

fn is_candidate(path: &Path) -> bool {
    let name = path.file_name();
    name.ends_with(".parquet")
        && !name.starts_with("compacted-")
        && !name.ends_with(".partial.parquet")
}

fn is_orphan(path: &Path) -> bool {
    let name = path.file_name();
    name.ends_with(".tmp") || name.ends_with(".partial.parquet")
}

/// Timestamp embedded in `part-<ts>-...` / `batch-<ts>...` file names.
fn embedded_ts(name: &str) -> Option<i64> {
    let rest = name.split_once('-')?.1;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

impl CompactionScheduler {
    /// Create a scheduler persisting its queue at
    /// `.compaction-state.json`.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        codec: Arc<dyn ColumnarCodec>,
        time_provider: Arc<dyn TimeProvider>,
        config: CompactorConfig,
    ) -> Self {
        Self {
            manifests: ManifestStore::new(Arc::clone(&store)),
            store,
            codec,
            time_provider,
            config,
            state_path: Path::parse(".compaction-state.json").expect("static path"),
            state_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn now_ms(&self) -> i64 {
        self.time_provider.now().timestamp_millis()
    }

    async fn load_state(&self) -> Result<CompactionState> {
        match self.store.read(&self.state_path).await {
            Ok(raw) => serde_json::from_slice(&raw).context(StateCorruptSnafu),
            Err(e) if e.is_not_found() => Ok(CompactionState::default()),
            Err(e) => Err(e).context(StoreSnafu),
        }
    }

    async fn save_state(&self, state: &CompactionState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state).expect("state serializes");
        self.store
            .write_atomic(&self.state_path, Bytes::from(json))
            .await
            .context(StoreSnafu)
    }

    /// Summarize the queue.
    pub async fn status(&self) -> Result<StatusSummary> {
        let state = self.load_state().await?;
        let mut summary = StatusSummary::default();
        for job in &state.jobs {
            match job.status {
                JobStatus::Pending => summary.pending += 1,
                JobStatus::Processing => summary.processing += 1,
                JobStatus::Completed => summary.completed += 1,
                JobStatus::Failed => summary.failed += 1,
            }
        }
        let mut recent = state.jobs;
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        recent.truncate(10);
        summary.recent = recent;
        Ok(summary)
    }

    /// Scan for candidates and append jobs to the queue.
    ///
    /// Scans `data/<ns>` (or every namespace when `ns` is `None`),
    /// excluding files already matching the compacted-output naming.
    pub async fn trigger(&self, ns: Option<&str>) -> Result<TriggerSummary> {
        let _guard = self.state_lock.lock().await;

        let namespaces = match ns {
            Some(ns) => vec![ns.to_string()],
            None => self.list_namespaces().await?,
        };

        let mut state = self.load_state().await?;
        let queued_inputs: std::collections::HashSet<String> = state
            .jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Processing))
            .flat_map(|j| j.files.iter().cloned())
            .collect();

        let mut jobs_created = 0;
        for ns in namespaces {
            let prefix = Path::parse(format!("data/{ns}")).expect("validated names");
            let entries = self.store.list_all(&prefix).await.context(StoreSnafu)?;

            // group candidates into time windows
            let mut windows: BTreeMap<i64, Vec<(String, u64)>> = BTreeMap::new();
            for entry in entries {
                if !is_candidate(&entry.path) {
                    continue;
                }
                let raw = entry.path.as_str().to_string();
                if queued_inputs.contains(&raw) {
                    continue;
                }
                let ts = embedded_ts(entry.path.file_name()).unwrap_or(0);
                let window = if self.config.window_ms > 0 {
                    ts - ts.rem_euclid(self.config.window_ms)
                } else {
                    0
                };
                windows.entry(window).or_default().push((raw, entry.size));
            }

            for (window_start, mut files) in windows {
                files.sort();
                while files.len() >= self.config.min_files {
                    let mut batch = vec![];
                    let mut batch_bytes = 0u64;
                    while let Some((path, size)) = files.first().cloned() {
                        if batch.len() >= self.config.max_files
                            || (!batch.is_empty() && batch_bytes + size > self.config.target_size)
                        {
                            break;
                        }
                        files.remove(0);
                        batch_bytes += size;
                        batch.push(path);
                    }
                    if batch.len() < self.config.min_files {
                        break;
                    }
                    let now = self.now_ms();
                    state.jobs.push(CompactionJob {
                        id: format!("compact-{now}-{}", Uuid::new_v4().simple()),
                        namespace: ns.clone(),
                        window_start,
                        window_end: window_start + self.config.window_ms.max(1),
                        files: batch,
                        status: JobStatus::Pending,
                        created_at: now,
                        error: None,
                    });
                    jobs_created += 1;
                }
            }
        }

        if jobs_created > 0 {
            self.save_state(&state).await?;
        }
        let message = if jobs_created == 0 {
            "nothing to do".to_string()
        } else {
            format!("{jobs_created} job(s) queued")
        };
        info!(jobs_created, "compaction trigger: {message}");
        Ok(TriggerSummary {
            jobs_created,
            message,
        })
    }

    /// Flip a failed job back to pending, clearing its error.
    pub async fn retry(&self, job_id: &str) -> Result<()> {
        let _guard = self.state_lock.lock().await;
        let mut state = self.load_state().await?;
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .context(JobNotFoundSnafu { job_id })?;
        ensure!(
            job.status == JobStatus::Failed,
            NotRetryableSnafu {
                job_id,
                status: job.status,
            }
        );
        job.status = JobStatus::Pending;
        job.error = None;
        self.save_state(&state).await
    }

    /// Report (and with `force`, delete) orphan temporary files.
    pub async fn cleanup(&self, force: bool) -> Result<CleanupSummary> {
        let mut summary = CleanupSummary::default();
        for prefix in ["data", "events"] {
            let prefix = Path::parse(prefix).expect("static path");
            let entries = match self.store.list_all(&prefix).await {
                Ok(entries) => entries,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e).context(StoreSnafu),
            };
            for entry in entries {
                if is_orphan(&entry.path) {
                    summary.orphans.push(entry.path.as_str().to_string());
                }
            }
        }

        if force {
            for orphan in &summary.orphans {
                let path = Path::parse(orphan).expect("listed paths are valid");
                match self.store.delete(&path).await {
                    Ok(()) => summary.deleted += 1,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e).context(StoreSnafu),
                }
            }
            info!(deleted = summary.deleted, "orphan cleanup");
        }
        Ok(summary)
    }

    /// Execute every pending job; failures mark the job failed and move
    /// on.
    pub async fn run_pending(&self) -> Result<usize> {
        let pending: Vec<CompactionJob> = {
            let _guard = self.state_lock.lock().await;
            let mut state = self.load_state().await?;
            let pending: Vec<CompactionJob> = state
                .jobs
                .iter_mut()
                .filter(|j| j.status == JobStatus::Pending)
                .map(|j| {
                    j.status = JobStatus::Processing;
                    j.clone()
                })
                .collect();
            if !pending.is_empty() {
                self.save_state(&state).await?;
            }
            pending
        };

        let mut completed = 0;
        for job in pending {
            let result = self.run_job(&job).await;
            let _guard = self.state_lock.lock().await;
            let mut state = self.load_state().await?;
            if let Some(stored) = state.jobs.iter_mut().find(|j| j.id == job.id) {
                match &result {
                    Ok(output) => {
                        stored.status = JobStatus::Completed;
                        stored.error = None;
                        completed += 1;
                        info!(job = job.id.as_str(), output = output.as_str(), "compaction completed");
                    }
                    Err(e) => {
                        stored.status = JobStatus::Failed;
                        stored.error = Some(e.to_string());
                        warn!(job = job.id.as_str(), error = %e, "compaction failed");
                    }
                }
            }
            self.save_state(&state).await?;
        }
        Ok(completed)
    }

    /// Merge one job's inputs into a `compacted-<ts>.parquet`, update the
    /// namespace manifest (overwrite semantics referencing the inputs),
    /// then delete the originals.
    async fn run_job(&self, job: &CompactionJob) -> Result<String> {
        // fold rows to the newest version per entity id
        let mut merged: BTreeMap<String, data_types::Document> = BTreeMap::new();
        for file in &job.files {
            let path = Path::parse(file).expect("job inputs are valid paths");
            let bytes = self.store.read(&path).await.context(StoreSnafu)?;
            for row in self.codec.decode_rows(&bytes).context(CodecSnafu)? {
                let Some(entity) = Entity::from_full_document(row.clone()) else {
                    continue;
                };
                let key = entity.id.canonical();
                let newer = merged
                    .get(&key)
                    .and_then(|existing| Entity::from_full_document(existing.clone()))
                    .map(|existing| entity.meta.version > existing.meta.version)
                    .unwrap_or(true);
                if newer {
                    merged.insert(key, row);
                }
            }
        }

        let manifest_path =
            Path::parse(format!("data/{}/manifest.json", job.namespace)).expect("validated names");
        let (manifest, _) = self.manifests.load(&manifest_path).await.context(ManifestSnafu)?;
        let schema = manifest.schema.clone().unwrap_or_else(NamespaceSchema::default);

        let rows: Vec<data_types::Document> = merged.into_values().collect();
        let encoded = self.codec.encode_rows(&schema, &rows).context(CodecSnafu)?;
        let output = Path::parse(format!(
            "data/{}/compacted-{}.parquet",
            job.namespace,
            self.now_ms()
        ))
        .expect("validated names");
        self.store
            .write_atomic(&output, encoded.bytes.clone())
            .await
            .context(StoreSnafu)?;

        // the manifest swap references the inputs it replaces
        let inputs = job.files.clone();
        let entry = ManifestFile {
            path: output.as_str().to_string(),
            size_bytes: encoded.bytes.len() as u64,
            content_hash: ManifestStore::content_hash(&encoded.bytes),
        };
        self.manifests
            .update(&manifest_path, move |m| {
                m.remove_files(&inputs);
                m.files.push(entry.clone());
            })
            .await
            .context(ManifestSnafu)?;

        // inputs only go away after the output and manifest landed
        for file in &job.files {
            let path = Path::parse(file).expect("job inputs are valid paths");
            match self.store.delete(&path).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e).context(StoreSnafu),
            }
        }
        Ok(output.as_str().to_string())
    }

    /// Merge all event batches under `events/` into one larger batch,
    /// preserving every event id.
    pub async fn compact_event_batches(&self) -> Result<usize> {
        let prefix = Path::parse("events").expect("static path");
        let entries = self.store.list_all(&prefix).await.context(StoreSnafu)?;
        let batches: Vec<Path> = entries
            .into_iter()
            .map(|e| e.path)
            .filter(|p| {
                let name = p.file_name();
                name.starts_with("batch-") && name.ends_with(".parquet")
            })
            .collect();
        if batches.len() < self.config.min_files {
            return Ok(0);
        }

        let mut events = vec![];
        for path in &batches {
            let bytes = self.store.read(path).await.context(StoreSnafu)?;
            events.extend(self.codec.decode_events(&bytes).context(CodecSnafu)?);
        }
        let encoded = self.codec.encode_events(&events).context(CodecSnafu)?;

        let first = batches.first().expect("non-empty");
        let dir = first.parent().expect("batches live in partitions");
        let output = dir
            .join(&format!("batch-{}-compacted.parquet", self.now_ms()))
            .expect("valid name");
        self.store
            .write_atomic(&output, encoded.bytes)
            .await
            .context(StoreSnafu)?;
        for path in &batches {
            match self.store.delete(path).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e).context(StoreSnafu),
            }
        }
        info!(inputs = batches.len(), n_events = events.len(), "event batches compacted");
        Ok(batches.len())
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let entries = self
            .store
            .list_all(&Path::parse("data").expect("static path"))
            .await
            .context(StoreSnafu)?;
        let mut namespaces = std::collections::BTreeSet::new();
        for entry in entries {
            if let Some(rest) = entry.path.as_str().strip_prefix("data/") {
                if let Some((ns, _)) = rest.split_once('/') {
                    namespaces.insert(ns.to_string());
                }
            }
        }
        Ok(namespaces.into_iter().collect())
    }
}
