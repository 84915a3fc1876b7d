//! Retention: delete records past their per-granularity time-to-live.
//!
//! Records carry a granularity tag (`hourly` / `daily` / `monthly`) and a
//! timestamp; each granularity gets its own maximum age, with a fallback
//! policy for anything untagged. Deletes run in bounded batches and
//! report progress; a schedule handle drives periodic cleanup.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::Value;
use db_time::{Time, TimeProvider};
use entity_store::{DeleteOptions, EntityBackend, FindOptions};
use parking_lot::Mutex;
use snafu::Snafu;
use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Retention errors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("entity store failure: {}", source))]
    Backend { source: entity_store::Error },
}

/// Result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Maximum ages per granularity; `None` keeps records forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionPolicies {
    /// TTL of `hourly` records.
    pub hourly: Option<Duration>,
    /// TTL of `daily` records.
    pub daily: Option<Duration>,
    /// TTL of `monthly` records.
    pub monthly: Option<Duration>,
    /// Fallback for unknown or missing granularity tags.
    pub default: Option<Duration>,
}

impl RetentionPolicies {
    fn for_granularity(&self, granularity: &str) -> Option<Duration> {
        match granularity {
            "hourly" => self.hourly.or(self.default),
            "daily" => self.daily.or(self.default),
            "monthly" => self.monthly.or(self.default),
            _ => self.default,
        }
    }
}

/// What to clean and how.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Namespace the records live in.
    pub collection: String,
    /// Field carrying the record timestamp (ms or date).
    pub timestamp_field: String,
    /// Field carrying the granularity tag.
    pub granularity_field: String,
    /// Per-granularity TTLs.
    pub policies: RetentionPolicies,
    /// Upper bound on records deleted per batch.
    pub batch_size: usize,
}

impl RetentionConfig {
    /// Config for `collection` with the conventional field names.
    pub fn new(collection: impl Into<String>, policies: RetentionPolicies) -> Self {
        Self {
            collection: collection.into(),
            timestamp_field: "timestamp".to_string(),
            granularity_field: "granularity".to_string(),
            policies,
            batch_size: 500,
        }
    }
}

/// Progress callback payload; the final call is
/// `{phase: "complete", percentage: 100}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Current phase: `scan`, `delete` or `complete`.
    pub phase: &'static str,
    /// Whole-run progress estimate.
    pub percentage: u8,
    /// Records processed so far.
    pub processed: u64,
    /// Records eligible in this run.
    pub total: u64,
}

/// Outcome of one cleanup run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    /// Whether the run completed without error.
    pub success: bool,
    /// Records deleted across granularities.
    pub deleted_count: u64,
    /// Deletions per granularity tag.
    pub by_granularity: BTreeMap<String, u64>,
    /// Wall-clock duration of the run.
    pub duration_ms: u64,
}

/// Per-granularity inventory from [`RetentionManager::get_retention_stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GranularityStats {
    /// Records carrying this tag.
    pub total: u64,
    /// Records already past their TTL.
    pub eligible: u64,
    /// Oldest timestamp seen, if any.
    pub oldest_ts: Option<i64>,
}

/// Enforces the retention policies over one collection.
#[derive(Debug)]
pub struct RetentionManager {
    backend: Arc<dyn EntityBackend>,
    time_provider: Arc<dyn TimeProvider>,
    config: RetentionConfig,
}

type ProgressCallback<'a> = &'a (dyn Fn(Progress) + Send + Sync);

fn timestamp_of(value: Option<&Value>) -> Option<i64> {
    match value {
        Some(Value::Date(ms)) => Some(*ms),
        Some(Value::Int(ms)) => Some(*ms),
        _ => None,
    }
}

impl RetentionManager {
    /// Build over `backend`.
    pub fn new(
        backend: Arc<dyn EntityBackend>,
        time_provider: Arc<dyn TimeProvider>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            backend,
            time_provider,
            config,
        }
    }

    fn now_ms(&self) -> i64 {
        self.time_provider.now().timestamp_millis()
    }

    fn granularity_of(&self, body: &data_types::Document) -> String {
        body.get(&self.config.granularity_field)
            .and_then(|v| v.as_str())
            .unwrap_or("default")
            .to_string()
    }

    /// Records of the collection, keyed `(granularity, id, ts)`.
    async fn inventory(&self) -> Result<Vec<(String, data_types::EntityId, Option<i64>)>> {
        let entities = self
            .backend
            .find(
                &self.config.collection,
                &data_types::Document::new(),
                &FindOptions::default(),
            )
            .await
            .map_err(|source| Error::Backend { source })?;
        Ok(entities
            .into_iter()
            .map(|e| {
                let granularity = self.granularity_of(&e.body);
                let ts = timestamp_of(e.body.get(&self.config.timestamp_field));
                (granularity, e.id, ts)
            })
            .collect())
    }

    /// Delete everything past its per-granularity TTL.
    ///
    /// The run is idempotent: a second pass right after a first deletes
    /// nothing.
    pub async fn cleanup(&self, progress: Option<ProgressCallback<'_>>) -> Result<CleanupReport> {
        let now = self.now_ms();
        let cutoff_for = |granularity: &str| {
            self.config
                .policies
                .for_granularity(granularity)
                .map(|max_age| now - max_age.as_millis() as i64)
        };
        self.cleanup_with(progress, cutoff_for).await
    }

    /// Delete everything older than a fixed `cutoff`, across
    /// granularities.
    pub async fn cleanup_before(&self, cutoff: i64) -> Result<CleanupReport> {
        self.cleanup_with(None, |_| Some(cutoff)).await
    }

    async fn cleanup_with(
        &self,
        progress: Option<ProgressCallback<'_>>,
        cutoff_for: impl Fn(&str) -> Option<i64>,
    ) -> Result<CleanupReport> {
        let started = std::time::Instant::now();
        let report_progress = |p: Progress| {
            if let Some(callback) = progress {
                callback(p);
            }
        };

        report_progress(Progress {
            phase: "scan",
            percentage: 0,
            processed: 0,
            total: 0,
        });

        let inventory = self.inventory().await?;
        let eligible: Vec<(String, data_types::EntityId)> = inventory
            .into_iter()
            .filter_map(|(granularity, id, ts)| {
                let cutoff = cutoff_for(&granularity)?;
                let ts = ts?;
                (ts < cutoff).then_some((granularity, id))
            })
            .collect();

        let total = eligible.len() as u64;
        let mut report = CleanupReport::default();
        let mut processed = 0u64;

        // deletes run in batches bounded by batch_size
        for batch in eligible.chunks(self.config.batch_size.max(1)) {
            for (granularity, id) in batch {
                let deleted = self
                    .backend
                    .delete(
                        id,
                        &DeleteOptions {
                            hard: true,
                            ..Default::default()
                        },
                    )
                    .await
                    .map_err(|source| Error::Backend { source })?;
                if deleted {
                    report.deleted_count += 1;
                    *report.by_granularity.entry(granularity.clone()).or_insert(0) += 1;
                }
                processed += 1;
            }
            report_progress(Progress {
                phase: "delete",
                percentage: ((processed * 100) / total.max(1)).min(99) as u8,
                processed,
                total,
            });
        }

        report.success = true;
        report.duration_ms = started.elapsed().as_millis() as u64;
        report_progress(Progress {
            phase: "complete",
            percentage: 100,
            processed,
            total,
        });
        info!(
            collection = self.config.collection.as_str(),
            deleted = report.deleted_count,
            "retention cleanup finished"
        );
        Ok(report)
    }

    /// Per-granularity inventory: totals, TTL-eligible counts, oldest
    /// timestamps.
    pub async fn get_retention_stats(&self) -> Result<BTreeMap<String, GranularityStats>> {
        let now = self.now_ms();
        let mut stats: BTreeMap<String, GranularityStats> = BTreeMap::new();
        for (granularity, _id, ts) in self.inventory().await? {
            let entry = stats.entry(granularity.clone()).or_default();
            entry.total += 1;
            if let Some(ts) = ts {
                entry.oldest_ts = Some(entry.oldest_ts.map_or(ts, |o| o.min(ts)));
                if let Some(max_age) = self.config.policies.for_granularity(&granularity) {
                    if ts < now - max_age.as_millis() as i64 {
                        entry.eligible += 1;
                    }
                }
            }
        }
        Ok(stats)
    }
}

/// Options for [`schedule_cleanup`].
#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    /// Time between runs.
    pub interval: Duration,
    /// Run once immediately instead of waiting a full interval first.
    pub run_immediately: bool,
}

/// Handle over a scheduled cleanup loop.
#[derive(Debug, Clone)]
pub struct ScheduleHandle {
    paused: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    trigger: Arc<tokio::sync::Notify>,
    shutdown: CancellationToken,
    next_run_at: Arc<Mutex<Option<Time>>>,
}

impl ScheduleHandle {
    /// Skip runs until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume after a [`pause`](Self::pause).
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Run now, without waiting for the interval.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Stop the loop for good.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Whether a cleanup is executing right now.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// When the next scheduled run is due.
    pub fn next_run_at(&self) -> Option<Time> {
        *self.next_run_at.lock()
    }
}

/// Spawn a periodic cleanup loop over `manager`.
pub fn schedule_cleanup(
    manager: Arc<RetentionManager>,
    options: ScheduleOptions,
    on_complete: Option<Arc<dyn Fn(CleanupReport) + Send + Sync>>,
) -> ScheduleHandle {
    let handle = ScheduleHandle {
        paused: Arc::new(AtomicBool::new(false)),
        running: Arc::new(AtomicBool::new(false)),
        trigger: Arc::new(tokio::sync::Notify::new()),
        shutdown: CancellationToken::new(),
        next_run_at: Arc::new(Mutex::new(None)),
    };

    let loop_handle = handle.clone();
    tokio::spawn(async move {
        if options.run_immediately {
            run_once(&manager, &loop_handle, &on_complete).await;
        }
        loop {
            *loop_handle.next_run_at.lock() =
                manager.time_provider.now().checked_add(options.interval);
            tokio::select! {
                _ = tokio::time::sleep(options.interval) => {},
                _ = loop_handle.trigger.notified() => {},
                _ = loop_handle.shutdown.cancelled() => {
                    info!("retention schedule stopped");
                    return;
                }
            }
            if loop_handle.paused.load(Ordering::SeqCst) {
                continue;
            }
            run_once(&manager, &loop_handle, &on_complete).await;
        }
    });
    handle
}

async fn run_once(
    manager: &RetentionManager,
    handle: &ScheduleHandle,
    on_complete: &Option<Arc<dyn Fn(CleanupReport) + Send + Sync>>,
) {
    handle.running.store(true, Ordering::SeqCst);
    match manager.cleanup(None).await {
        Ok(report) => {
            if let Some(callback) = on_complete {
                callback(report);
            }
        }
        Err(e) => error!(error = %e, "scheduled retention cleanup failed"),
    }
    handle.running.store(false, Ordering::SeqCst);
}
