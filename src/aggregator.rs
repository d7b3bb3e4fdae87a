//! Progress Aggregator (C10): coalesces high-frequency byte-delta updates
//! from chunk workers into throttled, batched flushes to the Store and the
//! observer.
//!
//! A `tokio::time::sleep` + periodic snapshot polling loop, generalized from
//! a single spinner-rendering consumer into a structured batch producer:
//! each tick computes per-download deltas and an EWMA transfer rate, then
//! emits a `ProgressUpdate` batch to [`crate::store::Store`] and a
//! `ProgressSample` batch to [`crate::observer::EngineObserver`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::observer::{ProgressSample, SharedObserver};
use crate::store::{ProgressUpdate, Store};
use crate::timer::TimerService;

/// Smoothing factor for the exponential moving average of transfer speed.
/// Higher weights recent samples more; 0.3 settles within a handful of
/// flush ticks without being noisy on a single slow/fast tick.
const EWMA_ALPHA: f64 = 0.3;

#[derive(Debug, Default)]
struct ProgressEntry {
    downloaded_bytes: u64,
    total_bytes: Option<u64>,
    last_flushed_bytes: u64,
    bytes_per_sec: f64,
    /// `(downloaded, size)` per chunk, indexed by chunk index. Empty for a
    /// non-chunked (`DownloadPlan::Single`) transfer.
    chunks: Vec<(u64, u64)>,
    /// Total bytes the merge step will write, set by [`ProgressAggregator::begin_merge`].
    /// `None` before merging starts and for downloads that never chunk.
    merge_total: Option<u64>,
    merge_written: u64,
}

/// Coalesces byte-delta reports into periodic batched flushes.
#[derive(Clone)]
pub struct ProgressAggregator {
    entries: Arc<DashMap<String, ProgressEntry>>,
    store: Store,
    observer: SharedObserver,
    timer: TimerService,
    flush_period: Duration,
}

impl ProgressAggregator {
    #[must_use]
    pub fn new(store: Store, observer: SharedObserver, flush_period: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            store,
            observer,
            timer: TimerService::new(),
            flush_period,
        }
    }

    /// Registers a download so subsequent [`Self::add_bytes`] calls are
    /// tracked. Idempotent: re-registering resets the tracked byte count.
    /// Used for a [`crate::planner::DownloadPlan::Single`] transfer, which
    /// has no per-chunk breakdown to report.
    pub fn register(&self, id: &str, total_bytes: Option<u64>) {
        self.entries.insert(
            id.to_string(),
            ProgressEntry {
                downloaded_bytes: 0,
                total_bytes,
                last_flushed_bytes: 0,
                bytes_per_sec: 0.0,
                chunks: Vec::new(),
                merge_total: None,
                merge_written: 0,
            },
        );
    }

    /// Registers a chunked download, seeding one `(downloaded, size)` slot
    /// per planned chunk so flushes can report `active_chunks`,
    /// `completed_chunks`, and `chunk_progress`.
    pub fn register_chunked(&self, id: &str, total_bytes: Option<u64>, chunk_sizes: &[u64]) {
        self.entries.insert(
            id.to_string(),
            ProgressEntry {
                downloaded_bytes: 0,
                total_bytes,
                last_flushed_bytes: 0,
                bytes_per_sec: 0.0,
                chunks: chunk_sizes.iter().map(|&size| (0, size)).collect(),
                merge_total: None,
                merge_written: 0,
            },
        );
    }

    /// Marks the merge step as started for `id`, so [`Self::flush_once`]
    /// reports `merge_progress` instead of leaving it at `None`. Called by
    /// the Merge Worker before it starts copying part files.
    pub fn begin_merge(&self, id: &str, total_bytes: u64) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.merge_total = Some(total_bytes);
            entry.merge_written = 0;
        }
    }

    /// Records `delta` additional bytes written by the merge step. Called
    /// from the merge worker's blocking copy loop, which runs on its own
    /// thread and calls this directly (no `.await` needed: both this and
    /// [`Self::add_chunk_bytes`] only touch the in-memory map).
    pub fn add_merge_bytes(&self, id: &str, delta: u64) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.merge_written += delta;
        }
    }

    /// Stops tracking a download. Called on completion, cancellation, or
    /// interruption so the flush loop no longer reports it.
    pub fn deregister(&self, id: &str) {
        self.entries.remove(id);
    }

    /// Records `delta` additional bytes downloaded for `id`. Called from the
    /// non-chunked (direct) fetch path.
    pub fn add_bytes(&self, id: &str, delta: u64) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.downloaded_bytes += delta;
        }
    }

    /// Records `delta` additional bytes downloaded for chunk `chunk_index`
    /// of `id`. Called from chunk worker tasks on every buffered read;
    /// cheap enough to call per-read since it only touches one `DashMap`
    /// shard.
    pub fn add_chunk_bytes(&self, id: &str, chunk_index: u32, delta: u64) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.downloaded_bytes += delta;
            if let Some(slot) = entry.chunks.get_mut(chunk_index as usize) {
                slot.0 += delta;
            }
        }
    }

    /// Runs the flush loop until `cancel` fires. Spawn this once per
    /// [`crate::engine::Engine`] instance.
    #[instrument(skip(self, cancel))]
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = self.timer.interval(self.flush_period);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => self.flush_once().await,
            }
        }
    }

    /// Computes deltas since the last flush, updates EWMA speed, and emits
    /// a single batch to the store and observer. Public so tests and a
    /// final best-effort flush before shutdown can call it directly.
    pub async fn flush_once(&self) {
        let now = now_unix_ms();
        let period_secs = self.flush_period.as_secs_f64().max(0.001);

        let mut updates = Vec::new();
        let mut samples = Vec::new();

        for mut entry in self.entries.iter_mut() {
            let id = entry.key().clone();
            let state = entry.value_mut();
            let delta = state.downloaded_bytes.saturating_sub(state.last_flushed_bytes);
            let instantaneous_rate = delta as f64 / period_secs;
            state.bytes_per_sec =
                EWMA_ALPHA * instantaneous_rate + (1.0 - EWMA_ALPHA) * state.bytes_per_sec;
            state.last_flushed_bytes = state.downloaded_bytes;

            let progress = match state.total_bytes {
                Some(total) if total > 0 => state.downloaded_bytes as f64 / total as f64,
                _ => 0.0,
            };
            let eta_seconds = match state.total_bytes {
                Some(total) if state.bytes_per_sec > 0.0 && total > state.downloaded_bytes => {
                    Some((total - state.downloaded_bytes) as f64 / state.bytes_per_sec)
                }
                _ => None,
            };
            let chunk_progress: Vec<f64> = state
                .chunks
                .iter()
                .map(|&(downloaded, size)| if size > 0 { downloaded as f64 / size as f64 } else { 1.0 })
                .collect();
            let completed_chunks = chunk_progress.iter().filter(|&&p| p >= 1.0).count();
            let active_chunks = chunk_progress.iter().filter(|&&p| p > 0.0 && p < 1.0).count();
            let merge_progress = state.merge_total.map(|total| {
                if total > 0 {
                    (state.merge_written as f64 / total as f64).min(1.0)
                } else {
                    1.0
                }
            });

            updates.push(ProgressUpdate {
                id: id.clone(),
                downloaded_bytes: i64::try_from(state.downloaded_bytes).unwrap_or(i64::MAX),
                progress,
                updated_at: now,
            });
            samples.push(ProgressSample {
                id,
                downloaded_bytes: state.downloaded_bytes,
                total_bytes: state.total_bytes,
                progress,
                bytes_per_sec: state.bytes_per_sec,
                eta_seconds,
                active_chunks,
                completed_chunks,
                chunk_progress,
                merge_progress,
            });
        }

        if updates.is_empty() {
            return;
        }

        if let Err(e) = self.store.update_progress_batch(&updates).await {
            warn!(error = %e, "progress batch flush failed, will retry next tick");
        }
        self.observer.on_progress_batch(&samples).await;
    }
}

fn now_unix_ms() -> i64 {
    i64::try_from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(i64::MAX)
}
