//! Queue Scheduler (C9): admits queued downloads up to `max_parallel_downloads`,
//! FIFO by creation order, and reconciles the active set against the store on
//! startup.
//!
//! A `VecDeque` drained against a fixed worker count, generalized into a
//! debounced, store-backed sweep: rather than a tight poll loop, admission
//! is triggered by events (a slot freeing up, a new download being queued)
//! and coalesced through [`crate::timer::Debouncer`] so a burst of
//! completions in the same instant only runs one sweep.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::orchestrator::{self, DownloadOutcome, OrchestratorContext, StartRequest};
use crate::store::{DownloadRow, DownloadState, Store};
use crate::timer::{Debouncer, TimerService};

/// Scheduler-level configuration. A subset of [`crate::config::EngineConfig`]
/// the engine extracts when constructing the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub max_parallel_downloads: usize,
}

/// Admits queued downloads and drives each admitted one through
/// [`orchestrator::run`] on its own task. Shared (`Clone`) handle: every
/// caller that can trigger admission (a completion, a new enqueue, startup
/// reconciliation) holds one.
#[derive(Clone)]
pub struct Scheduler {
    store: Store,
    orchestrator_ctx: OrchestratorContext,
    config: SchedulerConfig,
    active: Arc<Mutex<HashSet<String>>>,
    cancels: Arc<Mutex<std::collections::HashMap<String, CancellationToken>>>,
    debouncer: Debouncer,
}

impl Scheduler {
    #[must_use]
    pub fn new(store: Store, orchestrator_ctx: OrchestratorContext, config: SchedulerConfig) -> Self {
        let timer = TimerService::new();
        Self {
            store,
            orchestrator_ctx,
            config,
            active: Arc::new(Mutex::new(HashSet::new())),
            cancels: Arc::new(Mutex::new(std::collections::HashMap::new())),
            debouncer: timer.debouncer(std::time::Duration::from_millis(100)),
        }
    }

    /// Runs startup reconciliation: any download left `starting`,
    /// `progressing`, or `merging` from a previous process (interrupted by a
    /// crash or SIGKILL, since graceful shutdown pauses in-flight downloads
    /// first) is reset to `queued` so the next sweep retries it from scratch.
    ///
    /// # Errors
    ///
    /// Returns [`crate::store::StoreError`] if the store cannot be read.
    #[instrument(skip(self))]
    pub async fn reconcile_on_startup(&self) -> Result<Vec<String>, crate::store::StoreError> {
        let unfinished = self.store.load_all_unfinished().await?;
        let mut requeued = Vec::new();
        for row in &unfinished {
            if let Ok(state) = row.state() {
                if state.is_active() {
                    let now = now_unix_ms();
                    self.store
                        .update_state(&row.id, DownloadState::Queued, now, None, None)
                        .await?;
                    requeued.push(row.id.clone());
                }
            }
        }
        if !requeued.is_empty() {
            info!(count = requeued.len(), "requeued downloads interrupted by a previous shutdown");
        }
        Ok(unfinished.into_iter().map(|r| r.id).collect())
    }

    /// Schedules a debounced admission sweep. Cheap to call from every event
    /// that might free up or add queue capacity; bursts collapse to one
    /// actual sweep ~100ms later.
    pub async fn request_admission(&self) {
        let this = self.clone();
        self.debouncer
            .trigger(move || {
                tokio::spawn(async move {
                    this.admit_ready().await;
                });
            })
            .await;
    }

    /// Immediately (no debounce) admits as many queued downloads as there is
    /// capacity for. Used by [`Self::request_admission`]'s debounced callback
    /// and directly by tests.
    #[instrument(skip(self))]
    pub async fn admit_ready(&self) {
        let queued = match self.store.get_queued_ids_ordered_by_added_at().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "failed to read queued downloads");
                return;
            }
        };
        if queued.is_empty() {
            return;
        }

        let mut active = self.active.lock().await;
        let mut available = self.config.max_parallel_downloads.saturating_sub(active.len());
        if available == 0 {
            return;
        }

        for id in queued {
            if available == 0 {
                break;
            }
            if active.contains(&id) {
                continue;
            }
            let Ok(row) = self.store.get_download(&id).await else {
                continue;
            };
            active.insert(id.clone());
            available -= 1;
            self.spawn_download(row).await;
        }
    }

    async fn spawn_download(&self, row: DownloadRow) {
        let cancel = CancellationToken::new();
        self.cancels.lock().await.insert(row.id.clone(), cancel.clone());

        let this = self.clone();
        let id = row.id.clone();
        let request = StartRequest {
            id: row.id.clone(),
            url: row.url.clone(),
            save_path: std::path::PathBuf::from(&row.save_path),
            total_bytes_hint: row.total_bytes.and_then(|b| u64::try_from(b).ok()),
            force_overwrite: row.force_overwrite,
        };

        tokio::spawn(async move {
            let outcome = orchestrator::run(&this.orchestrator_ctx, request, cancel).await;
            this.active.lock().await.remove(&id);
            this.cancels.lock().await.remove(&id);
            match outcome {
                DownloadOutcome::Requeued => this.request_admission().await,
                DownloadOutcome::Completed { .. }
                | DownloadOutcome::AwaitingConfirmation
                | DownloadOutcome::Cancelled
                | DownloadOutcome::Interrupted(_) => this.request_admission().await,
            }
        });
    }

    /// Cancels an in-flight download's [`CancellationToken`], if it is
    /// currently running. Returns `false` if the id is not active (e.g. it
    /// is still queued or already terminal) -- the caller should fall back to
    /// a direct store state change for those cases.
    pub async fn cancel_active(&self, id: &str) -> bool {
        if let Some(token) = self.cancels.lock().await.get(id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Number of downloads currently occupying an active slot.
    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
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
