//! Control API (C12): the single `Engine` handle that wires together every
//! other component and exposes the RPC surface described in the module-level
//! docs of [`crate::orchestrator`], [`crate::scheduler`], and
//! [`crate::catalog`].
//!
//! An `Arc`-shared, `Clone` handle composing `Store`, `HttpFetcher`,
//! `RateLimiter`, and a `DownloadStats` counter block behind async methods
//! the CLI calls directly — generalized from a one-shot queue-drain call
//! into a long-lived handle with pause/resume/cancel/retry/confirm/delete
//! granular control and a background Aggregator flush loop: one explicitly
//! constructed `Engine` value owned by the application root, not a
//! process-wide static.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::aggregator::ProgressAggregator;
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::catalog::{CatalogSource, ExpandResult, FolderExpander};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::net::{HttpFetcher, RateLimiter, RetryPolicy};
use crate::observer::SharedObserver;
use crate::orchestrator::OrchestratorContext;
use crate::planner::ChunkingPolicy;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::store::{DownloadRow, DownloadState, Store};
use crate::timer::TimerService;

/// One request to the Control API's `download` RPC.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub id: String,
    pub title: String,
    pub url: String,
    pub total_bytes_hint: Option<u64>,
    pub download_path: Option<PathBuf>,
    pub preserve_structure: Option<bool>,
    pub force_overwrite: bool,
}

/// One request to the Control API's `download_folder` RPC. `folder_id` is
/// resolved against the [`CatalogSource`] the `Engine` was constructed with.
#[derive(Debug, Clone)]
pub struct DownloadFolderRequest {
    pub folder_id: String,
    pub download_path: Option<PathBuf>,
    pub preserve_structure: Option<bool>,
    pub force_overwrite: bool,
}

/// Result of `download_folder`, mirroring §4.12's `{total_files, added,
/// skipped, folder_title}`.
#[derive(Debug, Clone)]
pub struct FolderDownloadSummary {
    pub folder_title: String,
    pub total_files: usize,
    pub added: usize,
    pub skipped: usize,
}

/// Snapshot returned by `get_download_stats`.
#[derive(Debug, Clone)]
pub struct DownloadStats {
    pub active_ids: Vec<String>,
    pub queued_ids: Vec<String>,
}

/// The root handle the Control API exposes: everything the CLI or an
/// embedding application calls goes through this type. Cheap to clone --
/// every field is an `Arc`/pool handle or a `Clone`-cheap service.
#[derive(Clone)]
pub struct Engine {
    store: Store,
    scheduler: Scheduler,
    orchestrator_ctx: OrchestratorContext,
    catalog: Option<Arc<dyn CatalogSource>>,
    config: EngineConfig,
    aggregator_cancel: CancellationToken,
}

impl Engine {
    /// Builds an `Engine` from a resolved configuration, a store, and an
    /// observer. `catalog` is optional: `download_folder` fails with
    /// [`EngineError::Config`] if called without one, since folder expansion
    /// is out of scope when no catalog backend is wired in.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        store: Store,
        observer: SharedObserver,
        catalog: Option<Arc<dyn CatalogSource>>,
    ) -> Self {
        let fetcher = HttpFetcher::with_timeouts(
            config.connect_timeout_ms / 1000,
            config.idle_timeout_ms / 1000,
        );
        let rate_limiter = if config.rate_limit_min_time_ms == 0 {
            RateLimiter::disabled()
        } else {
            RateLimiter::with_max_concurrent(
                Duration::from_millis(config.rate_limit_min_time_ms),
                config.rate_limit_max_concurrent,
            )
        };
        let breaker_config = BreakerConfig {
            failure_threshold: config.circuit_threshold,
            open_duration: Duration::from_millis(config.circuit_open_ms),
            half_open_probes: config.circuit_half_open_probes,
        };
        let aggregator = ProgressAggregator::new(
            store.clone(),
            observer.clone(),
            Duration::from_millis(config.progress_flush_ms),
        );

        let orchestrator_ctx = OrchestratorContext {
            store: store.clone(),
            observer,
            fetcher,
            rate_limiter: Arc::new(rate_limiter),
            host_breaker: CircuitBreaker::new(breaker_config),
            resource_breaker: CircuitBreaker::new(breaker_config),
            aggregator,
            retry_policy: RetryPolicy::new(
                config.chunk_max_retries,
                Duration::from_millis(config.retry_base_backoff_ms),
                Duration::from_millis(config.retry_base_backoff_ms.saturating_mul(32).max(32_000)),
                2.0,
            ),
            chunking_policy: ChunkingPolicy {
                target_chunk_size: config.target_chunk_size,
                min_chunk_threshold: config.min_chunk_threshold,
                max_chunks: config.max_chunks,
            },
            max_chunk_concurrency: usize::from(config.max_chunk_concurrency),
            overwrite_tolerance_bytes: config.overwrite_size_tolerance_bytes,
        };

        let scheduler = Scheduler::new(
            store.clone(),
            orchestrator_ctx.clone(),
            SchedulerConfig {
                max_parallel_downloads: usize::from(config.max_parallel_downloads),
            },
        );

        Self {
            store,
            scheduler,
            orchestrator_ctx,
            catalog,
            config,
            aggregator_cancel: CancellationToken::new(),
        }
    }

    /// Runs startup reconciliation (requeuing downloads interrupted by a
    /// previous crash), emits `downloads-restored`, spawns the Aggregator's
    /// background flush loop, and performs an initial admission sweep if
    /// `auto_resume_downloads` is enabled.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`crate::store::StoreError`] wrapped in
    /// [`EngineError`] if the store cannot be read during reconciliation.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), EngineError> {
        let restored = self.scheduler.reconcile_on_startup().await?;
        if !restored.is_empty() {
            self.orchestrator_ctx.observer.on_restored(&restored).await;
        }

        let aggregator = self.orchestrator_ctx.aggregator.clone();
        let cancel = self.aggregator_cancel.clone();
        tokio::spawn(async move {
            aggregator.run(cancel).await;
        });

        if self.config.auto_resume_downloads {
            self.scheduler.request_admission().await;
        }
        Ok(())
    }

    /// Stops the background Aggregator flush loop. Call once on graceful
    /// shutdown; in-flight downloads themselves are torn down by cancelling
    /// their own tokens via [`Self::pause`] or [`Self::cancel`].
    pub fn shutdown(&self) {
        self.aggregator_cancel.cancel();
    }

    /// `download({id, title, url, ...})`: idempotently enqueues a single
    /// file. A second call with the same id while it is already queued or
    /// active is a no-op, satisfying the idempotent-enqueue invariant.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the row cannot be persisted, or
    /// [`EngineError::Config`] if `queue_admission_limit` is exhausted (the
    /// distinct admission-table "queue full" signal).
    #[instrument(skip(self, request), fields(id = %request.id))]
    pub async fn download(&self, request: DownloadRequest) -> Result<(), EngineError> {
        match self.store.get_download(&request.id).await {
            Ok(existing) if existing.state().map(|s| !s.is_terminal()).unwrap_or(true) => {
                info!(id = %request.id, "download already queued or active, ignoring duplicate request");
                return Ok(());
            }
            _ => self.check_admission_limit().await?,
        }

        let save_path = self.compose_save_path(
            &request.title,
            request.download_path.as_deref(),
            request.preserve_structure,
            None,
        );
        let now = now_unix_ms();
        let row = DownloadRow {
            id: request.id.clone(),
            title: request.title,
            url: request.url,
            save_path: save_path.display().to_string(),
            total_bytes: request.total_bytes_hint.and_then(|b| i64::try_from(b).ok()),
            state_str: DownloadState::Queued.as_str().to_string(),
            downloaded_bytes: 0,
            progress: 0.0,
            chunked: false,
            num_chunks: 1,
            force_overwrite: request.force_overwrite,
            preserve_structure: request.preserve_structure.unwrap_or(self.config.preserve_structure),
            queue_position: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            last_error: None,
            attempts: 0,
        };
        self.store.upsert_download(&row).await?;
        self.scheduler.request_admission().await;
        Ok(())
    }

    /// `download_folder({folder_id, ...})`: recursively expands a catalog
    /// folder and enqueues every file not already queued, synchronously
    /// returning the `{total_files, added, skipped, folder_title}` summary
    /// before scheduling begins.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if no catalog backend was supplied at
    /// construction, or a wrapped catalog error if the walk fails.
    #[instrument(skip(self, request), fields(folder_id = %request.folder_id))]
    pub async fn download_folder(
        &self,
        request: DownloadFolderRequest,
    ) -> Result<FolderDownloadSummary, EngineError> {
        let Some(catalog) = self.catalog.as_ref() else {
            return Err(EngineError::Config(
                "download_folder requires a catalog source".to_string(),
            ));
        };

        let already_queued = self.all_known_ids().await?;
        let preserve_structure = request.preserve_structure.unwrap_or(self.config.preserve_structure);
        let expander = FolderExpander::new(catalog.as_ref(), preserve_structure);
        let result: ExpandResult = expander
            .expand(&request.folder_id, &already_queued)
            .await
            .map_err(|e| EngineError::Config(e.to_string()))?;

        let download_path = request
            .download_path
            .clone()
            .unwrap_or_else(|| self.config.download_path.clone());

        for file in &result.files {
            let Some(url) = file.entry.url.clone() else {
                continue;
            };
            let save_path = if preserve_structure {
                download_path.join(&file.relative_path)
            } else {
                download_path.join(file.relative_path.file_name().unwrap_or_default())
            };
            let req = DownloadRequest {
                id: file.entry.id.clone(),
                title: file.entry.title.clone(),
                url,
                total_bytes_hint: file.entry.size,
                download_path: Some(save_path.parent().map(Path::to_path_buf).unwrap_or(download_path.clone())),
                preserve_structure: Some(false),
                force_overwrite: request.force_overwrite,
            };
            if let Err(e) = self.download(req).await {
                warn!(id = %file.entry.id, error = %e, "failed to enqueue file from folder expansion");
            }
        }

        Ok(FolderDownloadSummary {
            folder_title: result.folder_title,
            total_files: result.total_files,
            added: result.added,
            skipped: result.skipped,
        })
    }

    /// `pause(id)`: tears down the in-flight orchestrator task (if active)
    /// and marks the download `paused`. Resumable via [`Self::resume`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the row does not exist.
    pub async fn pause(&self, id: &str) -> Result<(), EngineError> {
        self.scheduler.cancel_active(id).await;
        self.transition(id, DownloadState::Paused).await
    }

    /// `resume(id)`: returns a paused download to `queued` and triggers an
    /// admission sweep.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the row does not exist.
    pub async fn resume(&self, id: &str) -> Result<(), EngineError> {
        self.transition(id, DownloadState::Queued).await?;
        self.scheduler.request_admission().await;
        Ok(())
    }

    /// `cancel(id)`: tears down any in-flight task and marks the download
    /// `cancelled`. If the orchestrator task is active, it performs its own
    /// `.partN` cleanup on observing the cancellation token; if the download
    /// is merely `queued`, this call alone transitions it to `cancelled`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the row does not exist.
    pub async fn cancel(&self, id: &str) -> Result<(), EngineError> {
        let was_active = self.scheduler.cancel_active(id).await;
        if was_active {
            // The orchestrator task observes the token and persists its own
            // `cancelled` transition plus `.partN` cleanup; nothing further
            // to do here.
            return Ok(());
        }
        self.transition(id, DownloadState::Cancelled).await
    }

    /// `retry(id)`: re-seeds a terminal (`interrupted` or `cancelled`)
    /// download as a fresh `queued` attempt, preserving its original
    /// `created_at` so it does not jump the FIFO queue ahead of downloads
    /// that have been waiting longer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the row does not exist.
    #[instrument(skip(self))]
    pub async fn retry(&self, id: &str) -> Result<(), EngineError> {
        let mut row = self.store.get_download(id).await?;
        row.state_str = DownloadState::Queued.as_str().to_string();
        row.last_error = None;
        row.attempts += 1;
        row.updated_at = now_unix_ms();
        row.completed_at = None;
        self.store.upsert_download(&row).await?;
        self.scheduler.request_admission().await;
        Ok(())
    }

    /// `confirm_overwrite(id)`: the only valid transition out of
    /// `awaiting-confirmation`. Exits in exactly one step to `queued` with
    /// `force_overwrite=true`, so the next admission sweep replaces the
    /// existing file rather than prompting again.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidTransition`] if the download is not
    /// currently `awaiting-confirmation`.
    #[instrument(skip(self))]
    pub async fn confirm_overwrite(&self, id: &str) -> Result<(), EngineError> {
        let mut row = self.store.get_download(id).await?;
        let current = row.state().map_err(|reason| EngineError::InvalidTransition {
            id: id.to_string(),
            reason,
        })?;
        if current != DownloadState::AwaitingConfirmation {
            return Err(EngineError::InvalidTransition {
                id: id.to_string(),
                reason: format!("expected awaiting-confirmation, found {current}"),
            });
        }
        row.state_str = DownloadState::Queued.as_str().to_string();
        row.force_overwrite = true;
        row.updated_at = now_unix_ms();
        self.store.upsert_download(&row).await?;
        self.scheduler.request_admission().await;
        Ok(())
    }

    /// `delete(id)`: removes the download and cascades its chunk rows.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] on a database failure.
    pub async fn delete(&self, id: &str) -> Result<(), EngineError> {
        self.scheduler.cancel_active(id).await;
        self.store.delete_download(id).await?;
        Ok(())
    }

    /// `clean_history(days_old)`: prunes terminal downloads older than
    /// `days_old` days and reports the count to the observer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] on a database failure.
    #[instrument(skip(self))]
    pub async fn clean_history(&self, days_old: i64) -> Result<u64, EngineError> {
        let count = self.store.prune_older_than(days_old, now_unix_ms()).await?;
        if count > 0 {
            self.orchestrator_ctx.observer.on_history_cleaned(count).await;
        }
        Ok(count)
    }

    /// `get_download_stats()`: a lock-free snapshot of active and queued ids.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] on a database failure.
    pub async fn get_download_stats(&self) -> Result<DownloadStats, EngineError> {
        let active_ids = self.store.get_active_ids().await?;
        let queued_ids = self.store.get_queued_ids_ordered_by_added_at().await?;
        Ok(DownloadStats { active_ids, queued_ids })
    }

    /// Read-only accessor used by the CLI to look up a single download's
    /// current row for display.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if no row matches `id`.
    pub async fn get_download(&self, id: &str) -> Result<DownloadRow, EngineError> {
        Ok(self.store.get_download(id).await?)
    }

    async fn transition(&self, id: &str, to: DownloadState) -> Result<(), EngineError> {
        let now = now_unix_ms();
        let completed_at = to.is_terminal().then_some(now);
        self.store.update_state(id, to, now, completed_at, None).await?;
        Ok(())
    }

    /// "Queue full" per §9's resolved open question: a distinct admission
    /// table (`queue_admission_limit`) independent of `max_parallel_downloads`,
    /// counting every non-terminal row rather than only the active set.
    async fn check_admission_limit(&self) -> Result<(), EngineError> {
        let unfinished = self.store.load_all_unfinished().await?;
        let pending = unfinished
            .iter()
            .filter(|r| r.state().map(|s| !s.is_terminal()).unwrap_or(false))
            .count();
        if pending >= self.config.queue_admission_limit {
            return Err(EngineError::Config(format!(
                "queue admission limit reached ({}/{})",
                pending, self.config.queue_admission_limit
            )));
        }
        Ok(())
    }

    async fn all_known_ids(&self) -> Result<HashSet<String>, EngineError> {
        let unfinished = self.store.load_all_unfinished().await?;
        Ok(unfinished.into_iter().map(|r| r.id).collect())
    }

    fn compose_save_path(
        &self,
        title: &str,
        download_path: Option<&std::path::Path>,
        _preserve_structure: Option<bool>,
        sub_path: Option<&std::path::Path>,
    ) -> PathBuf {
        let root = download_path
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| self.config.download_path.clone());
        match sub_path {
            Some(sub) => root.join(sub),
            None => root.join(title),
        }
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
