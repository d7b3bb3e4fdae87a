//! Download Orchestrator (C8): owns the per-file state machine, coordinating
//! the Planner, Fetcher/Chunk Worker Pool, and Merge Worker behind a single
//! `run()` entry point the Scheduler drives one task per active download.
//!
//! Drives explicit transitions through the `store::models::DownloadState`
//! string-backed enum, persisting each one via
//! [`crate::store::Store::update_state`] and notifying the observer, the way
//! a `QueueStatus` change gets persisted through a `Queue`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::aggregator::ProgressAggregator;
use crate::breaker::{BreakerScope, CircuitBreaker};
use crate::chunk_pool::{self, ChunkPoolContext, ChunkPoolOutcome};
use crate::error::EngineError;
use crate::merge::{self, MergeInput};
use crate::net::{HttpFetcher, RateLimiter, RetryPolicy};
use crate::observer::SharedObserver;
use crate::planner::{self, ChunkingPolicy, DownloadPlan};
use crate::store::{ChunkRow, DownloadState, Store};

/// Shared, cheaply-cloneable services every orchestrated download needs.
/// Constructed once by the [`crate::engine::Engine`] and handed to every
/// per-download task the Scheduler spawns.
#[derive(Clone)]
pub struct OrchestratorContext {
    pub store: Store,
    pub observer: SharedObserver,
    pub fetcher: HttpFetcher,
    /// Gates the metadata probe; the chunk pool has its own concurrency cap
    /// and does not go through this limiter.
    pub rate_limiter: Arc<RateLimiter>,
    /// Keyed by URL host; shared across every download.
    pub host_breaker: CircuitBreaker,
    /// Keyed by download id; tracks repeated failures of one resource.
    pub resource_breaker: CircuitBreaker,
    pub aggregator: ProgressAggregator,
    pub retry_policy: RetryPolicy,
    pub chunking_policy: ChunkingPolicy,
    pub max_chunk_concurrency: usize,
    pub overwrite_tolerance_bytes: u64,
}

/// What the Scheduler asks the Orchestrator to start.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub id: String,
    pub url: String,
    pub save_path: PathBuf,
    /// Size hint from the catalog, if any; refined by the probe.
    pub total_bytes_hint: Option<u64>,
    pub force_overwrite: bool,
}

/// Terminal (or requeue) result of one `run()` call. The Scheduler uses this
/// to decide whether to free the active slot, keep the id out of rotation
/// pending user confirmation, or retry later.
#[derive(Debug)]
pub enum DownloadOutcome {
    Completed { bytes: u64 },
    AwaitingConfirmation,
    Cancelled,
    /// A host or resource breaker is open; the download was returned to
    /// `queued` so a later admission sweep can retry it.
    Requeued,
    Interrupted(EngineError),
}

/// Runs one download end to end: probe, overwrite check, plan, fetch,
/// optional merge. Always returns a [`DownloadOutcome`]; store/observer
/// failures along the way are logged rather than propagated, matching the
/// "store errors never crash the engine" policy.
#[instrument(skip(ctx, cancel), fields(id = %request.id))]
pub async fn run(
    ctx: &OrchestratorContext,
    request: StartRequest,
    cancel: CancellationToken,
) -> DownloadOutcome {
    let id = request.id.as_str();

    if !ctx.resource_breaker.allow(id) {
        info!(id, "resource breaker open, deferring to next admission sweep");
        set_state(ctx, id, DownloadState::Starting, DownloadState::Queued, None).await;
        return DownloadOutcome::Requeued;
    }

    set_state(ctx, id, DownloadState::Queued, DownloadState::Starting, None).await;

    let probe_result = ctx
        .rate_limiter
        .schedule(&request.url, || ctx.fetcher.probe(&request.url))
        .await;
    let probe = match probe_result {
        Ok(probe) => probe,
        Err(e) => {
            ctx.resource_breaker.record_failure(id);
            return interrupt(ctx, id, EngineError::Fetch(e)).await;
        }
    };
    let total_bytes = probe.total_bytes.or(request.total_bytes_hint);

    if !request.force_overwrite
        && existing_file_matches(&request.save_path, total_bytes, ctx.overwrite_tolerance_bytes).await
    {
        info!(id, "existing file matches expected size, awaiting confirmation");
        set_state(
            ctx,
            id,
            DownloadState::Starting,
            DownloadState::AwaitingConfirmation,
            None,
        )
        .await;
        return DownloadOutcome::AwaitingConfirmation;
    }

    if let Some(parent) = request.save_path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return interrupt(
                ctx,
                id,
                EngineError::Filesystem {
                    path: parent.display().to_string(),
                    source: e,
                },
            )
            .await;
        }
    }

    let plan = planner::plan_download(total_bytes, probe.accept_ranges, &ctx.chunking_policy);
    let chunk_indices: Vec<u32> = match &plan {
        DownloadPlan::Chunked(chunks) => chunks.iter().map(|c| c.index).collect(),
        DownloadPlan::Single => Vec::new(),
    };

    if let DownloadPlan::Chunked(chunks) = &plan {
        for chunk in chunks {
            let row = ChunkRow {
                download_id: id.to_string(),
                index: i64::from(chunk.index),
                byte_start: i64::try_from(chunk.byte_start).unwrap_or(i64::MAX),
                byte_end: i64::try_from(chunk.byte_end).unwrap_or(i64::MAX),
                size: i64::try_from(chunk.size()).unwrap_or(i64::MAX),
                downloaded_bytes: 0,
                completed: false,
                attempts: 0,
                last_error: None,
            };
            if let Err(e) = ctx.store.update_chunk(&row).await {
                warn!(id, chunk = chunk.index, error = %e, "failed to persist chunk row");
            }
        }
    }

    if let DownloadPlan::Chunked(chunks) = &plan {
        let chunk_sizes: Vec<u64> = chunks.iter().map(planner::ChunkPlan::size).collect();
        ctx.aggregator.register_chunked(id, total_bytes, &chunk_sizes);
    } else {
        ctx.aggregator.register(id, total_bytes);
    }
    set_state(ctx, id, DownloadState::Starting, DownloadState::Progressing, None).await;

    let host_key = url::Url::parse(&request.url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| request.url.clone());

    let pool_ctx = ChunkPoolContext {
        download_id: id.to_string(),
        url: request.url.clone(),
        save_path: request.save_path.clone(),
        host_key,
        fetcher: ctx.fetcher.clone(),
        host_breaker: ctx.host_breaker.clone(),
        aggregator: ctx.aggregator.clone(),
        retry_policy: ctx.retry_policy.clone(),
        max_chunk_concurrency: ctx.max_chunk_concurrency,
        cancel: cancel.clone(),
    };

    let outcome = match chunk_pool::run(pool_ctx, plan).await {
        Ok(outcome) => outcome,
        Err(EngineError::UserCancelled { .. }) => {
            cleanup_on_cancel(&request.save_path, &chunk_indices).await;
            ctx.aggregator.deregister(id);
            set_state(ctx, id, DownloadState::Progressing, DownloadState::Cancelled, None).await;
            return DownloadOutcome::Cancelled;
        }
        Err(EngineError::CircuitOpen { scope }) => {
            info!(id, %scope, "breaker open mid-transfer, requeuing");
            ctx.aggregator.deregister(id);
            set_state(ctx, id, DownloadState::Progressing, DownloadState::Queued, None).await;
            return DownloadOutcome::Requeued;
        }
        Err(e) => {
            ctx.resource_breaker.record_failure(id);
            ctx.aggregator.deregister(id);
            return interrupt_from(ctx, id, DownloadState::Progressing, e).await;
        }
    };

    let total_written = match outcome {
        ChunkPoolOutcome::Direct { bytes } => bytes,
        ChunkPoolOutcome::Chunks(completed) => {
            set_state(ctx, id, DownloadState::Progressing, DownloadState::Merging, None).await;
            let parts: Vec<MergeInput> = completed
                .iter()
                .map(|c| MergeInput {
                    part_path: c.part_path.clone(),
                    expected_size: c.bytes,
                })
                .collect();
            match merge::merge_parts(id.to_string(), parts, request.save_path.clone(), ctx.aggregator.clone()).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    ctx.aggregator.deregister(id);
                    return interrupt_from(ctx, id, DownloadState::Merging, e).await;
                }
            }
        }
    };

    ctx.resource_breaker.record_success(id);
    ctx.aggregator.flush_once().await;
    ctx.aggregator.deregister(id);

    let from = if chunk_indices.is_empty() {
        DownloadState::Progressing
    } else {
        DownloadState::Merging
    };
    set_completed(ctx, id, from, total_written).await;

    DownloadOutcome::Completed { bytes: total_written }
}

/// Whether a file already exists at `save_path` and, when `total_bytes` is
/// known, its length is within `tolerance` bytes of the expected size. When
/// `total_bytes` is unknown, mere presence is treated as a match — the
/// engine cannot verify completeness, so it defers to the user rather than
/// silently overwriting.
async fn existing_file_matches(save_path: &Path, total_bytes: Option<u64>, tolerance: u64) -> bool {
    let Ok(metadata) = tokio::fs::metadata(save_path).await else {
        return false;
    };
    match total_bytes {
        Some(expected) => metadata.len().abs_diff(expected) <= tolerance,
        None => true,
    }
}

async fn cleanup_on_cancel(save_path: &Path, chunk_indices: &[u32]) {
    if chunk_indices.is_empty() {
        let _ = tokio::fs::remove_file(save_path).await;
        return;
    }
    for index in chunk_indices {
        let _ = tokio::fs::remove_file(chunk_pool::part_path_for(save_path, *index)).await;
    }
}

async fn interrupt(ctx: &OrchestratorContext, id: &str, error: EngineError) -> DownloadOutcome {
    interrupt_from(ctx, id, DownloadState::Starting, error).await
}

async fn interrupt_from(
    ctx: &OrchestratorContext,
    id: &str,
    from: DownloadState,
    error: EngineError,
) -> DownloadOutcome {
    let message = error.to_string();
    warn!(id, %message, "download interrupted");
    set_state_with_error(ctx, id, from, DownloadState::Interrupted, Some(&message)).await;
    ctx.observer.on_error(Some(id), error.error_kind(), &message).await;
    DownloadOutcome::Interrupted(error)
}

async fn set_completed(ctx: &OrchestratorContext, id: &str, from: DownloadState, _bytes: u64) {
    let now = now_unix_ms();
    if let Err(e) = ctx
        .store
        .update_state(id, DownloadState::Completed, now, Some(now), None)
        .await
    {
        warn!(id, error = %e, "failed to persist completed state");
    }
    ctx.observer.on_state_change(id, from, DownloadState::Completed).await;
}

async fn set_state(ctx: &OrchestratorContext, id: &str, from: DownloadState, to: DownloadState, last_error: Option<&str>) {
    set_state_with_error(ctx, id, from, to, last_error).await;
}

async fn set_state_with_error(
    ctx: &OrchestratorContext,
    id: &str,
    from: DownloadState,
    to: DownloadState,
    last_error: Option<&str>,
) {
    let now = now_unix_ms();
    let completed_at = to.is_terminal().then_some(now);
    if let Err(e) = ctx.store.update_state(id, to, now, completed_at, last_error).await {
        warn!(id, error = %e, "failed to persist state transition, continuing in-memory");
    }
    ctx.observer.on_state_change(id, from, to).await;
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

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::observer::NullObserver;
    use crate::store::{DownloadRow, DownloadState as State};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn seed_row(id: &str, url: &str, save_path: &Path) -> DownloadRow {
        DownloadRow {
            id: id.to_string(),
            title: id.to_string(),
            url: url.to_string(),
            save_path: save_path.display().to_string(),
            total_bytes: None,
            state_str: State::Queued.as_str().to_string(),
            downloaded_bytes: 0,
            progress: 0.0,
            chunked: false,
            num_chunks: 1,
            force_overwrite: false,
            preserve_structure: true,
            queue_position: None,
            created_at: 0,
            updated_at: 0,
            completed_at: None,
            last_error: None,
            attempts: 0,
        }
    }

    async fn harness() -> (OrchestratorContext, Store) {
        let store = Store::in_memory().await.unwrap();
        let ctx = OrchestratorContext {
            store: store.clone(),
            observer: Arc::new(NullObserver),
            fetcher: HttpFetcher::new(),
            rate_limiter: Arc::new(RateLimiter::disabled()),
            host_breaker: CircuitBreaker::new(BreakerConfig::default()),
            resource_breaker: CircuitBreaker::new(BreakerConfig::default()),
            aggregator: ProgressAggregator::new(
                store.clone(),
                Arc::new(NullObserver),
                Duration::from_millis(50),
            ),
            retry_policy: RetryPolicy::with_max_attempts(2),
            chunking_policy: ChunkingPolicy {
                target_chunk_size: 1_000_000,
                min_chunk_threshold: 1_000_000,
                max_chunks: 8,
            },
            max_chunk_concurrency: 4,
            overwrite_tolerance_bytes: 0,
        };
        (ctx, store)
    }

    #[tokio::test]
    async fn test_single_stream_download_completes() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world".to_vec()))
            .mount(&mock_server)
            .await;

        let dir = TempDir::new().unwrap();
        let save_path = dir.path().join("out.bin");
        let url = format!("{}/file.bin", mock_server.uri());
        let (ctx, store) = harness().await;
        store.upsert_download(&seed_row("dl-1", &url, &save_path)).await.unwrap();

        let request = StartRequest {
            id: "dl-1".to_string(),
            url,
            save_path: save_path.clone(),
            total_bytes_hint: None,
            force_overwrite: false,
        };
        let outcome = run(&ctx, request, CancellationToken::new()).await;

        assert!(matches!(outcome, DownloadOutcome::Completed { bytes: 11 }));
        assert_eq!(std::fs::read(&save_path).unwrap(), b"hello world");
        let row = store.get_download("dl-1").await.unwrap();
        assert_eq!(row.state().unwrap(), State::Completed);
    }

    #[tokio::test]
    async fn test_chunked_download_merges_and_completes() {
        let mock_server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/big.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-length", "20")
                    .insert_header("accept-ranges", "bytes"),
            )
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/big.bin"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![b'x'; 10]))
            .mount(&mock_server)
            .await;

        let dir = TempDir::new().unwrap();
        let save_path = dir.path().join("out.bin");
        let url = format!("{}/big.bin", mock_server.uri());
        let (mut ctx, store) = harness().await;
        ctx.chunking_policy = ChunkingPolicy {
            target_chunk_size: 10,
            min_chunk_threshold: 1,
            max_chunks: 2,
        };
        store.upsert_download(&seed_row("dl-2", &url, &save_path)).await.unwrap();

        let request = StartRequest {
            id: "dl-2".to_string(),
            url,
            save_path: save_path.clone(),
            total_bytes_hint: None,
            force_overwrite: false,
        };
        let outcome = run(&ctx, request, CancellationToken::new()).await;

        assert!(matches!(outcome, DownloadOutcome::Completed { bytes: 20 }));
        assert_eq!(std::fs::read(&save_path).unwrap().len(), 20);
        assert!(!chunk_pool::part_path_for(&save_path, 0).exists());
        let row = store.get_download("dl-2").await.unwrap();
        assert_eq!(row.state().unwrap(), State::Completed);
    }

    #[tokio::test]
    async fn test_existing_matching_file_awaits_confirmation() {
        let mock_server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-length", "5"))
            .mount(&mock_server)
            .await;

        let dir = TempDir::new().unwrap();
        let save_path = dir.path().join("out.bin");
        std::fs::write(&save_path, b"aaaaa").unwrap();
        let url = format!("{}/file.bin", mock_server.uri());
        let (ctx, store) = harness().await;
        store.upsert_download(&seed_row("dl-3", &url, &save_path)).await.unwrap();

        let request = StartRequest {
            id: "dl-3".to_string(),
            url,
            save_path: save_path.clone(),
            total_bytes_hint: None,
            force_overwrite: false,
        };
        let outcome = run(&ctx, request, CancellationToken::new()).await;

        assert!(matches!(outcome, DownloadOutcome::AwaitingConfirmation));
        assert_eq!(std::fs::read(&save_path).unwrap(), b"aaaaa");
        let row = store.get_download("dl-3").await.unwrap();
        assert_eq!(row.state().unwrap(), State::AwaitingConfirmation);
    }

    #[tokio::test]
    async fn test_force_overwrite_bypasses_confirmation() {
        let mock_server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-length", "5"))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"bbbbb".to_vec()))
            .mount(&mock_server)
            .await;

        let dir = TempDir::new().unwrap();
        let save_path = dir.path().join("out.bin");
        std::fs::write(&save_path, b"aaaaa").unwrap();
        let url = format!("{}/file.bin", mock_server.uri());
        let (ctx, store) = harness().await;
        store.upsert_download(&seed_row("dl-4", &url, &save_path)).await.unwrap();

        let request = StartRequest {
            id: "dl-4".to_string(),
            url,
            save_path: save_path.clone(),
            total_bytes_hint: None,
            force_overwrite: true,
        };
        let outcome = run(&ctx, request, CancellationToken::new()).await;

        assert!(matches!(outcome, DownloadOutcome::Completed { .. }));
        assert_eq!(std::fs::read(&save_path).unwrap(), b"bbbbb");
    }

    #[tokio::test]
    async fn test_open_resource_breaker_requeues_without_network_call() {
        let (ctx, store) = harness().await;
        store
            .upsert_download(&seed_row("dl-5", "https://example.invalid/a.bin", Path::new("/tmp/a.bin")))
            .await
            .unwrap();
        ctx.resource_breaker.record_failure("dl-5");
        ctx.resource_breaker.record_failure("dl-5");
        ctx.resource_breaker.record_failure("dl-5");

        let request = StartRequest {
            id: "dl-5".to_string(),
            url: "https://example.invalid/a.bin".to_string(),
            save_path: PathBuf::from("/tmp/a.bin"),
            total_bytes_hint: None,
            force_overwrite: false,
        };
        let outcome = run(&ctx, request, CancellationToken::new()).await;
        assert!(matches!(outcome, DownloadOutcome::Requeued));
        let row = store.get_download("dl-5").await.unwrap();
        assert_eq!(row.state().unwrap(), State::Queued);
    }

    #[tokio::test]
    async fn test_not_found_interrupts_and_records_last_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/missing.bin"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing.bin"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let dir = TempDir::new().unwrap();
        let save_path = dir.path().join("out.bin");
        let url = format!("{}/missing.bin", mock_server.uri());
        let (ctx, store) = harness().await;
        store.upsert_download(&seed_row("dl-6", &url, &save_path)).await.unwrap();

        let request = StartRequest {
            id: "dl-6".to_string(),
            url,
            save_path,
            total_bytes_hint: None,
            force_overwrite: false,
        };
        let outcome = run(&ctx, request, CancellationToken::new()).await;

        assert!(matches!(outcome, DownloadOutcome::Interrupted(_)));
        let row = store.get_download("dl-6").await.unwrap();
        assert_eq!(row.state().unwrap(), State::Interrupted);
        assert!(row.last_error.is_some());
    }
}
