//! Chunk Worker Pool (C6): fetches a download's chunks (or its single
//! unranged stream) with bounded concurrency, resuming from existing
//! `.partN` bytes and retrying transient failures.
//!
//! A semaphore-bounded spawn loop with `RetryPolicy` + `classify_error`
//! driving a per-attempt retry loop, applied per chunk per download rather
//! than per queue slot, adding the host circuit breaker check and the
//! byte-length-based resume a non-ranged client has no counterpart for.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{instrument, warn};

use crate::breaker::{BreakerScope, CircuitBreaker};
use crate::error::EngineError;
use crate::net::{HttpFetcher, RetryDecision, RetryPolicy, classify_error};
use crate::net::FetchError;
use crate::planner::{ChunkPlan, DownloadPlan};
use crate::aggregator::ProgressAggregator;
use crate::timer::TimerService;

/// A chunk whose part file is fully downloaded, ready for the Merge Worker.
#[derive(Debug, Clone)]
pub struct CompletedChunk {
    pub index: u32,
    pub part_path: PathBuf,
    pub bytes: u64,
}

/// Result of running the pool against a [`DownloadPlan`].
#[derive(Debug)]
pub enum ChunkPoolOutcome {
    /// Single unranged fetch; the final file is already in place.
    Direct { bytes: u64 },
    /// Chunked fetch; parts still need merging.
    Chunks(Vec<CompletedChunk>),
}

/// Shared, cheaply-cloneable context every chunk worker task needs.
#[derive(Clone)]
pub struct ChunkPoolContext {
    pub download_id: String,
    pub url: String,
    pub save_path: PathBuf,
    pub host_key: String,
    pub fetcher: HttpFetcher,
    pub host_breaker: CircuitBreaker,
    pub aggregator: ProgressAggregator,
    pub retry_policy: RetryPolicy,
    pub max_chunk_concurrency: usize,
    pub cancel: tokio_util::sync::CancellationToken,
}

impl ChunkPoolContext {
    fn timer(&self) -> TimerService {
        TimerService::new()
    }
}

/// Runs the pool for `plan`, producing either a directly-written final file
/// or a set of completed chunk parts awaiting merge.
///
/// # Errors
///
/// Returns [`EngineError::UserCancelled`] if `ctx.cancel` fires, or
/// [`EngineError::CircuitOpen`] if the host breaker trips mid-transfer.
/// Otherwise, a single chunk exhausting its retries does not fail the
/// download outright: it is retried in a fresh sweep alongside any other
/// still-failing chunks, and the download only fails once a full sweep
/// completes none of the chunks still pending.
#[instrument(skip(ctx, plan), fields(download_id = %ctx.download_id))]
pub async fn run(ctx: ChunkPoolContext, plan: DownloadPlan) -> Result<ChunkPoolOutcome, EngineError> {
    match plan {
        DownloadPlan::Single => {
            let bytes = run_direct(&ctx).await?;
            Ok(ChunkPoolOutcome::Direct { bytes })
        }
        DownloadPlan::Chunked(chunks) => run_chunked(&ctx, chunks).await,
    }
}

/// Derives a chunk's part-file path from the download's final save path.
/// Shared with the Orchestrator, which needs the same mapping to clean up
/// `.partN` files on cancellation.
pub(crate) fn part_path_for(save_path: &std::path::Path, index: u32) -> PathBuf {
    let mut os = save_path.as_os_str().to_os_string();
    os.push(format!(".part{index}"));
    PathBuf::from(os)
}

async fn current_file_len(path: &std::path::Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

/// Unranged, whole-body fetch for a [`DownloadPlan::Single`] plan. The
/// server advertised no range support, so each retry restarts from byte 0.
async fn run_direct(ctx: &ChunkPoolContext) -> Result<u64, EngineError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if ctx.cancel.is_cancelled() {
            return Err(EngineError::UserCancelled { id: ctx.download_id.clone() });
        }
        if !ctx.host_breaker.allow(&ctx.host_key) {
            return Err(EngineError::CircuitOpen {
                scope: BreakerScope::Host(ctx.host_key.clone()),
            });
        }
        let _ = tokio::fs::remove_file(&ctx.save_path).await;

        match ctx
            .fetcher
            .fetch_range(&ctx.url, 0, None, &ctx.save_path, &ctx.cancel)
            .await
        {
            Ok(outcome) => {
                ctx.host_breaker.record_success(&ctx.host_key);
                ctx.aggregator.add_bytes(&ctx.download_id, outcome.bytes_written);
                return Ok(outcome.bytes_written);
            }
            Err(FetchError::Cancelled { .. }) => {
                return Err(EngineError::UserCancelled { id: ctx.download_id.clone() });
            }
            Err(e) => {
                ctx.host_breaker.record_failure(&ctx.host_key);
                match ctx.retry_policy.should_retry(classify_error(&e), attempt) {
                    RetryDecision::Retry { delay, .. } => {
                        warn!(download_id = %ctx.download_id, attempt, error = %e, "retrying direct fetch");
                        ctx.timer().sleep(delay).await;
                    }
                    RetryDecision::DoNotRetry { reason } => {
                        warn!(download_id = %ctx.download_id, reason, "direct fetch exhausted retries");
                        return Err(EngineError::Fetch(e));
                    }
                }
            }
        }
    }
}

/// Runs every chunk concurrently (bounded by `max_chunk_concurrency`) in
/// sweeps: a sweep's survivors (chunks that exhausted their own worker-level
/// retries) are retried together in the next sweep rather than failing the
/// whole download immediately. The download only fails once a sweep
/// completes zero new chunks while chunks remain pending -- no further
/// sweep could possibly make progress at that point.
///
/// A chunk failing with [`FetchError::RangeNotHonored`] (the server served
/// `200` instead of `206` for a ranged request) short-circuits every other
/// pending chunk and downgrades the whole download to a non-chunked
/// restart from byte zero, since a server that won't honor ranges for one
/// chunk won't honor them for any other either.
async fn run_chunked(
    ctx: &ChunkPoolContext,
    chunks: Vec<ChunkPlan>,
) -> Result<ChunkPoolOutcome, EngineError> {
    let all_indices: Vec<u32> = chunks.iter().map(|c| c.index).collect();
    let total_bytes: u64 = chunks.iter().map(ChunkPlan::size).sum();
    let mut pending = chunks;
    let mut completed: Vec<CompletedChunk> = Vec::new();

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(EngineError::UserCancelled { id: ctx.download_id.clone() });
        }
        if pending.is_empty() {
            break;
        }

        let semaphore = Arc::new(Semaphore::new(ctx.max_chunk_concurrency.max(1)));
        let mut set = JoinSet::new();
        for chunk in pending.drain(..) {
            let semaphore = Arc::clone(&semaphore);
            let worker_ctx = ctx.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = run_single_chunk(&worker_ctx, chunk).await;
                (chunk, result)
            });
        }

        let mut retry_chunks = Vec::new();
        let mut sweep_progress = false;
        let mut range_not_honored = false;
        let mut last_err = None;

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(chunk))) => {
                    completed.push(chunk);
                    sweep_progress = true;
                }
                Ok((_, Err(e @ EngineError::UserCancelled { .. }))) => return Err(e),
                Ok((_, Err(e @ EngineError::CircuitOpen { .. }))) => return Err(e),
                Ok((chunk, Err(e))) => {
                    if matches!(e, EngineError::Fetch(FetchError::RangeNotHonored { .. })) {
                        range_not_honored = true;
                    }
                    last_err = Some(e);
                    retry_chunks.push(chunk);
                }
                Err(join_err) => {
                    // A worker task panicked outright rather than returning a
                    // classified error; its chunk plan is gone with it, so it
                    // cannot be re-queued for a later sweep. Fail the download
                    // now instead of silently never completing it.
                    return Err(EngineError::Merge {
                        id: ctx.download_id.clone(),
                        source: std::io::Error::other(join_err),
                    });
                }
            }
        }

        if range_not_honored {
            warn!(
                download_id = %ctx.download_id,
                "server did not honor a ranged request mid-transfer, downgrading to a non-chunked restart"
            );
            for index in &all_indices {
                let _ = tokio::fs::remove_file(part_path_for(&ctx.save_path, *index)).await;
            }
            ctx.aggregator.register(&ctx.download_id, Some(total_bytes));
            let bytes = run_direct(ctx).await?;
            return Ok(ChunkPoolOutcome::Direct { bytes });
        }

        if retry_chunks.is_empty() {
            break;
        }
        if !sweep_progress {
            warn!(
                download_id = %ctx.download_id,
                remaining = retry_chunks.len(),
                "chunk sweep made no progress, failing download"
            );
            return Err(last_err.unwrap_or_else(|| EngineError::Merge {
                id: ctx.download_id.clone(),
                source: std::io::Error::other("chunk sweep made no progress"),
            }));
        }
        pending = retry_chunks;
    }

    completed.sort_by_key(|c| c.index);
    Ok(ChunkPoolOutcome::Chunks(completed))
}

async fn run_single_chunk(ctx: &ChunkPoolContext, chunk: ChunkPlan) -> Result<CompletedChunk, EngineError> {
    let part_path = part_path_for(&ctx.save_path, chunk.index);
    let chunk_size = chunk.size();
    let mut attempt = 0u32;
    // Tracks how many of this chunk's bytes have already been reported to
    // the aggregator, so a retry that re-reads a grown `.partN` file (from
    // bytes flushed before a mid-stream failure, or from a prior process's
    // resume point) reports only the newly-observed delta, not the whole
    // file length again.
    let mut reported = 0u64;

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(EngineError::UserCancelled { id: ctx.download_id.clone() });
        }

        let existing = current_file_len(&part_path).await;
        if existing > reported {
            ctx.aggregator
                .add_chunk_bytes(&ctx.download_id, chunk.index, existing - reported);
            reported = existing;
        }
        if existing >= chunk_size {
            return Ok(CompletedChunk {
                index: chunk.index,
                part_path,
                bytes: chunk_size,
            });
        }
        let resume_from = chunk.byte_start + existing;

        attempt += 1;
        if !ctx.host_breaker.allow(&ctx.host_key) {
            return Err(EngineError::CircuitOpen {
                scope: BreakerScope::Host(ctx.host_key.clone()),
            });
        }

        match ctx
            .fetcher
            .fetch_range(&ctx.url, resume_from, Some(chunk.byte_end), &part_path, &ctx.cancel)
            .await
        {
            Ok(outcome) => {
                ctx.host_breaker.record_success(&ctx.host_key);
                ctx.aggregator
                    .add_chunk_bytes(&ctx.download_id, chunk.index, outcome.bytes_written);
                return Ok(CompletedChunk {
                    index: chunk.index,
                    part_path,
                    bytes: chunk_size,
                });
            }
            Err(FetchError::Cancelled { .. }) => {
                return Err(EngineError::UserCancelled { id: ctx.download_id.clone() });
            }
            Err(e) => {
                ctx.host_breaker.record_failure(&ctx.host_key);
                match ctx.retry_policy.should_retry(classify_error(&e), attempt) {
                    RetryDecision::Retry { delay, .. } => {
                        warn!(
                            download_id = %ctx.download_id,
                            chunk = chunk.index,
                            attempt,
                            error = %e,
                            "retrying chunk"
                        );
                        ctx.timer().sleep(delay).await;
                    }
                    RetryDecision::DoNotRetry { reason } => {
                        warn!(
                            download_id = %ctx.download_id,
                            chunk = chunk.index,
                            reason,
                            "chunk exhausted retries"
                        );
                        return Err(EngineError::Fetch(e));
                    }
                }
            }
        }
    }
}
