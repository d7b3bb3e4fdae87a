//! Event emitter (part of C12): the one-way Engine -> Observer channel a UI
//! (or the CLI's own progress renderer) listens on.
//!
//! Mirrors the `CatalogSource` object-safe-trait seam: default no-op
//! methods let a caller implement only the events it cares about, the way
//! an optional-hook trait is written.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ErrorKind;
use crate::store::DownloadState;

/// A single coalesced progress sample for one download, as emitted by the
/// Progress Aggregator.
#[derive(Debug, Clone)]
pub struct ProgressSample {
    pub id: String,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub progress: f64,
    pub bytes_per_sec: f64,
    /// Estimated seconds to completion, `None` when the total size or
    /// current speed is unknown.
    pub eta_seconds: Option<f64>,
    /// Number of chunks with bytes in flight but not yet complete. Always 0
    /// for a non-chunked transfer.
    pub active_chunks: usize,
    /// Number of chunks that have reached their full size. Always 0 for a
    /// non-chunked transfer (there is no merge step to report against).
    pub completed_chunks: usize,
    /// Per-chunk fraction complete, in chunk index order. Empty for a
    /// non-chunked transfer.
    pub chunk_progress: Vec<f64>,
    /// Fraction of the merge step complete (`bytes_written / total_bytes`).
    /// `None` until the download reaches `merging`.
    pub merge_progress: Option<f64>,
}

/// Sink for engine lifecycle and progress events. Implementors only need to
/// override the events they care about; every method has a no-op default.
///
/// # Object Safety
///
/// Dispatched as `Arc<dyn EngineObserver>`; `async_trait` is required
/// because native async traits are not object-safe.
#[async_trait]
pub trait EngineObserver: Send + Sync {
    /// A batch of progress samples flushed by the Aggregator.
    async fn on_progress_batch(&self, _samples: &[ProgressSample]) {}

    /// A download transitioned from `from` to `to`.
    async fn on_state_change(&self, _id: &str, _from: DownloadState, _to: DownloadState) {}

    /// Downloads rehydrated from the store at startup.
    async fn on_restored(&self, _ids: &[String]) {}

    /// History cleanup removed `count` terminal downloads.
    async fn on_history_cleaned(&self, _count: u64) {}

    /// A non-fatal or fatal error occurred for `id` (or crate-wide if `None`).
    async fn on_error(&self, _id: Option<&str>, _kind: ErrorKind, _message: &str) {}
}

/// Events delivered to a [`ChannelObserver`]'s receiving end.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ProgressBatch(Vec<ProgressSample>),
    StateChange {
        id: String,
        from: DownloadState,
        to: DownloadState,
    },
    Restored(Vec<String>),
    HistoryCleaned(u64),
    Error {
        id: Option<String>,
        kind: ErrorKind,
        message: String,
    },
}

/// Forwards every event onto an `mpsc` channel, the transport the CLI's
/// indicatif renderer consumes from on its own task.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelObserver {
    /// Creates a linked observer/receiver pair.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EngineObserver for ChannelObserver {
    async fn on_progress_batch(&self, samples: &[ProgressSample]) {
        let _ = self.sender.send(EngineEvent::ProgressBatch(samples.to_vec()));
    }

    async fn on_state_change(&self, id: &str, from: DownloadState, to: DownloadState) {
        let _ = self.sender.send(EngineEvent::StateChange {
            id: id.to_string(),
            from,
            to,
        });
    }

    async fn on_restored(&self, ids: &[String]) {
        let _ = self.sender.send(EngineEvent::Restored(ids.to_vec()));
    }

    async fn on_history_cleaned(&self, count: u64) {
        let _ = self.sender.send(EngineEvent::HistoryCleaned(count));
    }

    async fn on_error(&self, id: Option<&str>, kind: ErrorKind, message: &str) {
        let _ = self.sender.send(EngineEvent::Error {
            id: id.map(str::to_string),
            kind,
            message: message.to_string(),
        });
    }
}

/// No-op observer used when no caller wants events (e.g. library embedding
/// without a UI).
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

#[async_trait]
impl EngineObserver for NullObserver {}

/// Type alias for the shared handle components hold onto.
pub type SharedObserver = Arc<dyn EngineObserver>;
