//! Row types persisted by the Queue Store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of a `Download`, stored as text and parsed back via
/// [`FromStr`]/[`Display`](fmt::Display), in the same string-backed-enum
/// idiom as a `QueueStatus` type would use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadState {
    /// Waiting for the scheduler to admit it.
    Queued,
    /// Admitted; probing the remote and deciding chunked vs. serial.
    Starting,
    /// Chunks (or the single stream) are being fetched.
    Progressing,
    /// All chunks complete; concatenating `.partN` files into the final file.
    Merging,
    /// Suspended by the user; resumes back to `queued`.
    Paused,
    /// Terminal: file is complete at `save_path`.
    Completed,
    /// A same-size file already exists at `save_path`; waiting on user confirmation.
    AwaitingConfirmation,
    /// Terminal (for this attempt): user-cancelled; `.partN` files are deleted.
    Cancelled,
    /// Retryable terminal state: unrecoverable error or breaker exhaustion; `.partN` kept.
    Interrupted,
}

impl DownloadState {
    /// Database string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Starting => "starting",
            Self::Progressing => "progressing",
            Self::Merging => "merging",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::AwaitingConfirmation => "awaiting-confirmation",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
        }
    }

    /// Terminal states never transition except via an explicit `retry`/`resume`
    /// call that creates a fresh attempt.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Interrupted)
    }

    /// States the scheduler counts against `max_parallel_downloads`.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Progressing | Self::Merging)
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DownloadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "starting" => Ok(Self::Starting),
            "progressing" => Ok(Self::Progressing),
            "merging" => Ok(Self::Merging),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "awaiting-confirmation" => Ok(Self::AwaitingConfirmation),
            "cancelled" => Ok(Self::Cancelled),
            "interrupted" => Ok(Self::Interrupted),
            other => Err(format!("invalid download state: {other}")),
        }
    }
}

/// A persisted download row.
#[derive(Debug, Clone, FromRow)]
pub struct DownloadRow {
    /// Stable identifier, matching the catalog id.
    pub id: String,
    pub title: String,
    pub url: String,
    pub save_path: String,
    pub total_bytes: Option<i64>,
    #[sqlx(rename = "state")]
    pub state_str: String,
    pub downloaded_bytes: i64,
    pub progress: f64,
    pub chunked: bool,
    pub num_chunks: i64,
    pub force_overwrite: bool,
    pub preserve_structure: bool,
    pub queue_position: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    pub last_error: Option<String>,
    pub attempts: i64,
}

impl DownloadRow {
    /// Parses the stored `state` column.
    ///
    /// # Errors
    ///
    /// Returns the raw string if it does not match a known state.
    pub fn state(&self) -> Result<DownloadState, String> {
        self.state_str.parse()
    }
}

/// A persisted chunk row, owned by a [`DownloadRow`] when `chunked = true`.
#[derive(Debug, Clone, FromRow)]
pub struct ChunkRow {
    pub download_id: String,
    #[sqlx(rename = "chunk_index")]
    pub index: i64,
    pub byte_start: i64,
    pub byte_end: i64,
    pub size: i64,
    pub downloaded_bytes: i64,
    pub completed: bool,
    pub attempts: i64,
    pub last_error: Option<String>,
}

impl ChunkRow {
    /// Part-file path derived from the parent download's save path.
    #[must_use]
    pub fn part_path(&self, save_path: &str) -> String {
        format!("{save_path}.part{}", self.index)
    }
}

/// One row of a progress batch flushed by the Aggregator in a single transaction.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub id: String,
    pub downloaded_bytes: i64,
    pub progress: f64,
    pub updated_at: i64,
}
