//! Crate-wide error taxonomy (A2): composes each module boundary's
//! `thiserror` enum into one `EngineError`, and maps it to the coarse
//! [`ErrorKind`] the `error-notification` observer event carries.

use thiserror::Error;

use crate::breaker::BreakerScope;
use crate::net::FetchError;
use crate::store::StoreError;

/// Crate-wide error type. Composes module errors via `#[from]` where no
/// extra context beyond the source error is needed; fetch/merge errors
/// that need id/path context are wrapped explicitly by their callers
/// instead of relying on a blanket conversion.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A fetch (probe or ranged GET) failed.
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// The store rejected or failed to apply an operation.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A host or resource circuit breaker is open.
    #[error("circuit open ({scope})")]
    CircuitOpen {
        /// Which breaker tripped.
        scope: BreakerScope,
    },

    /// The merge worker failed to concatenate chunk parts into the final file.
    #[error("merge failed for {id}: {source}")]
    Merge {
        /// The download whose merge failed.
        id: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A filesystem operation outside of merge/fetch failed (e.g. creating
    /// the destination directory, or an integrity check after merge).
    #[error("filesystem error for {path}: {source}")]
    Filesystem {
        /// Path involved in the failing operation.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The user (or a caller) cancelled an in-flight download.
    #[error("download {id} was cancelled")]
    UserCancelled {
        /// The cancelled download's id.
        id: String,
    },

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A state machine transition was attempted that the current state
    /// does not allow (e.g. `confirm_overwrite` on a `progressing` download).
    #[error("invalid transition for download {id}: {reason}")]
    InvalidTransition {
        /// The download whose transition was rejected.
        id: String,
        /// Human-readable reason.
        reason: String,
    },
}

/// Coarse error classification carried in the `error-notification` observer
/// event; the engine emits kinds and parameters, the observer (UI) owns the
/// localized message table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    HttpStatus,
    Timeout,
    Filesystem,
    CircuitOpen,
    Merge,
    Store,
    UserCancelled,
    Config,
}

impl EngineError {
    /// Maps this error to its §7 error-kind classification.
    #[must_use]
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(FetchError::Network { .. }) => ErrorKind::Network,
            Self::Fetch(FetchError::Timeout { .. }) => ErrorKind::Timeout,
            Self::Fetch(FetchError::HttpStatus { .. } | FetchError::RangeNotHonored { .. }) => {
                ErrorKind::HttpStatus
            }
            Self::Fetch(FetchError::RedirectionNotSupported { .. }) => ErrorKind::HttpStatus,
            Self::Fetch(FetchError::Io { .. } | FetchError::Integrity { .. }) => {
                ErrorKind::Filesystem
            }
            Self::Fetch(FetchError::InvalidUrl { .. }) => ErrorKind::Config,
            Self::Fetch(FetchError::Cancelled { .. }) => ErrorKind::UserCancelled,
            Self::Store(_) => ErrorKind::Store,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Merge { .. } | Self::Filesystem { .. } => ErrorKind::Filesystem,
            Self::UserCancelled { .. } => ErrorKind::UserCancelled,
            Self::Config(_) | Self::InvalidTransition { .. } => ErrorKind::Config,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_timeout_maps_to_timeout_kind() {
        let err = EngineError::Fetch(FetchError::timeout("https://example.com/a"));
        assert_eq!(err.error_kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_circuit_open_maps_to_circuit_open_kind() {
        let err = EngineError::CircuitOpen {
            scope: BreakerScope::Host("example.com".to_string()),
        };
        assert_eq!(err.error_kind(), ErrorKind::CircuitOpen);
    }

    #[test]
    fn test_store_error_maps_to_store_kind() {
        let err = EngineError::Store(StoreError::DownloadNotFound("x".to_string()));
        assert_eq!(err.error_kind(), ErrorKind::Store);
    }

    #[test]
    fn test_user_cancelled_maps_to_user_cancelled_kind() {
        let err = EngineError::UserCancelled { id: "x".to_string() };
        assert_eq!(err.error_kind(), ErrorKind::UserCancelled);
    }
}
