//! Error types for nzb-engine
//!
//! This module provides the crate-wide error type plus the per-article failure
//! taxonomy the downloader state machine operates on. Article failures are
//! deliberately *not* part of [`Error`]: they are routine protocol outcomes
//! (retry, failover, level escalation) rather than operation failures.

use std::path::PathBuf;
use thiserror::Error;

use crate::nntp::NntpError;

/// Result type alias for nzb-engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nzb-engine
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "paths.dest_dir")
        key: Option<String>,
    },

    /// NNTP protocol or connection error
    #[error("NNTP error: {0}")]
    Nntp(#[from] NntpError),

    /// Invalid NZB file
    #[error("invalid NZB: {0}")]
    InvalidNzb(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Queue entry (NZB or file) not found
    #[error("queue entry not found: {0}")]
    NotFound(String),

    /// Persistent state file is damaged or has an unsupported layout
    #[error("state file error in {path}: {message}")]
    State {
        /// The state file that could not be read or written
        path: PathBuf,
        /// What went wrong
        message: String,
    },

    /// Duplicate download detected
    #[error("duplicate download: {0}")]
    Duplicate(String),

    /// Shutdown in progress - not accepting new downloads
    #[error("shutdown in progress: not accepting new downloads")]
    ShuttingDown,

    /// Operation not supported (missing external tool, not implemented)
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a [`Error::State`] with the given file and message
    pub(crate) fn state(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::State {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Terminal outcome of one article download attempt against one server.
///
/// The downloader translates NNTP responses and decoder results into this
/// taxonomy; the level/retry loop in the coordinator consumes it. See the
/// per-variant docs for how each outcome affects server selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArticleFailure {
    /// Socket/TLS/greeting failure, persistent `400`/`499`, or auth denial.
    /// The server is briefly blocked, then retried within the same budget.
    ConnectError,
    /// Article or group absent on this server (`41x`/`42x`/`43x`).
    /// The server is excluded from further tries at the current level.
    NotFound,
    /// Decoded but the CRC32 did not match the trailer. Treated like
    /// [`ArticleFailure::NotFound`]: the copy on this server is corrupt.
    CrcError,
    /// Generic transient failure (incomplete body, unknown non-2xx status,
    /// decode failure). Consumes one unit of the retry budget.
    Failed,
    /// The file is older than this server's retention window. Counts against
    /// the server without consuming a socket retry.
    RetentionExpired,
    /// Unrecoverable local failure (disk write error, out of space).
    /// Aborts the article entirely.
    FatalError,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_error_displays_path_and_message() {
        let err = Error::state("/tmp/queue/queue.state", "bad signature");
        let msg = err.to_string();
        assert!(
            msg.contains("/tmp/queue/queue.state"),
            "state error must name the offending file, got: {msg}"
        );
        assert!(msg.contains("bad signature"));
    }

    #[test]
    fn io_error_converts_via_from() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn article_failure_variants_are_distinct() {
        // The downloader loop branches on exact equality; a merged variant
        // would silently change failover behaviour.
        let all = [
            ArticleFailure::ConnectError,
            ArticleFailure::NotFound,
            ArticleFailure::CrcError,
            ArticleFailure::Failed,
            ArticleFailure::RetentionExpired,
            ArticleFailure::FatalError,
        ];
        for (i, a) in all.iter().enumerate() {
            for (j, b) in all.iter().enumerate() {
                assert_eq!(i == j, a == b, "{a:?} vs {b:?}");
            }
        }
    }
}
