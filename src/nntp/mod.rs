//! NNTP client: per-connection protocol engine and the server pool
//!
//! [`NntpConnection`] owns one socket and speaks the line protocol: greeting,
//! `AUTHINFO` challenges, `GROUP`, `ARTICLE`, `QUIT`. [`ServerPool`] owns the
//! full set of [`NewsServer`]s and hands out pooled connections by failover
//! level.

mod connection;
mod pool;

pub use connection::{ConnectionStatus, NntpConnection};
pub use pool::{NewsServer, PooledConnection, ServerPool};

use thiserror::Error;

/// Maximum accepted line length; longer lines indicate a broken peer and are
/// treated as a connection error.
pub(crate) const LINE_MAX: usize = 10 * 1024;

/// Errors produced by the NNTP engine
#[derive(Debug, Error)]
pub enum NntpError {
    /// TCP connect failed
    #[error("failed to connect to {host}:{port}: {source}")]
    ConnectionFailed {
        /// Server hostname
        host: String,
        /// Server port
        port: u16,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// TLS handshake failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// Operation exceeded the configured timeout
    #[error("timed out after {seconds}s")]
    Timeout {
        /// The timeout that elapsed
        seconds: u64,
    },

    /// Server greeting was not a 2xx status
    #[error("server greeting failed: {0}")]
    Greeting(String),

    /// Authentication was rejected
    #[error("authentication failed ({0})")]
    AuthFailed(String),

    /// A line exceeded [`LINE_MAX`] bytes
    #[error("response line too long")]
    LineTooLong,

    /// The peer closed the connection mid-response
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// First digit of a 3-digit NNTP status line, or `None` for a malformed line
pub(crate) fn status_class(response: &str) -> Option<u8> {
    let bytes = response.as_bytes();
    if bytes.len() >= 3 && bytes[..3].iter().all(u8::is_ascii_digit) {
        Some(bytes[0] - b'0')
    } else {
        None
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_class_extracts_first_digit() {
        assert_eq!(status_class("211 1234 1 1234 alt.binaries.test"), Some(2));
        assert_eq!(status_class("430 no such article"), Some(4));
        assert_eq!(status_class("480 auth required"), Some(4));
    }

    #[test]
    fn status_class_rejects_malformed_lines() {
        assert_eq!(status_class(""), None);
        assert_eq!(status_class("ok"), None);
        assert_eq!(status_class("2x0 weird"), None);
    }
}
