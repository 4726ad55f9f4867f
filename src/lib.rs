//! # nzb-engine
//!
//! Usenet binary download engine: given an NZB manifest enumerating the
//! multi-part articles of a batch, the engine fetches every article from a
//! tier of authenticated news servers, decodes the transfer encoding,
//! reassembles the source files and tracks their health.
//!
//! ## Design Philosophy
//!
//! nzb-engine is designed to be:
//! - **A core, not an application** - no CLI, no RPC, no UI; those live in
//!   consumers that drive the engine handle and subscribe to its events
//! - **Failover-first** - servers are organised in levels; an article walks
//!   the levels with per-server retry budgets before it is given up
//! - **Crash-safe** - queue and per-file progress are journaled to disk via
//!   atomic replace, so a crash costs at most one save window
//!
//! ## Quick Start
//!
//! ```no_run
//! use nzb_engine::{Config, DownloadEngine, ServerConfig, run_with_shutdown};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         servers: vec![ServerConfig {
//!             id: 1,
//!             name: "primary".to_string(),
//!             host: "news.example.com".to_string(),
//!             port: 563,
//!             encryption: true,
//!             cipher: None,
//!             username: Some("user".to_string()),
//!             password: Some("pass".to_string()),
//!             connections: 8,
//!             level: 0,
//!             group: 0,
//!             join_group: false,
//!             retention_days: 0,
//!             active: true,
//!         }],
//!         ..Default::default()
//!     };
//!
//!     let engine = DownloadEngine::new(config)?;
//!     let _coordinator = engine.start();
//!
//!     // Subscribe to events
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let nzb = std::fs::read("example.nzb")?;
//!     engine.add_nzb(&nzb, "example.nzb", false)?;
//!
//!     run_with_shutdown(engine).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]

/// Configuration types
pub mod config;
/// Queue coordinator and the engine handle
pub mod coordinator;
/// Streaming yEnc / UU decoders
pub mod decoder;
/// Crash-safe persistent state
pub mod diskstate;
/// Error types
pub mod error;
/// NNTP protocol engine and server pool
pub mod nntp;
/// NZB manifest parsing
pub mod nzb;
/// Parchive verify/repair seam
pub mod parity;
/// The canonical in-memory download queue
pub mod queue;
/// Article scheduling
pub mod scheduler;
/// Script back-channel parsing
pub mod scripts;
/// Speed metering and per-server statistics
pub mod stats;
/// Core identifiers, events and status enums
pub mod types;
/// Article writing and file assembly
pub mod writer;

// Re-export commonly used types
pub use config::{Config, HealthCheckAction, ServerConfig};
pub use coordinator::{DownloadEngine, NzbSnapshot};
pub use error::{ArticleFailure, Error, Result};
pub use parity::{NoOpParityHandler, ParityCapabilities, ParityHandler, RepairResult, VerifyResult};
pub use queue::EditAction;
pub use types::{Event, FileId, NzbId};

/// Run the engine until a termination signal arrives, then shut down
/// gracefully.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(engine: DownloadEngine) -> Result<()> {
    wait_for_signal().await;
    engine.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration can fail in restricted environments (containers,
    // tests); degrade one handler at a time.
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
