//! Parchive verify/repair seam
//!
//! The engine drives an external Parchive implementation; it never verifies
//! or repairs itself. Implementations translate their outcome into the
//! NZB's [`crate::types::ParStatus`] through the post-processing glue.

use async_trait::async_trait;
use std::path::Path;

use crate::error::Result;

/// Result of a Parchive verification pass
#[must_use]
#[derive(Debug, Clone)]
pub struct VerifyResult {
    /// Whether all files are intact
    pub is_complete: bool,
    /// Number of damaged or missing blocks
    pub damaged_blocks: u32,
    /// Number of recovery blocks available
    pub recovery_blocks_available: u32,
    /// Whether repair is possible with the available recovery data
    pub repairable: bool,
}

/// Result of a Parchive repair pass
#[must_use]
#[derive(Debug, Clone)]
pub struct RepairResult {
    /// Whether repair succeeded
    pub success: bool,
    /// Files that were repaired
    pub repaired_files: Vec<String>,
    /// Error message when repair failed
    pub error: Option<String>,
}

/// What a handler implementation can do
#[derive(Debug, Clone, Copy)]
pub struct ParityCapabilities {
    /// Can verify file integrity
    pub can_verify: bool,
    /// Can repair damaged files
    pub can_repair: bool,
}

/// Interface to the external Parchive implementation
#[async_trait]
pub trait ParityHandler: Send + Sync {
    /// Verify the file set described by `par2_file`
    async fn verify(&self, par2_file: &Path) -> Result<VerifyResult>;

    /// Repair the file set described by `par2_file`
    async fn repair(&self, par2_file: &Path) -> Result<RepairResult>;

    /// Query this handler's capabilities
    fn capabilities(&self) -> ParityCapabilities;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}

/// Handler used when no Parchive implementation is wired in.
///
/// Verification and repair report [`crate::error::Error::NotSupported`] so
/// the post-processing glue can degrade gracefully (the download itself is
/// unaffected).
pub struct NoOpParityHandler;

#[async_trait]
impl ParityHandler for NoOpParityHandler {
    async fn verify(&self, _par2_file: &Path) -> Result<VerifyResult> {
        Err(crate::error::Error::NotSupported(
            "Parchive verification requires an external handler".into(),
        ))
    }

    async fn repair(&self, _par2_file: &Path) -> Result<RepairResult> {
        Err(crate::error::Error::NotSupported(
            "Parchive repair requires an external handler".into(),
        ))
    }

    fn capabilities(&self) -> ParityCapabilities {
        ParityCapabilities {
            can_verify: false,
            can_repair: false,
        }
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_handler_reports_not_supported() {
        let handler = NoOpParityHandler;
        assert!(matches!(
            handler.verify(Path::new("set.par2")).await,
            Err(crate::error::Error::NotSupported(_))
        ));
        assert!(matches!(
            handler.repair(Path::new("set.par2")).await,
            Err(crate::error::Error::NotSupported(_))
        ));
    }

    #[test]
    fn noop_handler_advertises_no_capabilities() {
        let caps = NoOpParityHandler.capabilities();
        assert!(!caps.can_verify);
        assert!(!caps.can_repair);
        assert_eq!(NoOpParityHandler.name(), "noop");
    }
}
