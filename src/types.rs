//! Core identifiers, events, and status enums for nzb-engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Priority at or above which an NZB bypasses a global pause
pub const FORCE_PRIORITY: i32 = 900;

/// Unique identifier for a queued NZB
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NzbId(pub i64);

impl NzbId {
    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for NzbId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for NzbId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Unique identifier for a file within the queue
///
/// File ids are unique across the whole queue (not per NZB) because temp
/// fragments and partial-state files on disk are keyed by file id alone.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FileId(pub i64);

impl FileId {
    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for FileId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// How a batch entered the queue
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NzbKind {
    /// A regular NZB manifest
    #[default]
    Nzb,
    /// A URL that resolved to an NZB manifest
    Url,
}

/// Event emitted on the observer bus during queue lifecycle
///
/// Events are delivered synchronously to the broadcast channel in the task
/// that emits them; subscribers must be non-blocking or dispatch to their own
/// queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// An NZB was parsed and is about to be queued (pre-dedup)
    NzbFound {
        /// NZB id
        id: NzbId,
        /// Display name
        name: String,
    },

    /// An NZB was added to the queue
    NzbAdded {
        /// NZB id
        id: NzbId,
        /// Display name
        name: String,
    },

    /// An NZB was removed from the queue (deleted or finished)
    NzbDeleted {
        /// NZB id
        id: NzbId,
    },

    /// A file finished downloading and was assembled
    FileCompleted {
        /// Owning NZB id
        id: NzbId,
        /// File id
        file_id: FileId,
        /// Final filename
        filename: String,
        /// Assembled output path
        path: PathBuf,
    },

    /// A file was deleted from the queue before completing
    FileDeleted {
        /// Owning NZB id
        id: NzbId,
        /// File id
        file_id: FileId,
    },

    /// A queued URL finished fetching (successfully or not)
    UrlCompleted {
        /// NZB id
        id: NzbId,
        /// Whether the URL fetch produced a usable NZB
        success: bool,
    },
}

/// Rename stage outcome
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenameStatus {
    /// Not attempted
    #[default]
    None,
    /// Files renamed successfully
    Success,
    /// Rename failed
    Failure,
}

/// Parchive verify/repair outcome
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParStatus {
    /// Not attempted
    #[default]
    None,
    /// Skipped (no par files or disabled)
    Skipped,
    /// Verified (and repaired if needed) successfully
    Success,
    /// Damaged but repair is possible with more blocks
    RepairPossible,
    /// Verification or repair failed
    Failure,
    /// Needs manual intervention
    Manual,
}

/// Unpack stage outcome
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnpackStatus {
    /// Not attempted
    #[default]
    None,
    /// Skipped (no archives or disabled)
    Skipped,
    /// Extracted successfully
    Success,
    /// Extraction failed
    Failure,
    /// Extraction aborted for lack of disk space
    Space,
    /// Archive password was wrong or missing
    Password,
}

/// Move-to-destination outcome
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveStatus {
    /// Not attempted
    #[default]
    None,
    /// Files moved successfully
    Success,
    /// Move failed
    Failure,
}

/// Why an NZB was deleted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteStatus {
    /// Not deleted
    #[default]
    None,
    /// Deleted by the user
    Manual,
    /// Deleted by the health guard
    Health,
    /// Deleted as a duplicate
    Dupe,
    /// Deleted after being marked bad
    Bad,
}

/// User mark on a history entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkStatus {
    /// No mark
    #[default]
    None,
    /// Marked good
    Good,
    /// Marked bad
    Bad,
}

/// URL fetch state for [`NzbKind::Url`] entries
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlStatus {
    /// Not started
    #[default]
    None,
    /// Fetch in progress
    Running,
    /// Fetched successfully
    Success,
    /// Fetch failed
    Failure,
}

/// Duplicate handling mode carried on each NZB
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DupeMode {
    /// Keep only the best-scored copy
    #[default]
    Score,
    /// Download all copies
    All,
    /// Download even if an identical copy was already downloaded
    Force,
}

/// Severity of a message logged against an NZB
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Informational
    Info,
    /// Warning
    Warning,
    /// Error
    Error,
    /// Detail (verbose)
    Detail,
}

/// One line of the per-NZB message log
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NzbMessage {
    /// Severity
    pub kind: MessageKind,
    /// Unix timestamp (seconds)
    pub time: i64,
    /// Message text
    pub text: String,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nzb_id_round_trips_through_i64() {
        let id = NzbId::from(42_i64);
        assert_eq!(id.get(), 42);
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn file_id_display_matches_inner_value() {
        let id = FileId(991);
        assert_eq!(id.to_string(), "991");
    }

    #[test]
    fn force_priority_threshold_is_900() {
        // The scheduler compares priorities against this constant to decide
        // whether an NZB overrides a global pause.
        assert_eq!(FORCE_PRIORITY, 900);
    }

    #[test]
    fn event_serializes_with_snake_case_tag() {
        let event = Event::NzbAdded {
            id: NzbId(7),
            name: "test.nzb".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "nzb_added");
        assert_eq!(json["id"], 7);
    }

    #[test]
    fn default_statuses_are_none() {
        assert_eq!(RenameStatus::default(), RenameStatus::None);
        assert_eq!(ParStatus::default(), ParStatus::None);
        assert_eq!(UnpackStatus::default(), UnpackStatus::None);
        assert_eq!(MoveStatus::default(), MoveStatus::None);
        assert_eq!(DeleteStatus::default(), DeleteStatus::None);
        assert_eq!(MarkStatus::default(), MarkStatus::None);
        assert_eq!(UrlStatus::default(), UrlStatus::None);
    }
}
