//! History: terminal NZBs and slim duplicate records

use serde::{Deserialize, Serialize};

use crate::types::DupeMode;

use super::nzb_info::NzbInfo;

/// Slim record kept after an NZB is purged from history, preserving the
/// identity needed for duplicate detection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DupInfo {
    /// Display name of the purged NZB
    pub name: String,
    /// Duplicate key
    pub dupe_key: String,
    /// Duplicate score
    pub dupe_score: i32,
    /// Duplicate mode
    pub dupe_mode: DupeMode,
    /// Total size in bytes
    pub size: u64,
    /// MD5 over the manifest content
    pub content_hash: String,
    /// Final text status at purge time
    pub status: String,
}

impl DupInfo {
    /// Condense a full NZB into its duplicate identity
    pub fn from_nzb(nzb: &NzbInfo) -> Self {
        Self {
            name: nzb.name.clone(),
            dupe_key: nzb.dupe_key.clone(),
            dupe_score: nzb.dupe_score,
            dupe_mode: nzb.dupe_mode,
            size: nzb.size,
            content_hash: nzb.content_hash.clone(),
            status: nzb.text_status(),
        }
    }
}

/// What a history slot holds
#[derive(Debug)]
pub enum HistoryItem {
    /// A full terminal NZB (may be re-queued or post-processed)
    Nzb(Box<NzbInfo>),
    /// A condensed duplicate record
    Dup(DupInfo),
}

/// One entry of the history list
#[derive(Debug)]
pub struct HistoryEntry {
    /// Unix timestamp (seconds) of when the entry was added
    pub time: i64,
    /// The stored item
    pub item: HistoryItem,
}

impl HistoryEntry {
    /// Wrap a terminal NZB
    pub fn nzb(nzb: NzbInfo) -> Self {
        Self {
            time: chrono::Utc::now().timestamp(),
            item: HistoryItem::Nzb(Box::new(nzb)),
        }
    }

    /// Display name of the stored item
    pub fn name(&self) -> &str {
        match &self.item {
            HistoryItem::Nzb(nzb) => &nzb.name,
            HistoryItem::Dup(dup) => &dup.name,
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NzbId, NzbKind};
    use std::path::PathBuf;

    #[test]
    fn dup_info_preserves_dedup_identity() {
        let mut nzb = NzbInfo::new(
            NzbId(9),
            NzbKind::Nzb,
            "show.nzb".into(),
            PathBuf::from("/d"),
        );
        nzb.dupe_key = "show.s01e02".into();
        nzb.dupe_score = 50;
        nzb.content_hash = "abc123".into();
        nzb.size = 12345;

        let dup = DupInfo::from_nzb(&nzb);
        assert_eq!(dup.name, "show");
        assert_eq!(dup.dupe_key, "show.s01e02");
        assert_eq!(dup.dupe_score, 50);
        assert_eq!(dup.content_hash, "abc123");
        assert_eq!(dup.size, 12345);
        assert_eq!(dup.status, "SUCCESS/HEALTH");
    }

    #[test]
    fn history_entry_exposes_item_name() {
        let nzb = NzbInfo::new(NzbId(1), NzbKind::Nzb, "a.nzb".into(), PathBuf::from("/d"));
        let entry = HistoryEntry::nzb(nzb);
        assert_eq!(entry.name(), "a");
        assert!(entry.time > 0);
    }
}
