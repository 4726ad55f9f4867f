//! The canonical in-memory download queue
//!
//! Ownership is a strict tree: the [`DownloadQueue`] owns an ordered list of
//! [`NzbInfo`], each NZB exclusively owns its [`FileInfo`] list, each file
//! exclusively owns its [`ArticleInfo`] partition. Downloader tasks never
//! hold references across lock boundaries; they carry
//! `(NzbId, FileId, part_number)` triples and re-resolve under the queue
//! lock.

pub(crate) mod editor;
mod file_info;
mod history;
mod nzb_info;

pub use editor::EditAction;
pub use file_info::{
    ArticleInfo, ArticleState, CompletedFile, CompletedFileStatus, FileInfo, is_par_filename,
};
pub use history::{DupInfo, HistoryEntry, HistoryItem};
pub use nzb_info::NzbInfo;

use crate::types::{FileId, NzbId};

/// Ordered queue of NZBs plus the parallel history list
#[derive(Debug, Default)]
pub struct DownloadQueue {
    /// Active downloads, in scheduling order
    pub queue: Vec<NzbInfo>,
    /// Terminal NZBs and duplicate records, newest first
    pub history: Vec<HistoryEntry>,
    next_nzb_id: i64,
    next_file_id: i64,
}

impl DownloadQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            queue: Vec::new(),
            history: Vec::new(),
            next_nzb_id: 1,
            next_file_id: 1,
        }
    }

    /// Allocate the next NZB id
    pub fn next_nzb_id(&mut self) -> NzbId {
        let id = NzbId(self.next_nzb_id);
        self.next_nzb_id += 1;
        id
    }

    /// Allocate the next file id
    pub fn next_file_id(&mut self) -> FileId {
        let id = FileId(self.next_file_id);
        self.next_file_id += 1;
        id
    }

    /// Bump the id counters so they stay above every id seen in loaded state
    pub fn reserve_ids(&mut self, nzb_id: i64, file_id: i64) {
        self.next_nzb_id = self.next_nzb_id.max(nzb_id + 1);
        self.next_file_id = self.next_file_id.max(file_id + 1);
    }

    /// Append (or prepend) an NZB to the queue
    pub fn add(&mut self, nzb: NzbInfo, add_first: bool) {
        if add_first {
            self.queue.insert(0, nzb);
        } else {
            self.queue.push(nzb);
        }
    }

    /// Find an NZB by id
    pub fn find(&self, id: NzbId) -> Option<&NzbInfo> {
        self.queue.iter().find(|n| n.id == id)
    }

    /// Find an NZB by id, mutably
    pub fn find_mut(&mut self, id: NzbId) -> Option<&mut NzbInfo> {
        self.queue.iter_mut().find(|n| n.id == id)
    }

    /// Find the NZB owning a file id
    pub fn find_by_file(&self, file_id: FileId) -> Option<&NzbInfo> {
        self.queue.iter().find(|n| n.file(file_id).is_some())
    }

    /// Remove an NZB from the queue, returning it
    pub fn remove(&mut self, id: NzbId) -> Option<NzbInfo> {
        let idx = self.queue.iter().position(|n| n.id == id)?;
        Some(self.queue.remove(idx))
    }

    /// Move a terminal NZB into history
    pub fn move_to_history(&mut self, id: NzbId) -> bool {
        let Some(nzb) = self.remove(id) else {
            return false;
        };
        self.history.insert(0, HistoryEntry::nzb(nzb));
        true
    }

    /// Sum of active downloads across the queue; used to cross-check the
    /// per-NZB counters.
    pub fn total_active_downloads(&self) -> u32 {
        self.queue.iter().map(|n| n.active_downloads).sum()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NzbKind;
    use std::path::PathBuf;

    fn nzb(queue: &mut DownloadQueue, name: &str) -> NzbId {
        let id = queue.next_nzb_id();
        let info = NzbInfo::new(id, NzbKind::Nzb, name.into(), PathBuf::from("/d"));
        queue.add(info, false);
        id
    }

    #[test]
    fn ids_are_monotonically_increasing() {
        let mut queue = DownloadQueue::new();
        let a = queue.next_nzb_id();
        let b = queue.next_nzb_id();
        assert!(b > a);
        let f1 = queue.next_file_id();
        let f2 = queue.next_file_id();
        assert!(f2 > f1);
    }

    #[test]
    fn reserve_ids_skips_past_loaded_state() {
        let mut queue = DownloadQueue::new();
        queue.reserve_ids(100, 500);
        assert_eq!(queue.next_nzb_id().get(), 101);
        assert_eq!(queue.next_file_id().get(), 501);
    }

    #[test]
    fn add_first_prepends() {
        let mut queue = DownloadQueue::new();
        let a = nzb(&mut queue, "a.nzb");
        let b = queue.next_nzb_id();
        let info = NzbInfo::new(b, NzbKind::Nzb, "b.nzb".into(), PathBuf::from("/d"));
        queue.add(info, true);

        assert_eq!(queue.queue[0].id, b);
        assert_eq!(queue.queue[1].id, a);
    }

    #[test]
    fn move_to_history_removes_from_queue() {
        let mut queue = DownloadQueue::new();
        let id = nzb(&mut queue, "a.nzb");
        assert!(queue.move_to_history(id));
        assert!(queue.find(id).is_none());
        assert_eq!(queue.history.len(), 1);
        assert_eq!(queue.history[0].name(), "a");
    }

    #[test]
    fn move_to_history_of_unknown_id_is_a_noop() {
        let mut queue = DownloadQueue::new();
        assert!(!queue.move_to_history(NzbId(42)));
        assert!(queue.history.is_empty());
    }
}
