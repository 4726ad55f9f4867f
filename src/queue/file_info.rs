//! Files and articles: the leaves of the queue tree

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::stats::ServerStatList;
use crate::types::{FileId, NzbId};

/// Lifecycle of one article
///
/// Transitions are monotonic `Undefined -> Running -> {Finished, Failed}`
/// with a single non-monotonic edge: a retry resets `Running -> Undefined`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleState {
    /// Not yet attempted (or reset for retry)
    #[default]
    Undefined,
    /// A downloader task owns this article right now
    Running,
    /// Downloaded and decoded successfully
    Finished,
    /// All servers and retries exhausted
    Failed,
}

/// One NNTP article (a segment of a file)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArticleInfo {
    /// 1-based part number; insertion order matches part number
    pub part_number: u32,
    /// Message id, including angle brackets
    pub message_id: String,
    /// Declared (encoded) size from the NZB manifest
    pub size: u64,
    /// Current state
    pub state: ArticleState,
    /// Byte offset of this segment within the assembled file (set after decode)
    pub segment_offset: u64,
    /// Decoded segment length (set after decode)
    pub segment_size: u64,
    /// CRC32 of the decoded segment (set after decode)
    pub crc: u32,
    /// Path of the on-disk temp fragment; None in direct-write mode
    pub result_path: Option<PathBuf>,
}

impl ArticleInfo {
    /// Create a fresh article in `Undefined` state
    pub fn new(part_number: u32, message_id: String, size: u64) -> Self {
        Self {
            part_number,
            message_id,
            size,
            state: ArticleState::Undefined,
            segment_offset: 0,
            segment_size: 0,
            crc: 0,
            result_path: None,
        }
    }

    /// Whether the article reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ArticleState::Finished | ArticleState::Failed)
    }
}

/// Terminal quality of an assembled file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletedFileStatus {
    /// Every article finished
    Success,
    /// Some articles failed; the file has holes
    Partial,
    /// Nothing usable was downloaded
    Failure,
}

/// Post-download record of one assembled file
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletedFile {
    /// Final filename within the destination directory
    pub filename: String,
    /// Terminal quality
    pub status: CompletedFileStatus,
    /// CRC32 of the whole file, combined from per-part CRCs
    pub crc: u32,
}

/// One source file within an NZB
#[derive(Debug)]
pub struct FileInfo {
    /// Queue-wide unique id
    pub id: FileId,
    /// Owning NZB
    pub nzb_id: NzbId,
    /// Subject line from the manifest
    pub subject: String,
    /// Filename, initially parsed from the subject
    pub filename: String,
    /// Flips true (at most once) when an article body reveals the canonical name
    pub filename_confirmed: bool,
    /// Sum of declared article sizes
    pub size: u64,
    /// Bytes in non-terminal articles
    pub remaining_size: u64,
    /// Bytes in finished articles
    pub success_size: u64,
    /// Bytes in failed articles
    pub failed_size: u64,
    /// Bytes written off without an attempt (file deleted early)
    pub missed_size: u64,
    /// Total article count
    pub total_articles: u32,
    /// Finished article count
    pub success_articles: u32,
    /// Failed article count
    pub failed_articles: u32,
    /// Whether this is a Parchive volume
    pub par_file: bool,
    /// Paused by the user
    pub paused: bool,
    /// Deleted (kept in memory until active downloads drain)
    pub deleted: bool,
    /// Ignore a global pause for this file
    pub extra_priority: bool,
    /// Posting time (unix seconds) of the oldest article
    pub time: i64,
    /// Number of in-flight downloader tasks naming this file
    pub active_downloads: u32,
    /// Assigned output path (direct-write mode)
    pub output_filename: Option<PathBuf>,
    /// Newsgroups carrying this file
    pub groups: Vec<String>,
    /// The article partition, ordered by part number
    pub articles: Vec<ArticleInfo>,
    /// False when the article list was shed from memory and must be
    /// lazy-loaded from the queue directory before scheduling
    pub articles_loaded: bool,
    /// Per-server attempt outcomes
    pub server_stats: ServerStatList,
    /// Serialises first-time output-file creation in direct-write mode
    pub output_lock: Arc<Mutex<()>>,
}

impl FileInfo {
    /// Create a file from parsed manifest data. Sizes and counters are
    /// derived from `articles`.
    pub fn new(
        id: FileId,
        nzb_id: NzbId,
        subject: String,
        filename: String,
        groups: Vec<String>,
        time: i64,
        articles: Vec<ArticleInfo>,
    ) -> Self {
        let size: u64 = articles.iter().map(|a| a.size).sum();
        let total_articles = articles.len() as u32;
        let par_file = is_par_filename(&filename);
        Self {
            id,
            nzb_id,
            subject,
            filename,
            filename_confirmed: false,
            size,
            remaining_size: size,
            success_size: 0,
            failed_size: 0,
            missed_size: 0,
            total_articles,
            success_articles: 0,
            failed_articles: 0,
            par_file,
            paused: false,
            deleted: false,
            extra_priority: false,
            time,
            active_downloads: 0,
            output_filename: None,
            groups,
            articles,
            articles_loaded: true,
            server_stats: ServerStatList::new(),
            output_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Look up an article by part number
    pub fn article(&self, part_number: u32) -> Option<&ArticleInfo> {
        self.articles.iter().find(|a| a.part_number == part_number)
    }

    /// Mutable article lookup by part number
    pub fn article_mut(&mut self, part_number: u32) -> Option<&mut ArticleInfo> {
        self.articles
            .iter_mut()
            .find(|a| a.part_number == part_number)
    }

    /// First article still in `Undefined` state, if any
    pub fn next_undefined_article(&self) -> Option<&ArticleInfo> {
        self.articles
            .iter()
            .find(|a| a.state == ArticleState::Undefined)
    }

    /// Whether every article reached a terminal state
    pub fn all_articles_terminal(&self) -> bool {
        self.articles.iter().all(ArticleInfo::is_terminal)
    }

    /// Confirm the filename from decoded article metadata.
    ///
    /// Only the first confirmation wins; later articles of the same file may
    /// not rename it again.
    pub fn confirm_filename(&mut self, name: &str) {
        if !self.filename_confirmed && !name.is_empty() {
            if name != self.filename {
                tracing::debug!(
                    file_id = %self.id,
                    old = %self.filename,
                    new = %name,
                    "filename confirmed from article body"
                );
                self.filename = name.to_string();
            }
            self.filename_confirmed = true;
        }
    }

    /// Transition an article's state, maintaining the size/count aggregates.
    ///
    /// Panics in debug builds on an illegal transition; in release the
    /// transition is refused and logged.
    pub fn set_article_state(&mut self, part_number: u32, new_state: ArticleState) {
        let Some(idx) = self
            .articles
            .iter()
            .position(|a| a.part_number == part_number)
        else {
            tracing::warn!(file_id = %self.id, part_number, "state change for unknown article");
            return;
        };
        let old_state = self.articles[idx].state;
        let size = self.articles[idx].size;

        let legal = matches!(
            (old_state, new_state),
            (ArticleState::Undefined, ArticleState::Running)
                | (ArticleState::Running, ArticleState::Finished)
                | (ArticleState::Running, ArticleState::Failed)
                | (ArticleState::Running, ArticleState::Undefined)
        );
        debug_assert!(legal, "illegal article transition {old_state:?} -> {new_state:?}");
        if !legal {
            tracing::warn!(
                file_id = %self.id,
                part_number,
                ?old_state,
                ?new_state,
                "refusing illegal article state transition"
            );
            return;
        }

        self.articles[idx].state = new_state;
        match new_state {
            ArticleState::Finished => {
                self.success_articles += 1;
                self.success_size += size;
                self.remaining_size = self.remaining_size.saturating_sub(size);
            }
            ArticleState::Failed => {
                self.failed_articles += 1;
                self.failed_size += size;
                self.remaining_size = self.remaining_size.saturating_sub(size);
            }
            ArticleState::Running | ArticleState::Undefined => {}
        }
    }
}

/// Whether a filename names a Parchive volume
pub fn is_par_filename(filename: &str) -> bool {
    let lower = filename.to_ascii_lowercase();
    lower.ends_with(".par2") || lower.contains(".par2.")
}
