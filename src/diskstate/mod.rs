//! Crash-safe persistent state
//!
//! Every state file is written to a temp sibling and atomically renamed into
//! place, so a crash mid-save leaves the previous generation intact. Loaders
//! skip unknown section headers and record prefixes, keeping old binaries
//! forward-compatible with newer state.

mod file_state;
mod queue_file;
mod stats_file;

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::queue::{DownloadQueue, FileInfo};
use crate::stats::{ServerStatList, VolumeStats};

/// Facade over the queue directory
pub struct DiskState {
    queue_dir: PathBuf,
    temp_dir: PathBuf,
}

impl DiskState {
    /// Create the facade, ensuring both directories exist
    pub fn new(queue_dir: PathBuf, temp_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&queue_dir)?;
        fs::create_dir_all(&temp_dir)?;
        Ok(Self {
            queue_dir,
            temp_dir,
        })
    }

    /// The queue directory
    pub fn queue_dir(&self) -> &Path {
        &self.queue_dir
    }

    /// The temp directory for article fragments
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Whether a saved queue exists
    pub fn download_queue_exists(&self) -> bool {
        self.queue_dir.join(queue_file::QUEUE_FILE_NAME).exists()
    }

    /// Persist the queue (and the article lists of every loaded file)
    pub fn save_download_queue(&self, queue: &DownloadQueue, servers: &[ServerConfig]) -> Result<()> {
        queue_file::save(&self.queue_dir, queue, servers)?;
        for nzb in &queue.queue {
            for file in &nzb.files {
                if file.articles_loaded {
                    file_state::save_file_articles(&self.queue_dir, file)?;
                }
            }
        }
        Ok(())
    }

    /// Load the queue saved by a previous session.
    ///
    /// `servers` is the current configuration; when the saved server set does
    /// not match, per-server statistics are remapped by host:port (dropped
    /// when the server is gone) and the queue is re-saved with the new ids.
    pub fn load_download_queue(&self, servers: &[ServerConfig]) -> Result<DownloadQueue> {
        let (queue, needs_resave) = queue_file::load(&self.queue_dir, servers)?;
        if needs_resave {
            tracing::info!("server configuration changed, re-writing queue state");
            self.save_download_queue(&queue, servers)?;
        }
        Ok(queue)
    }

    /// Load a file's article partition from its per-file state record.
    /// `continue_partial=false` resets every non-terminal article.
    pub fn load_file_articles(&self, file: &mut FileInfo, continue_partial: bool) -> Result<()> {
        file_state::load_file_articles(&self.queue_dir, file, continue_partial)
    }

    /// Persist one file's article partition (partial progress)
    pub fn save_file_state(&self, file: &FileInfo) -> Result<()> {
        file_state::save_file_articles(&self.queue_dir, file)
    }

    /// Erase temp fragments and/or state records for one file
    pub fn discard_file(&self, file: &FileInfo, data: bool, partial: bool) {
        if data {
            for article in &file.articles {
                if let Some(path) = &article.result_path {
                    let _ = fs::remove_file(path);
                }
                let _ = fs::remove_file(crate::writer::fragment_path(
                    &self.temp_dir,
                    file.id,
                    article.part_number,
                ));
            }
        }
        if partial {
            let _ = fs::remove_file(file_state::articles_path(&self.queue_dir, file.id));
        }
    }

    /// Remove temp fragments not referenced by any queued article.
    /// Runs at startup, before downloads begin.
    pub fn cleanup_temp_dir(&self, queue: &DownloadQueue) {
        let mut referenced = std::collections::HashSet::new();
        for nzb in &queue.queue {
            for file in &nzb.files {
                referenced.insert(file.id.get());
            }
        }

        let Ok(entries) = fs::read_dir(&self.temp_dir) else {
            return;
        };
        let mut removed = 0u32;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // Fragment names look like "<file-id>.<part>.tmp"
            let Some(stem) = name.strip_suffix(".tmp") else {
                continue;
            };
            let Some((file_id, part)) = stem.split_once('.') else {
                continue;
            };
            let (Ok(file_id), Ok(_part)) = (file_id.parse::<i64>(), part.parse::<u32>()) else {
                continue;
            };
            if !referenced.contains(&file_id) {
                let _ = fs::remove_file(entry.path());
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "cleaned orphaned temp fragments");
        }
    }

    /// Persist per-server statistics and volumes
    pub fn save_stats(&self, stats: &ServerStatList, volumes: &VolumeStats) -> Result<()> {
        stats_file::save(&self.queue_dir, stats, volumes)
    }

    /// Load per-server statistics and volumes (empty when none saved)
    pub fn load_stats(&self) -> Result<(ServerStatList, VolumeStats)> {
        stats_file::load(&self.queue_dir)
    }
}

/// Write `content` to `path` atomically: temp sibling + rename
pub(crate) fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("new");
    fs::write(&tmp, content)
        .map_err(|e| Error::state(&tmp, format!("write failed: {e}")))?;
    fs::rename(&tmp, path).map_err(|e| Error::state(path, format!("rename failed: {e}")))?;
    Ok(())
}

/// Escape tabs, newlines and backslashes so free-text fields survive the
/// line-oriented format
pub(crate) fn escape_field(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape_field`]
pub(crate) fn unescape_field(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trips_awkward_strings() {
        let cases = [
            "plain",
            "with\ttab",
            "with\nnewline",
            "back\\slash",
            "\\t literal",
            "",
            "trailing\\",
        ];
        for case in cases {
            assert_eq!(
                unescape_field(&escape_field(case)),
                case,
                "round-trip failed for {case:?}"
            );
        }
        // Escaped fields must never contain raw separators
        assert!(!escape_field("a\tb\nc").contains(['\t', '\n']));
    }

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        atomic_write(&path, "generation 1").unwrap();
        atomic_write(&path, "generation 2").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "generation 2");
        assert!(!path.with_extension("new").exists());
    }

    #[test]
    fn cleanup_temp_dir_removes_only_orphans() {
        let queue_dir = tempfile::tempdir().unwrap();
        let temp_dir = tempfile::tempdir().unwrap();
        let disk = DiskState::new(
            queue_dir.path().to_path_buf(),
            temp_dir.path().to_path_buf(),
        )
        .unwrap();

        // Queue references file id 5 only
        let mut queue = DownloadQueue::new();
        let id = queue.next_nzb_id();
        let mut nzb = crate::queue::NzbInfo::new(
            id,
            crate::types::NzbKind::Nzb,
            "a.nzb".into(),
            "/d".into(),
        );
        nzb.files.push(FileInfo::new(
            crate::types::FileId(5),
            id,
            "s".into(),
            "f.bin".into(),
            vec![],
            0,
            vec![crate::queue::ArticleInfo::new(1, "<a@b>".into(), 10)],
        ));
        queue.add(nzb, false);

        fs::write(temp_dir.path().join("5.1.tmp"), b"keep").unwrap();
        fs::write(temp_dir.path().join("99.1.tmp"), b"orphan").unwrap();
        fs::write(temp_dir.path().join("unrelated.log"), b"keep too").unwrap();

        disk.cleanup_temp_dir(&queue);

        assert!(temp_dir.path().join("5.1.tmp").exists());
        assert!(!temp_dir.path().join("99.1.tmp").exists());
        assert!(temp_dir.path().join("unrelated.log").exists());
    }
}
