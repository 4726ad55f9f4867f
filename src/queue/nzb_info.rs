//! One queued batch (NZB) and its derived health/status

use std::path::PathBuf;

use crate::stats::ServerStatList;
use crate::types::{
    DeleteStatus, DupeMode, FileId, MarkStatus, MessageKind, MoveStatus, NzbId, NzbKind,
    NzbMessage, ParStatus, RenameStatus, UnpackStatus, UrlStatus,
};

use super::file_info::{CompletedFile, FileInfo};

/// Maximum number of log lines kept per NZB
const MESSAGE_LOG_CAP: usize = 1000;

/// One submitted batch: the root of the ownership tree
#[derive(Debug)]
pub struct NzbInfo {
    /// Queue-wide unique id
    pub id: NzbId,
    /// How the batch entered the queue
    pub kind: NzbKind,
    /// Original manifest filename
    pub filename: String,
    /// Display name (defaults to the filename without extension)
    pub name: String,
    /// Destination directory for assembled files
    pub dest_dir: PathBuf,
    /// Category label
    pub category: String,
    /// Priority; >= [`crate::types::FORCE_PRIORITY`] overrides a global pause
    pub priority: i32,
    /// Duplicate-detection key
    pub dupe_key: String,
    /// Duplicate score (higher wins)
    pub dupe_score: i32,
    /// Duplicate handling mode
    pub dupe_mode: DupeMode,
    /// MD5 over the full manifest content
    pub content_hash: String,
    /// MD5 over the manifest with volatile parts (dates, comments) stripped
    pub filtered_content_hash: String,
    /// Sum of all file sizes
    pub size: u64,
    /// Bytes still to download over non-paused, non-deleted files
    pub remaining_size: u64,
    /// Bytes in paused files
    pub paused_size: u64,
    /// Bytes downloaded successfully
    pub success_size: u64,
    /// Bytes in failed articles
    pub failed_size: u64,
    /// Par bytes downloaded successfully
    pub par_success_size: u64,
    /// Par bytes failed
    pub par_failed_size: u64,
    /// Total par bytes
    pub par_size: u64,
    /// Total article count
    pub total_articles: u32,
    /// Finished articles
    pub success_articles: u32,
    /// Failed articles
    pub failed_articles: u32,
    /// In-flight downloader tasks across all files
    pub active_downloads: u32,
    /// Oldest article posting time (unix seconds)
    pub min_time: i64,
    /// Newest article posting time (unix seconds)
    pub max_time: i64,
    /// Rename stage outcome
    pub rename_status: RenameStatus,
    /// Parchive stage outcome
    pub par_status: ParStatus,
    /// Unpack stage outcome
    pub unpack_status: UnpackStatus,
    /// Move stage outcome
    pub move_status: MoveStatus,
    /// Delete reason
    pub delete_status: DeleteStatus,
    /// User mark
    pub mark_status: MarkStatus,
    /// URL fetch state
    pub url_status: UrlStatus,
    /// Whether the health guard paused this NZB
    pub health_paused: bool,
    /// Marked for deletion once active downloads drain
    pub deleting: bool,
    /// Size contributed by files that already left the file list; keeps the
    /// totals (and therefore health) stable as files complete
    pub completed_size: u64,
    /// Par bytes contributed by departed files
    pub completed_par_size: u64,
    /// Article count contributed by departed files
    pub completed_total_articles: u32,
    /// Finished articles of departed files
    pub completed_success_articles: u32,
    /// Failed articles of departed files
    pub completed_failed_articles: u32,
    /// Files still downloading (exclusively owned)
    pub files: Vec<FileInfo>,
    /// Files already assembled
    pub completed_files: Vec<CompletedFile>,
    /// Post-processing parameters (name/value, ordered)
    pub parameters: Vec<(String, String)>,
    /// Per-server attempt outcomes aggregated over all files
    pub server_stats: ServerStatList,
    /// Message log
    pub messages: Vec<NzbMessage>,
}

impl NzbInfo {
    /// Create an empty NZB shell; files are attached by the parser
    pub fn new(id: NzbId, kind: NzbKind, filename: String, dest_dir: PathBuf) -> Self {
        let name = filename
            .strip_suffix(".nzb")
            .unwrap_or(&filename)
            .to_string();
        Self {
            id,
            kind,
            filename,
            name,
            dest_dir,
            category: String::new(),
            priority: 0,
            dupe_key: String::new(),
            dupe_score: 0,
            dupe_mode: DupeMode::default(),
            content_hash: String::new(),
            filtered_content_hash: String::new(),
            size: 0,
            remaining_size: 0,
            paused_size: 0,
            success_size: 0,
            failed_size: 0,
            par_success_size: 0,
            par_failed_size: 0,
            par_size: 0,
            total_articles: 0,
            success_articles: 0,
            failed_articles: 0,
            active_downloads: 0,
            min_time: 0,
            max_time: 0,
            rename_status: RenameStatus::default(),
            par_status: ParStatus::default(),
            unpack_status: UnpackStatus::default(),
            move_status: MoveStatus::default(),
            delete_status: DeleteStatus::default(),
            mark_status: MarkStatus::default(),
            url_status: UrlStatus::default(),
            health_paused: false,
            deleting: false,
            completed_size: 0,
            completed_par_size: 0,
            completed_total_articles: 0,
            completed_success_articles: 0,
            completed_failed_articles: 0,
            files: Vec::new(),
            completed_files: Vec::new(),
            parameters: Vec::new(),
            server_stats: ServerStatList::new(),
            messages: Vec::new(),
        }
    }

    /// Whether this NZB overrides a global pause
    pub fn force_priority(&self) -> bool {
        self.priority >= crate::types::FORCE_PRIORITY
    }

    /// Find a file by id
    pub fn file(&self, file_id: FileId) -> Option<&FileInfo> {
        self.files.iter().find(|f| f.id == file_id)
    }

    /// Find a file by id, mutably
    pub fn file_mut(&mut self, file_id: FileId) -> Option<&mut FileInfo> {
        self.files.iter_mut().find(|f| f.id == file_id)
    }

    /// Recompute every aggregate from the owned file list.
    ///
    /// Called after attaching files and after any edit that changes pause or
    /// delete flags; article completions maintain the aggregates
    /// incrementally through [`NzbInfo::apply_article_sizes`].
    pub fn recompute_aggregates(&mut self) {
        self.size = self.completed_size;
        self.remaining_size = 0;
        self.paused_size = 0;
        self.par_size = self.completed_par_size;
        self.total_articles = self.completed_total_articles;
        self.success_articles = self.completed_success_articles;
        self.failed_articles = self.completed_failed_articles;
        self.active_downloads = 0;
        self.min_time = i64::MAX;
        self.max_time = i64::MIN;

        for file in &self.files {
            self.size += file.size;
            self.total_articles += file.total_articles;
            self.success_articles += file.success_articles;
            self.failed_articles += file.failed_articles;
            self.active_downloads += file.active_downloads;
            if file.par_file {
                self.par_size += file.size;
            }
            if file.paused && !file.deleted {
                self.paused_size += file.remaining_size;
            }
            if !file.paused && !file.deleted {
                self.remaining_size += file.remaining_size;
            }
            self.min_time = self.min_time.min(file.time);
            self.max_time = self.max_time.max(file.time);
        }
        if self.files.is_empty() {
            self.min_time = 0;
            self.max_time = 0;
        }
    }

    /// Fold a file's contributions into the departed-file base counters.
    /// Called just before the file is removed from the list, so the totals
    /// survive the removal.
    pub fn fold_departed_file(&mut self, file: &FileInfo) {
        self.completed_size += file.size;
        if file.par_file {
            self.completed_par_size += file.size;
        }
        self.completed_total_articles += file.total_articles;
        self.completed_success_articles += file.success_articles;
        self.completed_failed_articles += file.failed_articles;
    }

    /// Fold one article outcome into the size aggregates
    pub fn apply_article_sizes(&mut self, size: u64, par_file: bool, success: bool) {
        if success {
            self.success_size += size;
            self.success_articles += 1;
            if par_file {
                self.par_success_size += size;
            }
        } else {
            self.failed_size += size;
            self.failed_articles += 1;
            if par_file {
                self.par_failed_size += size;
            }
        }
        self.remaining_size = self.remaining_size.saturating_sub(size);
    }

    /// Health: the fraction of non-par bytes not lost to failures, 0..1000
    pub fn health(&self) -> u32 {
        let non_par = self.size.saturating_sub(self.par_size);
        if non_par == 0 {
            return 1000;
        }
        let non_par_failed = self.failed_size.saturating_sub(self.par_failed_size);
        if non_par_failed >= non_par {
            return 0;
        }
        (1000 - non_par_failed * 1000 / non_par) as u32
    }

    /// Critical health: the bound below which repair is presumed impossible,
    /// roughly `(size - 2*par_size) / (size - par_size)`, scaled to 0..1000
    pub fn critical_health(&self) -> u32 {
        let non_par = self.size.saturating_sub(self.par_size);
        if non_par == 0 {
            return 1000;
        }
        let numerator = self.size.saturating_sub(self.par_size.saturating_mul(2));
        (numerator * 1000 / non_par).min(1000) as u32
    }

    /// Append a line to the message log, trimming the oldest beyond the cap
    pub fn add_message(&mut self, kind: MessageKind, text: impl Into<String>) {
        self.messages.push(NzbMessage {
            kind,
            time: chrono::Utc::now().timestamp(),
            text: text.into(),
        });
        if self.messages.len() > MESSAGE_LOG_CAP {
            let excess = self.messages.len() - MESSAGE_LOG_CAP;
            self.messages.drain(..excess);
        }
    }

    /// Set (or with an empty value, delete) a post-processing parameter
    pub fn set_parameter(&mut self, name: &str, value: &str) {
        if value.is_empty() {
            self.parameters.retain(|(n, _)| n != name);
            return;
        }
        if let Some(entry) = self.parameters.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value.to_string();
        } else {
            self.parameters.push((name.to_string(), value.to_string()));
        }
    }

    /// Canonical user-visible status, composed from the per-stage statuses
    /// by a fixed priority ladder:
    /// bad > delete > par-failure > unpack-failure > health-failure >
    /// partial > success.
    pub fn text_status(&self) -> String {
        if self.mark_status == MarkStatus::Bad {
            return "FAILURE/BAD".into();
        }
        match self.delete_status {
            DeleteStatus::None => {}
            DeleteStatus::Manual => return "DELETED/MANUAL".into(),
            DeleteStatus::Health => return "DELETED/HEALTH".into(),
            DeleteStatus::Dupe => return "DELETED/DUPE".into(),
            DeleteStatus::Bad => return "DELETED/BAD".into(),
        }
        if self.par_status == ParStatus::Failure {
            return "FAILURE/PAR".into();
        }
        match self.unpack_status {
            UnpackStatus::Failure => return "FAILURE/UNPACK".into(),
            UnpackStatus::Space => return "FAILURE/SPACE".into(),
            UnpackStatus::Password => return "FAILURE/PASSWORD".into(),
            _ => {}
        }
        let health = self.health();
        if health < self.critical_health() {
            return "FAILURE/HEALTH".into();
        }
        if health < 1000 {
            // Damaged but above the repair threshold
            if self.par_status == ParStatus::Success {
                return "SUCCESS/PAR".into();
            }
            return "WARNING/HEALTH".into();
        }
        if self.par_status == ParStatus::RepairPossible {
            return "WARNING/REPAIRABLE".into();
        }
        if self.par_status == ParStatus::Success && self.unpack_status == UnpackStatus::Success {
            return "SUCCESS/ALL".into();
        }
        if self.unpack_status == UnpackStatus::Success {
            return "SUCCESS/UNPACK".into();
        }
        if self.par_status == ParStatus::Success {
            return "SUCCESS/PAR".into();
        }
        "SUCCESS/HEALTH".into()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::file_info::ArticleInfo;

    fn nzb() -> NzbInfo {
        NzbInfo::new(
            NzbId(1),
            NzbKind::Nzb,
            "test.nzb".into(),
            PathBuf::from("/downloads"),
        )
    }

    fn file(id: i64, filename: &str, sizes: &[u64]) -> FileInfo {
        let articles = sizes
            .iter()
            .enumerate()
            .map(|(i, size)| ArticleInfo::new(i as u32 + 1, format!("<{id}-{i}@t>"), *size))
            .collect();
        FileInfo::new(
            FileId(id),
            NzbId(1),
            format!("subject {filename}"),
            filename.into(),
            vec![],
            100,
            articles,
        )
    }

    #[test]
    fn display_name_strips_nzb_extension() {
        assert_eq!(nzb().name, "test");
    }

    #[test]
    fn aggregates_sum_over_files() {
        let mut info = nzb();
        info.files.push(file(1, "a.rar", &[100, 100]));
        info.files.push(file(2, "a.par2", &[50]));
        info.recompute_aggregates();

        assert_eq!(info.size, 250);
        assert_eq!(info.remaining_size, 250);
        assert_eq!(info.par_size, 50);
        assert_eq!(info.total_articles, 3);
    }

    #[test]
    fn paused_files_move_bytes_to_paused_size() {
        let mut info = nzb();
        info.files.push(file(1, "a.rar", &[100]));
        let mut paused = file(2, "b.rar", &[60]);
        paused.paused = true;
        info.files.push(paused);
        info.recompute_aggregates();

        assert_eq!(info.remaining_size, 100);
        assert_eq!(info.paused_size, 60);
    }

    #[test]
    fn health_is_1000_without_failures() {
        let mut info = nzb();
        info.files.push(file(1, "a.rar", &[1000]));
        info.recompute_aggregates();
        assert_eq!(info.health(), 1000);
    }

    #[test]
    fn health_reflects_non_par_failures_only() {
        // 1 GB non-par + 100 MB par; 600 MB non-par failed, no par failures.
        // health = 1000 - 600/1000*1000 = 400
        // critical = (1100 - 200) / 1000 = 900
        let mut info = nzb();
        info.size = 1_100_000_000;
        info.par_size = 100_000_000;
        info.failed_size = 600_000_000;
        info.par_failed_size = 0;

        assert_eq!(info.health(), 400);
        assert_eq!(info.critical_health(), 900);
        assert!(info.health() < info.critical_health());
    }

    #[test]
    fn par_failures_do_not_hurt_health() {
        let mut info = nzb();
        info.size = 1000;
        info.par_size = 200;
        info.failed_size = 150;
        info.par_failed_size = 150;
        assert_eq!(info.health(), 1000, "pure par failures leave health intact");
    }

    #[test]
    fn critical_health_with_no_pars_is_1000() {
        let mut info = nzb();
        info.size = 1000;
        info.par_size = 0;
        assert_eq!(
            info.critical_health(),
            1000,
            "without par data any failure is critical"
        );
    }

    #[test]
    fn zero_size_nzb_is_healthy() {
        let info = nzb();
        assert_eq!(info.health(), 1000);
        assert_eq!(info.critical_health(), 1000);
    }

    #[test]
    fn status_ladder_orders_failures() {
        let mut info = nzb();
        info.size = 1000;
        info.failed_size = 900; // health 100 < critical 1000

        assert_eq!(info.text_status(), "FAILURE/HEALTH");

        info.unpack_status = UnpackStatus::Failure;
        assert_eq!(info.text_status(), "FAILURE/UNPACK");

        info.par_status = ParStatus::Failure;
        assert_eq!(info.text_status(), "FAILURE/PAR");

        info.delete_status = DeleteStatus::Health;
        assert_eq!(info.text_status(), "DELETED/HEALTH");

        info.mark_status = MarkStatus::Bad;
        assert_eq!(info.text_status(), "FAILURE/BAD");
    }

    #[test]
    fn damaged_above_critical_is_warning_not_failure() {
        // 10% failed non-par data with enough par to repair
        let mut info = nzb();
        info.size = 1100;
        info.par_size = 300;
        info.failed_size = 80;
        info.par_failed_size = 0;

        assert!(info.health() >= info.critical_health());
        assert_eq!(info.text_status(), "WARNING/HEALTH");
    }

    #[test]
    fn clean_download_with_all_stages_is_success_all() {
        let mut info = nzb();
        info.size = 1000;
        info.par_status = ParStatus::Success;
        info.unpack_status = UnpackStatus::Success;
        assert_eq!(info.text_status(), "SUCCESS/ALL");
    }

    #[test]
    fn parameters_set_update_and_delete() {
        let mut info = nzb();
        info.set_parameter("*Unpack:", "yes");
        info.set_parameter("Category", "tv");
        info.set_parameter("*Unpack:", "no");
        assert_eq!(
            info.parameters,
            vec![
                ("*Unpack:".to_string(), "no".to_string()),
                ("Category".to_string(), "tv".to_string()),
            ]
        );
        info.set_parameter("Category", "");
        assert_eq!(info.parameters.len(), 1);
    }

    #[test]
    fn message_log_is_capped() {
        let mut info = nzb();
        for i in 0..(MESSAGE_LOG_CAP + 10) {
            info.add_message(MessageKind::Info, format!("msg {i}"));
        }
        assert_eq!(info.messages.len(), MESSAGE_LOG_CAP);
        assert!(
            info.messages[0].text.ends_with("10"),
            "oldest messages must be trimmed first"
        );
    }
}
