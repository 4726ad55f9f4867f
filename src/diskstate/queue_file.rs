//! Versioned text format for the download queue
//!
//! Layout: a signature line, an integer format version, then bracketed
//! sections (`[servers]`, `[queue]`, `[history]`). Each entity is one record
//! per line with a single-letter type tag and tab-separated fields; free-text
//! fields are escaped. Loaders skip unknown sections and record tags, so the
//! format can grow without breaking older binaries.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::queue::{
    CompletedFile, DownloadQueue, DupInfo, FileInfo, HistoryEntry, HistoryItem, NzbInfo,
};
use crate::stats::ServerStatList;
use crate::types::{FileId, NzbId};

use super::{atomic_write, escape_field, unescape_field};

pub(super) const QUEUE_FILE_NAME: &str = "queue.state";
const SIGNATURE: &str = "nzb-engine queue state";
const FORMAT_VERSION: u32 = 1;

fn enum_to_str<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "\"\"".into())
        .trim_matches('"')
        .to_string()
}

fn enum_from_str<T: DeserializeOwned>(s: &str) -> Option<T> {
    serde_json::from_str(&format!("\"{s}\"")).ok()
}

/// Save the queue file (article lists are saved separately per file)
pub(super) fn save(queue_dir: &Path, queue: &DownloadQueue, servers: &[ServerConfig]) -> Result<()> {
    let mut out = String::new();
    out.push_str(SIGNATURE);
    out.push('\n');
    out.push_str(&format!("version {FORMAT_VERSION}\n"));

    out.push_str("[servers]\n");
    for server in servers {
        out.push_str(&format!(
            "R\t{}\t{}\t{}\n",
            server.id,
            escape_field(&server.host),
            server.port
        ));
    }

    out.push_str("[queue]\n");
    for nzb in &queue.queue {
        write_nzb(&mut out, nzb);
    }

    out.push_str("[history]\n");
    for entry in &queue.history {
        match &entry.item {
            HistoryItem::Nzb(nzb) => {
                out.push_str(&format!("T\t{}\n", entry.time));
                write_nzb(&mut out, nzb);
            }
            HistoryItem::Dup(dup) => {
                out.push_str(&format!(
                    "D\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
                    entry.time,
                    escape_field(&dup.name),
                    escape_field(&dup.dupe_key),
                    dup.dupe_score,
                    enum_to_str(&dup.dupe_mode),
                    dup.size,
                    dup.content_hash,
                    escape_field(&dup.status),
                ));
            }
        }
    }

    atomic_write(&queue_dir.join(QUEUE_FILE_NAME), &out)
}

fn write_nzb(out: &mut String, nzb: &NzbInfo) {
    out.push_str(&format!(
        "N\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
        nzb.id.get(),
        enum_to_str(&nzb.kind),
        escape_field(&nzb.filename),
        escape_field(&nzb.name),
        escape_field(&nzb.dest_dir.to_string_lossy()),
        escape_field(&nzb.category),
        nzb.priority,
        escape_field(&nzb.dupe_key),
        nzb.dupe_score,
        enum_to_str(&nzb.dupe_mode),
        nzb.content_hash,
        nzb.filtered_content_hash,
        enum_to_str(&nzb.rename_status),
        enum_to_str(&nzb.par_status),
        enum_to_str(&nzb.unpack_status),
        enum_to_str(&nzb.move_status),
        enum_to_str(&nzb.delete_status),
        enum_to_str(&nzb.mark_status),
        enum_to_str(&nzb.url_status),
        nzb.health_paused as u8,
        nzb.success_size,
        nzb.failed_size,
        nzb.par_success_size,
        nzb.par_failed_size,
        nzb.completed_size,
        nzb.completed_par_size,
        nzb.completed_total_articles,
        nzb.completed_success_articles,
        nzb.completed_failed_articles,
    ));
    for (name, value) in &nzb.parameters {
        out.push_str(&format!(
            "P\t{}\t{}\n",
            escape_field(name),
            escape_field(value)
        ));
    }
    // Sorted for a canonical serialisation
    let mut stats: Vec<_> = nzb.server_stats.0.iter().collect();
    stats.sort_by_key(|(id, _)| **id);
    for (server_id, stat) in stats {
        out.push_str(&format!(
            "S\t{server_id}\t{}\t{}\n",
            stat.success, stat.failed
        ));
    }
    for completed in &nzb.completed_files {
        out.push_str(&format!(
            "C\t{}\t{}\t{:08x}\n",
            escape_field(&completed.filename),
            enum_to_str(&completed.status),
            completed.crc,
        ));
    }
    for file in &nzb.files {
        out.push_str(&format!(
            "F\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
            file.id.get(),
            escape_field(&file.subject),
            escape_field(&file.filename),
            file.filename_confirmed as u8,
            file.par_file as u8,
            file.paused as u8,
            file.deleted as u8,
            file.extra_priority as u8,
            file.time,
            file.size,
            file.remaining_size,
            file.success_size,
            file.failed_size,
            file.missed_size,
            file.total_articles,
            file.success_articles,
            file.failed_articles,
            escape_field(&file.groups.join(",")),
        ));
    }
}

/// Load the queue file. Returns the queue plus whether the server set
/// changed and the state should be re-saved.
pub(super) fn load(
    queue_dir: &Path,
    servers: &[ServerConfig],
) -> Result<(DownloadQueue, bool)> {
    let path = queue_dir.join(QUEUE_FILE_NAME);
    if !path.exists() {
        return Ok((DownloadQueue::new(), false));
    }
    let content =
        fs::read_to_string(&path).map_err(|e| Error::state(&path, format!("read failed: {e}")))?;
    let mut lines = content.lines();

    if lines.next() != Some(SIGNATURE) {
        return Err(Error::state(&path, "bad signature"));
    }
    let version: u32 = lines
        .next()
        .and_then(|l| l.strip_prefix("version "))
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::state(&path, "missing format version"))?;
    if version > FORMAT_VERSION {
        return Err(Error::state(
            &path,
            format!("unsupported format version {version}"),
        ));
    }

    // Saved server ids by host:port, for remapping per-server stats
    let mut saved_servers: HashMap<u32, (String, u16)> = HashMap::new();

    #[derive(PartialEq)]
    enum Section {
        None,
        Servers,
        Queue,
        History,
        Unknown,
    }

    let mut queue = DownloadQueue::new();
    let mut section = Section::None;
    let mut current: Option<NzbInfo> = None;
    let mut history_time: Option<i64> = None;
    let mut max_nzb_id = 0i64;
    let mut max_file_id = 0i64;

    // Flushes the NZB under construction into its destination list
    fn flush(
        queue: &mut DownloadQueue,
        current: &mut Option<NzbInfo>,
        section_is_history: bool,
        history_time: &mut Option<i64>,
    ) {
        if let Some(mut nzb) = current.take() {
            nzb.recompute_aggregates_from_loaded();
            if section_is_history {
                queue.history.push(HistoryEntry {
                    time: history_time.take().unwrap_or(0),
                    item: HistoryItem::Nzb(Box::new(nzb)),
                });
            } else {
                queue.add(nzb, false);
            }
        }
    }

    for line in lines {
        if line.starts_with('[') {
            flush(
                &mut queue,
                &mut current,
                section == Section::History,
                &mut history_time,
            );
            section = match line {
                "[servers]" => Section::Servers,
                "[queue]" => Section::Queue,
                "[history]" => Section::History,
                _ => Section::Unknown,
            };
            continue;
        }
        if section == Section::Unknown || line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();
        match (fields[0], &section) {
            ("R", Section::Servers) => {
                if fields.len() >= 4
                    && let (Ok(id), Ok(port)) = (fields[1].parse(), fields[3].parse())
                {
                    saved_servers.insert(id, (fields[2].to_string(), port));
                }
            }
            ("N", Section::Queue | Section::History) => {
                flush(
                    &mut queue,
                    &mut current,
                    section == Section::History,
                    &mut history_time,
                );
                match parse_nzb_record(&fields, &path) {
                    Ok(nzb) => {
                        max_nzb_id = max_nzb_id.max(nzb.id.get());
                        current = Some(nzb);
                    }
                    Err(e) => tracing::warn!(error = %e, "skipping damaged NZB record"),
                }
            }
            ("T", Section::History) => {
                flush(&mut queue, &mut current, true, &mut history_time);
                history_time = fields.get(1).and_then(|t| t.parse().ok());
            }
            ("D", Section::History) => {
                flush(&mut queue, &mut current, true, &mut history_time);
                if fields.len() >= 9 {
                    queue.history.push(HistoryEntry {
                        time: fields[1].parse().unwrap_or(0),
                        item: HistoryItem::Dup(DupInfo {
                            name: unescape_field(fields[2]),
                            dupe_key: unescape_field(fields[3]),
                            dupe_score: fields[4].parse().unwrap_or(0),
                            dupe_mode: enum_from_str(fields[5]).unwrap_or_default(),
                            size: fields[6].parse().unwrap_or(0),
                            content_hash: fields[7].to_string(),
                            status: unescape_field(fields[8]),
                        }),
                    });
                }
            }
            ("P", _) => {
                if let Some(nzb) = current.as_mut()
                    && fields.len() >= 3
                {
                    nzb.parameters
                        .push((unescape_field(fields[1]), unescape_field(fields[2])));
                }
            }
            ("S", _) => {
                if let Some(nzb) = current.as_mut()
                    && fields.len() >= 4
                    && let (Ok(id), Ok(success), Ok(failed)) =
                        (fields[1].parse(), fields[2].parse(), fields[3].parse())
                {
                    nzb.server_stats.add(id, success, failed);
                }
            }
            ("C", _) => {
                if let Some(nzb) = current.as_mut()
                    && fields.len() >= 4
                    && let Some(status) = enum_from_str(fields[2])
                {
                    nzb.completed_files.push(CompletedFile {
                        filename: unescape_field(fields[1]),
                        status,
                        crc: u32::from_str_radix(fields[3], 16).unwrap_or(0),
                    });
                }
            }
            ("F", _) => {
                if let Some(nzb) = current.as_mut() {
                    match parse_file_record(&fields, nzb.id) {
                        Ok(file) => {
                            max_file_id = max_file_id.max(file.id.get());
                            nzb.files.push(file);
                        }
                        Err(e) => tracing::warn!(error = %e, "skipping damaged file record"),
                    }
                }
            }
            _ => {
                // Unknown record tag: forward compatibility
            }
        }
    }
    flush(
        &mut queue,
        &mut current,
        section == Section::History,
        &mut history_time,
    );
    queue.reserve_ids(max_nzb_id, max_file_id);

    // Detect a changed server set and remap per-server stats by host:port
    let mut needs_resave = false;
    if !saved_servers.is_empty() {
        let mut remap: HashMap<u32, u32> = HashMap::new();
        for (old_id, (host, port)) in &saved_servers {
            if let Some(new) = servers
                .iter()
                .find(|s| s.host == *host && s.port == *port)
            {
                remap.insert(*old_id, new.id);
            }
        }
        let unchanged = saved_servers.len() == servers.len()
            && remap.len() == saved_servers.len()
            && remap.iter().all(|(old, new)| old == new);
        if !unchanged {
            needs_resave = true;
            for nzb in &mut queue.queue {
                remap_stats(&mut nzb.server_stats, &remap);
            }
            for entry in &mut queue.history {
                if let HistoryItem::Nzb(nzb) = &mut entry.item {
                    remap_stats(&mut nzb.server_stats, &remap);
                }
            }
        }
    }

    Ok((queue, needs_resave))
}

fn remap_stats(stats: &mut ServerStatList, remap: &HashMap<u32, u32>) {
    let old = std::mem::take(&mut stats.0);
    for (id, stat) in old {
        if let Some(new_id) = remap.get(&id) {
            stats.add(*new_id, stat.success, stat.failed);
        }
        // Servers that disappeared drop their stats
    }
}

fn parse_nzb_record(fields: &[&str], path: &Path) -> Result<NzbInfo> {
    if fields.len() < 25 {
        return Err(Error::state(path, "short NZB record"));
    }
    let id = NzbId(fields[1].parse().map_err(|_| Error::state(path, "bad NZB id"))?);
    let mut nzb = NzbInfo::new(
        id,
        enum_from_str(fields[2]).unwrap_or_default(),
        unescape_field(fields[3]),
        unescape_field(fields[5]).into(),
    );
    nzb.name = unescape_field(fields[4]);
    nzb.category = unescape_field(fields[6]);
    nzb.priority = fields[7].parse().unwrap_or(0);
    nzb.dupe_key = unescape_field(fields[8]);
    nzb.dupe_score = fields[9].parse().unwrap_or(0);
    nzb.dupe_mode = enum_from_str(fields[10]).unwrap_or_default();
    nzb.content_hash = fields[11].to_string();
    nzb.filtered_content_hash = fields[12].to_string();
    nzb.rename_status = enum_from_str(fields[13]).unwrap_or_default();
    nzb.par_status = enum_from_str(fields[14]).unwrap_or_default();
    nzb.unpack_status = enum_from_str(fields[15]).unwrap_or_default();
    nzb.move_status = enum_from_str(fields[16]).unwrap_or_default();
    nzb.delete_status = enum_from_str(fields[17]).unwrap_or_default();
    nzb.mark_status = enum_from_str(fields[18]).unwrap_or_default();
    nzb.url_status = enum_from_str(fields[19]).unwrap_or_default();
    nzb.health_paused = fields[20] == "1";
    nzb.success_size = fields[21].parse().unwrap_or(0);
    nzb.failed_size = fields[22].parse().unwrap_or(0);
    nzb.par_success_size = fields[23].parse().unwrap_or(0);
    nzb.par_failed_size = fields[24].parse().unwrap_or(0);
    // Departed-file base counters; absent in older records
    if fields.len() >= 30 {
        nzb.completed_size = fields[25].parse().unwrap_or(0);
        nzb.completed_par_size = fields[26].parse().unwrap_or(0);
        nzb.completed_total_articles = fields[27].parse().unwrap_or(0);
        nzb.completed_success_articles = fields[28].parse().unwrap_or(0);
        nzb.completed_failed_articles = fields[29].parse().unwrap_or(0);
    }
    Ok(nzb)
}

fn parse_file_record(fields: &[&str], nzb_id: NzbId) -> Result<FileInfo> {
    if fields.len() < 19 {
        return Err(Error::Other("short file record".into()));
    }
    let id = FileId(
        fields[1]
            .parse()
            .map_err(|_| Error::Other("bad file id".into()))?,
    );
    let groups = {
        let joined = unescape_field(fields[18]);
        if joined.is_empty() {
            Vec::new()
        } else {
            joined.split(',').map(str::to_string).collect()
        }
    };
    let mut file = FileInfo::new(
        id,
        nzb_id,
        unescape_field(fields[2]),
        unescape_field(fields[3]),
        groups,
        fields[9].parse().unwrap_or(0),
        Vec::new(),
    );
    file.filename_confirmed = fields[4] == "1";
    file.par_file = fields[5] == "1";
    file.paused = fields[6] == "1";
    file.deleted = fields[7] == "1";
    file.extra_priority = fields[8] == "1";
    file.size = fields[10].parse().unwrap_or(0);
    file.remaining_size = fields[11].parse().unwrap_or(0);
    file.success_size = fields[12].parse().unwrap_or(0);
    file.failed_size = fields[13].parse().unwrap_or(0);
    file.missed_size = fields[14].parse().unwrap_or(0);
    file.total_articles = fields[15].parse().unwrap_or(0);
    file.success_articles = fields[16].parse().unwrap_or(0);
    file.failed_articles = fields[17].parse().unwrap_or(0);
    // The article partition is lazy-loaded from the per-file state record
    file.articles_loaded = false;
    Ok(file)
}

impl NzbInfo {
    /// Aggregate recomputation for records loaded without article lists:
    /// trusts the per-file ledgers instead of walking articles.
    pub(crate) fn recompute_aggregates_from_loaded(&mut self) {
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
}
