//! Per-file partial state: the article partition and its progress
//!
//! One record file per in-progress FileInfo under the queue directory. The
//! queue file stores per-file aggregates only; the article partition lives
//! here so completed files can shed their lists from memory and the
//! scheduler can lazy-load them back.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::queue::{ArticleInfo, ArticleState, FileInfo};
use crate::types::FileId;

use super::{atomic_write, escape_field, unescape_field};

const SIGNATURE: &str = "nzb-engine file state";
const FORMAT_VERSION: u32 = 1;

/// Path of one file's article record
pub(super) fn articles_path(queue_dir: &Path, file_id: FileId) -> PathBuf {
    queue_dir.join(format!("{file_id}.articles"))
}

/// Persist the article partition and per-server stats of one file.
///
/// In-flight articles are saved as `Undefined`: a `Running` state is
/// meaningless across a restart.
pub(super) fn save_file_articles(queue_dir: &Path, file: &FileInfo) -> Result<()> {
    let mut out = String::new();
    out.push_str(SIGNATURE);
    out.push('\n');
    out.push_str(&format!("version {FORMAT_VERSION}\n"));
    out.push_str(&format!("file {}\n", file.id.get()));

    for article in &file.articles {
        let state = match article.state {
            ArticleState::Running => ArticleState::Undefined,
            other => other,
        };
        out.push_str(&format!(
            "A\t{}\t{}\t{}\t{}\t{}\t{}\t{:08x}\t{}\n",
            article.part_number,
            escape_field(&article.message_id),
            article.size,
            state_to_str(state),
            article.segment_offset,
            article.segment_size,
            article.crc,
            escape_field(
                &article
                    .result_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default()
            ),
        ));
    }

    let mut stats: Vec<_> = file.server_stats.0.iter().collect();
    stats.sort_by_key(|(id, _)| **id);
    for (server_id, stat) in stats {
        out.push_str(&format!(
            "S\t{server_id}\t{}\t{}\n",
            stat.success, stat.failed
        ));
    }

    atomic_write(&articles_path(queue_dir, file.id), &out)
}

/// Load the article partition into `file` and rebuild its aggregates.
///
/// With `continue_partial` disabled, every article restarts from
/// `Undefined` and recorded progress is discarded.
pub(super) fn load_file_articles(
    queue_dir: &Path,
    file: &mut FileInfo,
    continue_partial: bool,
) -> Result<()> {
    let path = articles_path(queue_dir, file.id);
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

    let mut articles = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        match fields[0] {
            "A" if fields.len() >= 9 => {
                let mut article = ArticleInfo::new(
                    fields[1].parse().unwrap_or(0),
                    unescape_field(fields[2]),
                    fields[3].parse().unwrap_or(0),
                );
                article.state = state_from_str(fields[4]);
                article.segment_offset = fields[5].parse().unwrap_or(0);
                article.segment_size = fields[6].parse().unwrap_or(0);
                article.crc = u32::from_str_radix(fields[7], 16).unwrap_or(0);
                let result = unescape_field(fields[8]);
                if !result.is_empty() {
                    article.result_path = Some(PathBuf::from(result));
                }
                articles.push(article);
            }
            "S" if fields.len() >= 4 => {
                if let (Ok(id), Ok(success), Ok(failed)) =
                    (fields[1].parse(), fields[2].parse(), fields[3].parse())
                {
                    file.server_stats.add(id, success, failed);
                }
            }
            _ => {}
        }
    }

    if !continue_partial {
        for article in &mut articles {
            article.state = ArticleState::Undefined;
            article.crc = 0;
            article.segment_size = 0;
            article.result_path = None;
        }
    }

    file.articles = articles;
    file.articles_loaded = true;
    rebuild_file_aggregates(file);
    Ok(())
}

/// Recompute the per-file ledgers from the loaded article states. `missed`
/// bytes are preserved (they have no article-level trace).
fn rebuild_file_aggregates(file: &mut FileInfo) {
    file.size = file.articles.iter().map(|a| a.size).sum::<u64>();
    file.total_articles = file.articles.len() as u32;
    file.success_articles = 0;
    file.failed_articles = 0;
    file.success_size = 0;
    file.failed_size = 0;
    for article in &file.articles {
        match article.state {
            ArticleState::Finished => {
                file.success_articles += 1;
                file.success_size += article.size;
            }
            ArticleState::Failed => {
                file.failed_articles += 1;
                file.failed_size += article.size;
            }
            ArticleState::Undefined | ArticleState::Running => {}
        }
    }
    file.remaining_size = file
        .size
        .saturating_sub(file.success_size + file.failed_size + file.missed_size);
}

fn state_to_str(state: ArticleState) -> &'static str {
    match state {
        ArticleState::Undefined => "undefined",
        ArticleState::Running => "running",
        ArticleState::Finished => "finished",
        ArticleState::Failed => "failed",
    }
}

fn state_from_str(s: &str) -> ArticleState {
    match s {
        "finished" => ArticleState::Finished,
        "failed" => ArticleState::Failed,
        _ => ArticleState::Undefined,
    }
}
