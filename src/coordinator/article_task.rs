//! Per-article downloader task
//!
//! Server management for one article:
//! - a failed-servers set starts empty and the level starts at 0;
//! - connect errors and generic failures retry the same server within the
//!   per-server retry budget (connect errors also block the server briefly
//!   so other downloaders avoid it);
//! - not-found and CRC errors blacklist the server (and its co-group) for
//!   this article at the current level;
//! - when every server of the current level is blacklisted the level
//!   increases; when every level is exhausted the article fails.

use std::sync::Arc;
use std::time::Duration;

use crate::decoder::{DecodeStatus, Decoder, detect_format};
use crate::error::ArticleFailure;
use crate::nntp::{NntpConnection, PooledConnection, status_class};
use crate::stats::ServerStatList;
use crate::types::{FileId, NzbId};
use crate::writer::ArticleWriter;

use super::EngineShared;

/// Sleep between pool polls while waiting for a free connection
const POOL_WAIT: Duration = Duration::from_millis(5);

/// Sleep while the throttle holds the task over the rate ceiling
const THROTTLE_WAIT: Duration = Duration::from_millis(10);

/// Immediate re-issues of the ARTICLE command on a non-2xx response
const ARTICLE_RETRIES: u32 = 3;

/// Everything a downloader task needs, copied out under the queue lock when
/// the task is spawned. The task never holds queue references.
pub(crate) struct TaskInput {
    pub task_id: u64,
    pub nzb_id: NzbId,
    pub file_id: FileId,
    pub part_number: u32,
    pub message_id: String,
    pub groups: Vec<String>,
    /// Posting time of the file, for retention checks
    pub file_time: i64,
    /// Owning NZB has force priority
    pub force: bool,
    /// File ignores the global pause
    pub extra_priority: bool,
    pub output_lock: Arc<std::sync::Mutex<()>>,
    pub dest_dir: std::path::PathBuf,
    pub info_name: String,
}

/// Terminal outcome of the whole task
pub(crate) enum TaskResult {
    /// Article downloaded and decoded
    Finished(ArticleOutcome),
    /// All servers and retries exhausted (or a fatal local error)
    Failed,
    /// Interrupted (stop, pause, reconfiguration); the article goes back to
    /// `Undefined`
    Retry,
}

/// Details of a successful download
#[derive(Default)]
pub(crate) struct ArticleOutcome {
    /// CRC32 of the decoded segment
    pub crc: u32,
    /// Filename declared by the encoding
    pub filename: Option<String>,
    /// Segment offset within the assembled file
    pub segment_offset: u64,
    /// Decoded segment length
    pub segment_size: u64,
    /// Temp fragment path (temp mode only)
    pub fragment: Option<std::path::PathBuf>,
}

/// Stats accumulated by the task, merged into the queue at completion
#[derive(Default)]
pub(crate) struct TaskStats {
    pub server_stats: ServerStatList,
}

enum Attempt {
    Finished(ArticleOutcome),
    Failed(ArticleFailure),
    Cancelled,
}

/// Run the level/retry loop until a terminal result
pub(crate) async fn run(
    shared: &Arc<EngineShared>,
    input: &TaskInput,
    mut lease: Option<PooledConnection>,
    stats: &mut TaskStats,
) -> TaskResult {
    let config = shared.config_snapshot();
    let retries = config.download.retries.max(1);
    let mut remaining_retries = retries;
    let mut failed_servers: Vec<u32> = Vec::new();
    let mut want_server: Option<u32> = None;
    let mut level: i32 = 0;
    let generation = shared.pool.generation();
    let cancel = shared
        .active_cancel_token(input.task_id)
        .unwrap_or_default();

    loop {
        // Acquire a connection for the current level (the very first pass
        // uses the level-0 lease handed over by the coordinator).
        while lease.is_none() {
            if cancel.is_cancelled() || shared.pool.generation() != generation {
                return TaskResult::Retry;
            }
            lease = shared
                .pool
                .get_connection(level, want_server, &failed_servers);
            if lease.is_none() {
                tokio::time::sleep(POOL_WAIT).await;
            }
        }
        shared.touch_task(input.task_id);

        if cancel.is_cancelled()
            || shared.pool.generation() != generation
            || (shared.is_paused() && !input.force && !input.extra_priority)
        {
            if let Some(lease) = lease.take() {
                lease.release(false);
            }
            return TaskResult::Retry;
        }

        let Some(mut current) = lease.take() else {
            continue;
        };
        let server = current.server().clone();
        let server_id = server.id();

        // Retention check happens before the socket is known usable; an
        // out-of-retention server joins the failed set without costing a
        // socket retry.
        let retention = server.config().retention_days as i64;
        let retention_failure = retention > 0
            && (chrono::Utc::now().timestamp() - input.file_time) / 86_400 > retention;

        let attempt = if retention_failure {
            tracing::debug!(
                article = %input.info_name,
                server = %server.name(),
                retention,
                "article out of server retention"
            );
            Attempt::Failed(ArticleFailure::RetentionExpired)
        } else {
            match current.connect().await {
                Ok(()) => {
                    tracing::debug!(article = %input.info_name, server = %server.name(), "downloading");
                    let result = download(shared, input, &mut current, &config, &cancel).await;
                    // Per-server tallies count every decided attempt
                    match &result {
                        Attempt::Finished(_) => stats.server_stats.add(server_id, 1, 0),
                        Attempt::Failed(
                            ArticleFailure::Failed
                            | ArticleFailure::NotFound
                            | ArticleFailure::CrcError,
                        ) => stats.server_stats.add(server_id, 0, 1),
                        _ => {}
                    }
                    result
                }
                Err(e) => {
                    tracing::debug!(
                        article = %input.info_name,
                        server = %server.name(),
                        error = %e,
                        "could not establish connection"
                    );
                    Attempt::Failed(ArticleFailure::ConnectError)
                }
            }
        };

        // Raw socket bytes feed the per-server volume accounting
        let bytes = current.fetch_bytes_read();
        shared.add_server_volume(server_id, bytes);

        want_server = None;
        let mut push_failed = false;
        match attempt {
            Attempt::Finished(outcome) => {
                current.release(true);
                return TaskResult::Finished(outcome);
            }
            Attempt::Cancelled => {
                current.release(false);
                return TaskResult::Retry;
            }
            Attempt::Failed(ArticleFailure::FatalError) => {
                current.release(false);
                return TaskResult::Failed;
            }
            Attempt::Failed(ArticleFailure::ConnectError) => {
                // The block keeps other downloaders off the server; this
                // task retries the same server within its budget.
                shared.pool.block_server(server_id);
                current.release(false);
                remaining_retries = remaining_retries.saturating_sub(1);
                if remaining_retries > 0 {
                    want_server = Some(server_id);
                } else {
                    push_failed = true;
                }
            }
            Attempt::Failed(ArticleFailure::NotFound) => {
                current.release(true);
                push_failed = true;
            }
            Attempt::Failed(ArticleFailure::CrcError) => {
                current.release(false);
                push_failed = true;
            }
            Attempt::Failed(ArticleFailure::RetentionExpired) => {
                current.release(false);
                push_failed = true;
            }
            Attempt::Failed(ArticleFailure::Failed) => {
                remaining_retries = remaining_retries.saturating_sub(1);
                if remaining_retries > 0 {
                    // Keep hammering the same server within the budget
                    want_server = Some(server_id);
                    current.release(true);
                } else {
                    current.release(false);
                    push_failed = true;
                }
            }
        }

        if cancel.is_cancelled()
            || shared.pool.generation() != generation
            || (shared.is_paused() && !input.force && !input.extra_priority)
        {
            return TaskResult::Retry;
        }

        if push_failed {
            failed_servers.push(server_id);
            remaining_retries = retries;

            if level_exhausted(shared, level, &failed_servers) {
                if level < shared.pool.max_norm_level() {
                    tracing::debug!(
                        article = %input.info_name,
                        level,
                        "all servers of level failed, escalating"
                    );
                    level += 1;
                } else {
                    tracing::debug!(article = %input.info_name, "all servers failed");
                    return TaskResult::Failed;
                }
            }
        }
    }
}

/// Whether every active server of `level` is in the failed set (directly or
/// through its co-failover group)
fn level_exhausted(shared: &EngineShared, level: i32, failed_servers: &[u32]) -> bool {
    let servers = shared.pool.servers();
    for candidate in servers.iter().filter(|s| s.norm_level() == level) {
        if !candidate.active() || candidate.config().connections == 0 {
            continue;
        }
        let failed = failed_servers.iter().any(|id| {
            servers.iter().any(|f| {
                f.id() == *id
                    && (f.id() == candidate.id()
                        || (f.group() > 0
                            && f.group() == candidate.group()
                            && f.norm_level() == candidate.norm_level()))
            })
        });
        if !failed {
            return false;
        }
    }
    true
}

/// One download attempt over an established connection
async fn download(
    shared: &Arc<EngineShared>,
    input: &TaskInput,
    lease: &mut PooledConnection,
    config: &crate::config::Config,
    cancel: &tokio_util::sync::CancellationToken,
) -> Attempt {
    let server = lease.server().clone();
    let join_group = server.config().join_group;
    let Some(conn) = lease.connection() else {
        return Attempt::Failed(ArticleFailure::ConnectError);
    };

    // Group selection, when the server insists on it
    if join_group {
        let mut response = None;
        for group in &input.groups {
            match conn.join_group(group).await {
                Ok(r) => {
                    let ok = status_class(&r) == Some(2);
                    response = Some(r);
                    if ok {
                        break;
                    }
                }
                Err(_) => {
                    return Attempt::Failed(ArticleFailure::ConnectError);
                }
            }
        }
        if let Some(failure) = classify_response(response.as_deref(), conn) {
            tracing::debug!(article = %input.info_name, "could not join group");
            return Attempt::Failed(failure);
        }
    }

    // Fetch the article, with a few immediate retries on non-2xx
    let command = format!("ARTICLE {}", input.message_id);
    let mut response = None;
    for _ in 0..ARTICLE_RETRIES {
        match conn.request(&command).await {
            Ok(r) => {
                let done = status_class(&r) == Some(2) || conn.auth_error();
                response = Some(r);
                if done {
                    break;
                }
            }
            Err(_) => {
                response = None;
                break;
            }
        }
    }
    if let Some(failure) = classify_response(response.as_deref(), conn) {
        tracing::debug!(
            article = %input.info_name,
            response = response.as_deref().unwrap_or("<none>"),
            "could not fetch article"
        );
        return Attempt::Failed(failure);
    }

    let server_id = server.id();
    read_body(shared, input, conn, server_id, config, cancel).await
}

/// Map an NNTP response line onto the attempt taxonomy.
/// `None` means success (2xx).
fn classify_response(response: Option<&str>, conn: &NntpConnection) -> Option<ArticleFailure> {
    let Some(response) = response else {
        return Some(ArticleFailure::ConnectError);
    };
    if conn.auth_error() || response.starts_with("400") || response.starts_with("499") {
        return Some(ArticleFailure::ConnectError);
    }
    if response.starts_with("41") || response.starts_with("42") || response.starts_with("43") {
        return Some(ArticleFailure::NotFound);
    }
    if status_class(response) == Some(2) {
        return None;
    }
    Some(ArticleFailure::Failed)
}

/// Stream the article body through the decoder into the writer
async fn read_body(
    shared: &Arc<EngineShared>,
    input: &TaskInput,
    conn: &mut NntpConnection,
    server_id: u32,
    config: &crate::config::Config,
    cancel: &tokio_util::sync::CancellationToken,
) -> Attempt {
    let decode = config.download.decode;
    let rate = config.download.download_rate.unwrap_or(0);

    let mut writer = ArticleWriter::new(
        shared.disk.temp_dir().to_path_buf(),
        input.dest_dir.clone(),
        config.download.direct_write,
        input.file_id,
        input.part_number,
        input.output_lock.clone(),
    );
    let mut decoder: Option<Decoder> = None;
    let mut decoded_buf: Vec<u8> = Vec::with_capacity(16 * 1024);
    let mut line = Vec::with_capacity(1024);
    let mut in_body = false;
    let mut saw_end = false;
    let mut fatal = false;
    let mut failed = false;

    loop {
        if cancel.is_cancelled() {
            writer.finish(false);
            return Attempt::Cancelled;
        }
        shared.touch_task(input.task_id);

        // Throttle: hold the task while the measured or instantaneous rate
        // exceeds the ceiling. Touching keeps the hang reaper away from a
        // deliberately-throttled task.
        while rate > 0
            && (shared.meter.current_speed() > rate || shared.meter.momentary_speed() > rate)
        {
            if cancel.is_cancelled() {
                writer.finish(false);
                return Attempt::Cancelled;
            }
            shared.touch_task(input.task_id);
            tokio::time::sleep(THROTTLE_WAIT).await;
        }

        let read = tokio::select! {
            _ = cancel.cancelled() => {
                writer.finish(false);
                return Attempt::Cancelled;
            }
            read = conn.read_line(&mut line) => read,
        };
        let len = match read {
            Ok(len) => len,
            Err(e) => {
                tracing::debug!(article = %input.info_name, error = %e, "unexpected end of article");
                failed = true;
                break;
            }
        };
        shared.meter.add_speed_reading(len as u64);
        if config.download.accurate_rate {
            let bytes = conn.fetch_bytes_read();
            shared.add_server_volume(server_id, bytes);
        }

        if NntpConnection::is_body_end(&line) {
            saw_end = true;
            break;
        }
        let logical = NntpConnection::unstuff(&line);

        if !in_body {
            if logical == b"\r\n" || logical == b"\n" {
                in_body = true;
            } else if let Some(header_id) = logical
                .strip_prefix(b"Message-ID: ")
                .map(|rest| String::from_utf8_lossy(rest).trim().to_string())
                && header_id != input.message_id
            {
                tracing::debug!(
                    article = %input.info_name,
                    expected = %input.message_id,
                    returned = %header_id,
                    "wrong message-id returned"
                );
                failed = true;
                break;
            }
            continue;
        }

        if decode {
            if decoder.is_none()
                && let Some(format) = detect_format(logical)
            {
                decoder = Some(Decoder::new(format, config.download.crc_check));
            }
            let Some(decoder) = decoder.as_mut() else {
                continue;
            };
            decoded_buf.clear();
            decoder.decode_line(logical, &mut decoded_buf);
            if decoded_buf.is_empty() {
                continue;
            }
            if !writer.started() {
                let offset = decoder.part_begin().saturating_sub(1);
                if let Err(e) = writer.start(decoder.file_size(), offset) {
                    tracing::error!(article = %input.info_name, error = %e, "cannot open output");
                    fatal = true;
                    break;
                }
            }
            if let Err(e) = writer.write(&decoded_buf) {
                tracing::error!(article = %input.info_name, error = %e, "write failed");
                fatal = true;
                break;
            }
        } else {
            if !writer.started()
                && let Err(e) = writer.start(0, 0)
            {
                tracing::error!(article = %input.info_name, error = %e, "cannot open output");
                fatal = true;
                break;
            }
            if let Err(e) = writer.write(logical) {
                tracing::error!(article = %input.info_name, error = %e, "write failed");
                fatal = true;
                break;
            }
        }
    }

    if fatal {
        writer.finish(false);
        return Attempt::Failed(ArticleFailure::FatalError);
    }
    if failed || !saw_end {
        writer.finish(false);
        if !saw_end && !failed {
            tracing::debug!(article = %input.info_name, "article incomplete");
        }
        return Attempt::Failed(ArticleFailure::Failed);
    }

    if !decode {
        let fragment = writer.finish(true);
        return Attempt::Finished(ArticleOutcome {
            crc: 0,
            filename: None,
            segment_offset: 0,
            segment_size: 0,
            fragment,
        });
    }

    let Some(decoder) = decoder else {
        writer.finish(false);
        tracing::debug!(article = %input.info_name, "no binary data found");
        return Attempt::Failed(ArticleFailure::Failed);
    };

    match decoder.check() {
        DecodeStatus::Finished => {
            let fragment = writer.finish(true);
            let crc = if config.download.crc_check {
                decoder.calculated_crc()
            } else {
                decoder.expected_crc().unwrap_or_else(|| decoder.calculated_crc())
            };
            Attempt::Finished(ArticleOutcome {
                crc,
                filename: decoder.filename().map(str::to_string),
                segment_offset: decoder.part_begin().saturating_sub(1),
                segment_size: writer_segment_size(&decoder),
                fragment,
            })
        }
        DecodeStatus::CrcError => {
            writer.finish(false);
            tracing::debug!(article = %input.info_name, "CRC error");
            Attempt::Failed(ArticleFailure::CrcError)
        }
        status => {
            writer.finish(false);
            tracing::debug!(article = %input.info_name, ?status, "decoding failed");
            Attempt::Failed(ArticleFailure::Failed)
        }
    }
}

fn writer_segment_size(decoder: &Decoder) -> u64 {
    match decoder {
        Decoder::Yenc(d) => {
            if d.end() >= d.begin() && d.begin() > 0 {
                d.end() - d.begin() + 1
            } else {
                d.size()
            }
        }
        Decoder::Uu(_) => 0,
    }
}
