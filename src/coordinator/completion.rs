//! Article completion: queue bookkeeping, file assembly, health guard
//!
//! Runs after every downloader task finishes. All queue mutations happen in
//! short critical sections; file assembly (disk I/O) happens between them on
//! a blocking thread with exclusive ownership of the removed FileInfo.

use std::sync::Arc;

use crate::config::HealthCheckAction;
use crate::queue::{ArticleState, FileInfo, NzbInfo};
use crate::types::{DeleteStatus, Event, MessageKind};
use crate::writer;

use super::EngineShared;
use super::article_task::{TaskInput, TaskResult, TaskStats};

/// Fold one finished task back into the queue and drive any file/NZB
/// completion that follows from it.
pub(crate) async fn article_completed(
    shared: &Arc<EngineShared>,
    input: &TaskInput,
    result: TaskResult,
    stats: TaskStats,
) {
    let config = shared.config_snapshot();
    let mut completed_file: Option<FileInfo> = None;
    let mut events: Vec<Event> = Vec::new();

    {
        let mut queue = shared.queue.lock().expect("queue lock poisoned");
        let Some(nzb) = queue.find_mut(input.nzb_id) else {
            // The NZB left the queue while we were downloading; nothing to
            // account against.
            return;
        };

        let mut par_file = false;
        let mut article_size = 0u64;
        if let Some(file) = nzb.file_mut(input.file_id) {
            par_file = file.par_file;
            file.active_downloads = file.active_downloads.saturating_sub(1);

            match &result {
                TaskResult::Retry => {
                    file.set_article_state(input.part_number, ArticleState::Undefined);
                }
                TaskResult::Finished(outcome) => {
                    article_size = file
                        .article(input.part_number)
                        .map(|a| a.size)
                        .unwrap_or(0);
                    if let Some(article) = file.article_mut(input.part_number) {
                        article.crc = outcome.crc;
                        article.segment_offset = outcome.segment_offset;
                        article.segment_size = outcome.segment_size;
                        article.result_path = outcome.fragment.clone();
                    }
                    file.set_article_state(input.part_number, ArticleState::Finished);
                    if let Some(name) = &outcome.filename {
                        file.confirm_filename(name);
                    }
                }
                TaskResult::Failed => {
                    article_size = file
                        .article(input.part_number)
                        .map(|a| a.size)
                        .unwrap_or(0);
                    file.set_article_state(input.part_number, ArticleState::Failed);
                }
            }
            file.server_stats.add_list(&stats.server_stats);
        }

        nzb.active_downloads = nzb.active_downloads.saturating_sub(1);
        nzb.server_stats.add_list(&stats.server_stats);
        match &result {
            TaskResult::Finished(_) => nzb.apply_article_sizes(article_size, par_file, true),
            TaskResult::Failed => nzb.apply_article_sizes(article_size, par_file, false),
            TaskResult::Retry => {}
        }
        shared.merge_global_stats(&stats.server_stats);

        apply_health_policy(shared, nzb, &config.download.health_check);

        // A file whose last article just went terminal (and whose downloads
        // drained) leaves the NZB for assembly.
        if let Some(idx) = nzb.files.iter().position(|f| {
            f.id == input.file_id
                && f.active_downloads == 0
                && f.articles_loaded
                && f.all_articles_terminal()
        }) {
            let file = nzb.files.remove(idx);
            nzb.fold_departed_file(&file);
            nzb.recompute_aggregates();
            completed_file = Some(file);
        }

        shared.mark_queue_dirty();
    }

    // Persist partial progress outside the queue lock window above; the
    // snapshot is taken under a fresh short lock.
    if config.download.continue_partial
        && completed_file.is_none()
        && let Err(e) = save_file_progress(shared, input)
    {
        tracing::warn!(file_id = %input.file_id, error = %e, "failed to save partial state");
    }

    if let Some(file) = completed_file {
        finish_file(shared, input, file, &config, &mut events).await;
    }

    for event in events {
        shared.emit(event);
    }

    maybe_finish_nzb(shared, input.nzb_id);
}

fn save_file_progress(
    shared: &EngineShared,
    input: &TaskInput,
) -> crate::error::Result<()> {
    let queue = shared.queue.lock().expect("queue lock poisoned");
    if let Some(file) = queue
        .find(input.nzb_id)
        .and_then(|nzb| nzb.file(input.file_id))
        && file.articles_loaded
    {
        shared.disk.save_file_state(file)?;
    }
    Ok(())
}

/// Assemble (or discard) a file whose articles are all terminal
async fn finish_file(
    shared: &Arc<EngineShared>,
    input: &TaskInput,
    file: FileInfo,
    config: &crate::config::Config,
    events: &mut Vec<Event>,
) {
    shared.disk.discard_file(&file, false, true);

    if file.deleted {
        let dest_dir = input.dest_dir.clone();
        let temp_dir = shared.disk.temp_dir().to_path_buf();
        let _ = tokio::task::spawn_blocking(move || {
            writer::discard_file_data(&file, &dest_dir, &temp_dir);
        })
        .await;
        return;
    }

    let dest_dir = input.dest_dir.clone();
    let temp_dir = shared.disk.temp_dir().to_path_buf();
    let direct_write = config.download.direct_write;
    let assembled = tokio::task::spawn_blocking(move || {
        writer::complete_file_parts(&file, &dest_dir, &temp_dir, direct_write)
            .map(|assembled| (file, assembled))
    })
    .await;

    match assembled {
        Ok(Ok((file, assembled))) => {
            if assembled.completed.status != crate::queue::CompletedFileStatus::Success {
                writer::append_broken_log(
                    &input.dest_dir,
                    &assembled.completed.filename,
                    assembled.completed.status,
                );
            }
            let mut queue = shared.queue.lock().expect("queue lock poisoned");
            if let Some(nzb) = queue.find_mut(input.nzb_id) {
                if assembled.completed.status != crate::queue::CompletedFileStatus::Success {
                    nzb.add_message(
                        MessageKind::Warning,
                        format!(
                            "{} completed with {} failed articles",
                            file.filename, file.failed_articles
                        ),
                    );
                }
                nzb.completed_files.push(assembled.completed.clone());
            }
            drop(queue);
            events.push(Event::FileCompleted {
                id: input.nzb_id,
                file_id: file.id,
                filename: assembled.completed.filename.clone(),
                path: assembled.path,
            });
            shared.mark_queue_dirty();
        }
        Ok(Err(e)) => {
            tracing::error!(file_id = %input.file_id, error = %e, "file assembly failed");
            let mut queue = shared.queue.lock().expect("queue lock poisoned");
            if let Some(nzb) = queue.find_mut(input.nzb_id) {
                nzb.add_message(
                    MessageKind::Error,
                    format!("could not assemble file: {e}"),
                );
            }
        }
        Err(e) => {
            tracing::error!(file_id = %input.file_id, error = %e, "assembly task panicked");
        }
    }
}

/// Recompute health after a completion and apply the configured policy when
/// it drops below critical health.
pub(crate) fn apply_health_policy(
    shared: &EngineShared,
    nzb: &mut NzbInfo,
    action: &HealthCheckAction,
) {
    let health = nzb.health();
    let critical = nzb.critical_health();
    if health >= critical || nzb.deleting || nzb.health_paused {
        return;
    }

    match action {
        HealthCheckAction::None => {}
        HealthCheckAction::Pause => {
            tracing::warn!(
                nzb_id = %nzb.id,
                health,
                critical,
                "health below critical, pausing"
            );
            nzb.add_message(
                MessageKind::Warning,
                format!("health {health} dropped below critical {critical}, paused"),
            );
            nzb.health_paused = true;
            for file in &mut nzb.files {
                file.paused = true;
            }
            nzb.recompute_aggregates();
        }
        HealthCheckAction::Delete => {
            tracing::warn!(
                nzb_id = %nzb.id,
                health,
                critical,
                "health below critical, deleting"
            );
            nzb.add_message(
                MessageKind::Warning,
                format!("health {health} dropped below critical {critical}, deleted"),
            );
            nzb.deleting = true;
            nzb.delete_status = DeleteStatus::Health;
            for file in &mut nzb.files {
                file.deleted = true;
            }
            nzb.recompute_aggregates();
            shared.cancel_tasks_for_nzb(nzb.id);
        }
    }
}

/// Move the NZB to history once it has neither files nor active downloads
pub(crate) fn maybe_finish_nzb(shared: &Arc<EngineShared>, nzb_id: crate::types::NzbId) {
    let mut queue = shared.queue.lock().expect("queue lock poisoned");
    let done = queue
        .find(nzb_id)
        .is_some_and(|nzb| nzb.active_downloads == 0 && (nzb.files.is_empty() || nzb.deleting));
    if !done {
        return;
    }
    if let Some(nzb) = queue.find(nzb_id) {
        // A deleting NZB may still own files; they are dropped with it.
        tracing::info!(
            nzb_id = %nzb_id,
            status = %nzb.text_status(),
            "download finished, moving to history"
        );
    }
    if let Some(nzb) = queue.find_mut(nzb_id) {
        for file in std::mem::take(&mut nzb.files) {
            shared.disk.discard_file(&file, true, true);
            nzb.fold_departed_file(&file);
        }
        nzb.recompute_aggregates();
    }
    queue.move_to_history(nzb_id);
    drop(queue);
    shared.mark_queue_dirty();
    shared.emit(Event::NzbDeleted { id: nzb_id });
}
