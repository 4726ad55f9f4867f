//! Periodic maintenance, driven roughly once per second by the coordinator
//!
//! - closes pooled connections past their idle cooldown
//! - reaps hung downloaders (stop, then force-terminate)
//! - flushes the queue state when dirty
//! - persists server statistics on a slower interval

use std::sync::Arc;
use std::time::Duration;

use crate::queue::ArticleState;

use super::EngineShared;

/// Interval between server-stat flushes
const STATS_SAVE_INTERVAL: Duration = Duration::from_secs(60);

/// Extra slack on top of the article timeout before a downloader is stopped
const STOP_SLACK: Duration = Duration::from_secs(1);

pub(crate) struct MaintenanceState {
    last_stats_save: std::time::Instant,
}

impl MaintenanceState {
    pub(crate) fn new() -> Self {
        Self {
            last_stats_save: std::time::Instant::now(),
        }
    }
}

/// One maintenance pass
pub(crate) async fn tick(shared: &Arc<EngineShared>, state: &mut MaintenanceState) {
    shared.pool.close_unused_connections().await;
    reap_hung_downloads(shared);

    if shared.take_queue_dirty() {
        let config = shared.config_snapshot();
        let queue = shared.queue.lock().expect("queue lock poisoned");
        if let Err(e) = shared.disk.save_download_queue(&queue, &config.servers) {
            tracing::error!(error = %e, "failed to save download queue");
            shared.mark_queue_dirty();
        }
    }

    if state.last_stats_save.elapsed() >= STATS_SAVE_INTERVAL {
        state.last_stats_save = std::time::Instant::now();
        if let Err(e) = shared.save_stats() {
            tracing::warn!(error = %e, "failed to save server statistics");
        }
    }

    // Stand-by bookkeeping: no running downloads means idle time
    if shared.active_count() == 0 {
        shared.meter.set_standby(true);
    }
}

/// Stop downloaders past the article timeout; force-terminate ones past the
/// terminate timeout, resetting their article to `Undefined`.
pub(crate) fn reap_hung_downloads(shared: &Arc<EngineShared>) {
    let config = shared.config_snapshot();
    let stop_after = config.download.article_timeout() + STOP_SLACK;
    let kill_after = config.download.terminate_timeout();

    // Phase 1 under the registry lock: decide, don't touch the queue
    let mut to_terminate = Vec::new();
    {
        let mut active = shared.active.lock().expect("registry lock poisoned");
        let now = shared.now_millis();
        for (task_id, entry) in active.iter_mut() {
            let age = Duration::from_millis(
                now.saturating_sub(entry.last_update.load(std::sync::atomic::Ordering::Relaxed)),
            );
            if age > kill_after {
                to_terminate.push(*task_id);
            } else if age > stop_after && !entry.stopped {
                tracing::warn!(
                    task_id,
                    age_secs = age.as_secs(),
                    "downloader stalled, stopping"
                );
                entry.stopped = true;
                entry.cancel.cancel();
            }
        }
    }

    // Phase 2: terminate claimed tasks and restore their articles
    for task_id in to_terminate {
        let Some(entry) = shared.claim_task_entry(task_id) else {
            continue; // task finished in the meantime
        };
        tracing::error!(task_id, "downloader hung past terminate timeout, killing");
        entry.cancel.cancel();
        if let Some(handle) = entry.handle {
            handle.abort();
        }

        let mut queue = shared.queue.lock().expect("queue lock poisoned");
        if let Some(nzb) = queue.find_mut(entry.nzb_id) {
            nzb.active_downloads = nzb.active_downloads.saturating_sub(1);
            if let Some(file) = nzb.file_mut(entry.file_id) {
                file.active_downloads = file.active_downloads.saturating_sub(1);
                if file
                    .article(entry.part_number)
                    .is_some_and(|a| a.state == ArticleState::Running)
                {
                    file.set_article_state(entry.part_number, ArticleState::Undefined);
                }
            }
        }
        drop(queue);
        shared.mark_queue_dirty();
    }
}
