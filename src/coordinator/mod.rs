//! Queue coordinator: the engine handle and its main loop
//!
//! The coordinator owns the single outer queue lock. Its loop repeatedly
//! asks the pool for a level-0 connection, asks the scheduler for the next
//! article, and spawns a downloader task that drives one NNTP connection.
//! Completions, retries and failovers flow back through
//! [`completion::article_completed`]; a once-per-second maintenance tick
//! handles connection cooldown, hang reaping and state flushing.

mod article_task;
mod completion;
mod maintenance;


use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::{Config, ServerConfig};
use crate::error::{Error, Result};
use crate::diskstate::DiskState;
use crate::nntp::{PooledConnection, ServerPool};
use crate::queue::{ArticleState, DownloadQueue, EditAction, HistoryItem, NzbInfo};
use crate::scheduler::{self, ScheduleContext};
use crate::stats::{ServerStatList, SpeedMeter, VolumeStats};
use crate::types::{Event, FileId, NzbId, NzbKind, UrlStatus};
use crate::{nzb, writer};

use article_task::{TaskInput, TaskStats};

/// Sleep when the pool or the downloads limit has no capacity
const CAPACITY_WAIT: Duration = Duration::from_millis(5);

/// Sleep when the queue has nothing schedulable
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// How long shutdown waits for downloaders to drain before terminating them
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

/// One registered in-flight downloader
pub(crate) struct ActiveDownload {
    pub nzb_id: NzbId,
    pub file_id: FileId,
    pub part_number: u32,
    /// Milliseconds since the engine epoch of the last observed progress
    pub last_update: Arc<AtomicU64>,
    pub cancel: CancellationToken,
    /// A stop was already issued by the hang reaper
    pub stopped: bool,
    pub handle: Option<tokio::task::JoinHandle<()>>,
}

/// State shared between the engine handle, the main loop, downloader tasks
/// and maintenance.
pub(crate) struct EngineShared {
    config: RwLock<Arc<Config>>,
    pub(crate) queue: Mutex<DownloadQueue>,
    pub(crate) pool: Arc<ServerPool>,
    pub(crate) meter: SpeedMeter,
    pub(crate) disk: DiskState,
    event_tx: tokio::sync::broadcast::Sender<Event>,
    volumes: Mutex<VolumeStats>,
    total_stats: Mutex<ServerStatList>,
    paused: AtomicBool,
    temp_paused: AtomicBool,
    shutdown: CancellationToken,
    pub(crate) active: Mutex<HashMap<u64, ActiveDownload>>,
    next_task_id: AtomicU64,
    downloads_limit: AtomicUsize,
    queue_dirty: AtomicBool,
    epoch: Instant,
}

impl EngineShared {
    pub(crate) fn config_snapshot(&self) -> Arc<Config> {
        self.config.read().expect("config lock poisoned").clone()
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed) || self.temp_paused.load(Ordering::Relaxed)
    }

    pub(crate) fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn touch_task(&self, task_id: u64) {
        let active = self.active.lock().expect("registry lock poisoned");
        if let Some(entry) = active.get(&task_id) {
            entry.last_update.store(self.now_millis(), Ordering::Relaxed);
        }
    }

    pub(crate) fn active_cancel_token(&self, task_id: u64) -> Option<CancellationToken> {
        let active = self.active.lock().expect("registry lock poisoned");
        active.get(&task_id).map(|entry| entry.cancel.clone())
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.lock().expect("registry lock poisoned").len()
    }

    /// Remove a task from the registry, claiming responsibility for its
    /// queue bookkeeping. Only one caller wins.
    pub(crate) fn claim_task(&self, task_id: u64) -> bool {
        self.claim_task_entry(task_id).is_some()
    }

    pub(crate) fn claim_task_entry(&self, task_id: u64) -> Option<ActiveDownload> {
        self.active
            .lock()
            .expect("registry lock poisoned")
            .remove(&task_id)
    }

    pub(crate) fn cancel_tasks_for_nzb(&self, nzb_id: NzbId) {
        let active = self.active.lock().expect("registry lock poisoned");
        for entry in active.values().filter(|e| e.nzb_id == nzb_id) {
            entry.cancel.cancel();
        }
    }

    pub(crate) fn cancel_tasks_for_file(&self, file_id: FileId) {
        let active = self.active.lock().expect("registry lock poisoned");
        for entry in active.values().filter(|e| e.file_id == file_id) {
            entry.cancel.cancel();
        }
    }

    pub(crate) fn add_server_volume(&self, server_id: u32, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.volumes
            .lock()
            .expect("volumes lock poisoned")
            .add_bytes(server_id, bytes);
    }

    pub(crate) fn merge_global_stats(&self, stats: &ServerStatList) {
        self.total_stats
            .lock()
            .expect("stats lock poisoned")
            .add_list(stats);
    }

    pub(crate) fn mark_queue_dirty(&self) {
        self.queue_dirty.store(true, Ordering::Release);
    }

    pub(crate) fn take_queue_dirty(&self) -> bool {
        self.queue_dirty.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn downloads_limit(&self) -> usize {
        self.downloads_limit.load(Ordering::Relaxed)
    }

    pub(crate) fn emit(&self, event: Event) {
        // No receivers is fine; the engine does not depend on observers
        self.event_tx.send(event).ok();
    }

    pub(crate) fn save_stats(&self) -> Result<()> {
        let stats = self
            .total_stats
            .lock()
            .expect("stats lock poisoned")
            .clone();
        let volumes = self.volumes.lock().expect("volumes lock poisoned").clone();
        self.disk.save_stats(&stats, &volumes)
    }
}

/// Snapshot of one queued NZB for API consumers
#[derive(Clone, Debug)]
pub struct NzbSnapshot {
    /// NZB id
    pub id: NzbId,
    /// Display name
    pub name: String,
    /// Category
    pub category: String,
    /// Priority
    pub priority: i32,
    /// Total size in bytes
    pub size: u64,
    /// Bytes still to download
    pub remaining_size: u64,
    /// Bytes in paused files
    pub paused_size: u64,
    /// Total / finished / failed article counts
    pub total_articles: u32,
    /// Finished articles
    pub success_articles: u32,
    /// Failed articles
    pub failed_articles: u32,
    /// Health 0..1000
    pub health: u32,
    /// Critical health 0..1000
    pub critical_health: u32,
    /// Composed text status
    pub status: String,
    /// In-flight downloader tasks
    pub active_downloads: u32,
}

impl NzbSnapshot {
    fn of(nzb: &NzbInfo) -> Self {
        Self {
            id: nzb.id,
            name: nzb.name.clone(),
            category: nzb.category.clone(),
            priority: nzb.priority,
            size: nzb.size,
            remaining_size: nzb.remaining_size,
            paused_size: nzb.paused_size,
            total_articles: nzb.total_articles,
            success_articles: nzb.success_articles,
            failed_articles: nzb.failed_articles,
            health: nzb.health(),
            critical_health: nzb.critical_health(),
            status: nzb.text_status(),
            active_downloads: nzb.active_downloads,
        }
    }
}

/// The download engine (cloneable handle; all state is Arc-shared)
#[derive(Clone)]
pub struct DownloadEngine {
    shared: Arc<EngineShared>,
}

impl DownloadEngine {
    /// Build the engine: validate the configuration, open the state
    /// directories, restore the saved queue and statistics, and clean
    /// orphaned temp fragments. Call [`DownloadEngine::start`] to begin
    /// downloading.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let disk = DiskState::new(
            config.paths.queue_dir.clone(),
            config.paths.temp_dir.clone(),
        )?;
        let queue = disk.load_download_queue(&config.servers)?;
        let (total_stats, volumes) = disk.load_stats()?;
        disk.cleanup_temp_dir(&queue);

        let pool = Arc::new(ServerPool::new(
            &config.servers,
            config.download.connection_timeout(),
            Duration::from_secs(config.download.retry_interval_secs),
        ));
        let (event_tx, _) = tokio::sync::broadcast::channel(1000);
        let downloads_limit = config.downloads_limit();

        tracing::info!(
            servers = config.servers.len(),
            queued = queue.queue.len(),
            downloads_limit,
            "download engine initialised"
        );

        Ok(Self {
            shared: Arc::new(EngineShared {
                config: RwLock::new(Arc::new(config)),
                queue: Mutex::new(queue),
                pool,
                meter: SpeedMeter::new(),
                disk,
                event_tx,
                volumes: Mutex::new(volumes),
                total_stats: Mutex::new(total_stats),
                paused: AtomicBool::new(false),
                temp_paused: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                active: Mutex::new(HashMap::new()),
                next_task_id: AtomicU64::new(1),
                downloads_limit: AtomicUsize::new(downloads_limit),
                queue_dirty: AtomicBool::new(false),
                epoch: Instant::now(),
            }),
        })
    }

    /// Spawn the coordinator loop
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let shared = self.shared.clone();
        tokio::spawn(async move { main_loop(shared).await })
    }

    /// Subscribe to queue lifecycle events. Multiple subscribers are
    /// supported; each receives all events independently.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.shared.event_tx.subscribe()
    }

    /// Add an NZB from manifest bytes. Performs duplicate detection and the
    /// ingestion dedup pass, then queues at the head or tail.
    pub fn add_nzb(&self, content: &[u8], filename: &str, add_first: bool) -> Result<NzbId> {
        if self.shared.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let config = self.shared.config_snapshot();
        let mut queue = self.shared.queue.lock().expect("queue lock poisoned");

        let nzb = nzb::build_nzb_info(
            &mut queue,
            content,
            filename,
            config.paths.dest_dir.clone(),
        )?;

        if config.download.dupe_check
            && let Some(existing) = find_duplicate(&queue, &nzb)
        {
            return Err(Error::Duplicate(format!(
                "{} matches {existing}",
                nzb.name
            )));
        }

        let id = nzb.id;
        let name = nzb.name.clone();
        self.shared.emit(Event::NzbFound {
            id,
            name: name.clone(),
        });
        queue.add(nzb, add_first);
        drop(queue);

        tracing::info!(nzb_id = %id, name = %name, "NZB added to queue");
        self.shared.emit(Event::NzbAdded { id, name });
        self.shared.mark_queue_dirty();
        Ok(id)
    }

    /// Queue a URL entry. The engine does not fetch URLs itself; an external
    /// fetcher resolves it and reports through
    /// [`DownloadEngine::url_completed`].
    pub fn add_url(&self, name: &str) -> Result<NzbId> {
        if self.shared.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let config = self.shared.config_snapshot();
        let mut queue = self.shared.queue.lock().expect("queue lock poisoned");
        let id = queue.next_nzb_id();
        let mut nzb = NzbInfo::new(
            id,
            NzbKind::Url,
            format!("{name}.nzb"),
            config.paths.dest_dir.clone(),
        );
        nzb.name = name.to_string();
        nzb.url_status = UrlStatus::Running;
        queue.add(nzb, false);
        drop(queue);

        self.shared.emit(Event::NzbFound {
            id,
            name: name.to_string(),
        });
        self.shared.emit(Event::NzbAdded {
            id,
            name: name.to_string(),
        });
        self.shared.mark_queue_dirty();
        Ok(id)
    }

    /// Report the outcome of an external URL fetch: manifest bytes on
    /// success, `None` on failure.
    pub fn url_completed(&self, id: NzbId, content: Option<&[u8]>) -> Result<()> {
        let mut queue = self.shared.queue.lock().expect("queue lock poisoned");
        let Some(content) = content else {
            let nzb = queue
                .find_mut(id)
                .ok_or_else(|| Error::NotFound(format!("NZB {id}")))?;
            nzb.url_status = UrlStatus::Failure;
            queue.move_to_history(id);
            drop(queue);
            self.shared.emit(Event::UrlCompleted { id, success: false });
            self.shared.emit(Event::NzbDeleted { id });
            self.shared.mark_queue_dirty();
            return Ok(());
        };

        // Parse into a scratch NZB for id allocation, then graft the file
        // tree onto the waiting entry.
        let config = self.shared.config_snapshot();
        let parsed = nzb::build_nzb_info(
            &mut queue,
            content,
            "url.nzb",
            config.paths.dest_dir.clone(),
        )?;
        let nzb = queue
            .find_mut(id)
            .ok_or_else(|| Error::NotFound(format!("NZB {id}")))?;
        nzb.url_status = UrlStatus::Success;
        nzb.content_hash = parsed.content_hash.clone();
        nzb.filtered_content_hash = parsed.filtered_content_hash.clone();
        nzb.files = parsed.files;
        for file in &mut nzb.files {
            file.nzb_id = id;
        }
        nzb.recompute_aggregates();
        drop(queue);

        self.shared.emit(Event::UrlCompleted { id, success: true });
        self.shared.mark_queue_dirty();
        Ok(())
    }

    /// Apply one queue edit. Deletions also stop in-flight downloaders and
    /// finalise once they drain.
    pub fn edit(&self, id: NzbId, action: EditAction) -> Result<()> {
        // Hold scheduling back while the queue is being reshaped
        self.shared.temp_paused.store(true, Ordering::Relaxed);
        let result = self.edit_inner(id, &action);
        self.shared.temp_paused.store(false, Ordering::Relaxed);
        result
    }

    fn edit_inner(&self, id: NzbId, action: &EditAction) -> Result<()> {
        let mut events = {
            let mut queue = self.shared.queue.lock().expect("queue lock poisoned");
            crate::queue::editor::apply(&mut queue, id, action.clone())?
        };

        match action {
            EditAction::Delete => {
                self.shared.cancel_tasks_for_nzb(id);
                completion::maybe_finish_nzb(&self.shared, id);
            }
            EditAction::DeleteFile(file_id) => {
                self.shared.cancel_tasks_for_file(*file_id);
                self.reap_deleted_file(id, *file_id);
            }
            _ => {}
        }

        for event in events.drain(..) {
            self.shared.emit(event);
        }
        self.shared.mark_queue_dirty();
        Ok(())
    }

    /// Remove a deleted file immediately when no downloader still names it
    fn reap_deleted_file(&self, nzb_id: NzbId, file_id: FileId) {
        let mut queue = self.shared.queue.lock().expect("queue lock poisoned");
        let Some(nzb) = queue.find_mut(nzb_id) else {
            return;
        };
        let Some(idx) = nzb
            .files
            .iter()
            .position(|f| f.id == file_id && f.deleted && f.active_downloads == 0)
        else {
            return; // drains later through the completion path
        };
        let file = nzb.files.remove(idx);
        nzb.fold_departed_file(&file);
        let dest_dir = nzb.dest_dir.clone();
        nzb.recompute_aggregates();
        drop(queue);

        self.shared.disk.discard_file(&file, true, true);
        writer::discard_file_data(&file, &dest_dir, self.shared.disk.temp_dir());
        completion::maybe_finish_nzb(&self.shared, nzb_id);
    }

    /// Interpret one stdout line from a post-processing script against an
    /// NZB. Unknown `[NZB]` commands are logged as errors on the NZB's
    /// message log; plain output is ignored.
    pub fn apply_script_line(&self, id: NzbId, line: &str) -> Result<()> {
        let Some(parsed) = crate::scripts::parse_script_line(line) else {
            return Ok(());
        };
        let mut queue = self.shared.queue.lock().expect("queue lock poisoned");
        let nzb = queue
            .find_mut(id)
            .ok_or_else(|| Error::NotFound(format!("NZB {id}")))?;

        match parsed {
            Err(message) => {
                tracing::warn!(nzb_id = %id, %message, "script command rejected");
                nzb.add_message(crate::types::MessageKind::Error, message);
            }
            Ok(crate::scripts::ScriptCommand::Directory(new_dir)) => {
                let old_dir = std::mem::replace(&mut nzb.dest_dir, new_dir.clone());
                let completed = nzb.completed_files.clone();
                drop(queue);
                writer::move_completed_files(&completed, &old_dir, &new_dir)?;
                self.shared.mark_queue_dirty();
                return Ok(());
            }
            Ok(crate::scripts::ScriptCommand::Parameter { name, value }) => {
                nzb.set_parameter(&name, &value);
            }
            Ok(crate::scripts::ScriptCommand::Mark(mark)) => {
                nzb.mark_status = mark;
            }
            Ok(crate::scripts::ScriptCommand::Priority(priority)) => {
                nzb.priority = priority;
            }
        }
        drop(queue);
        self.shared.mark_queue_dirty();
        Ok(())
    }

    /// Pause or resume the whole queue. Force-priority NZBs keep downloading.
    pub fn pause_download(&self, paused: bool) {
        self.shared.paused.store(paused, Ordering::Relaxed);
        tracing::info!(paused, "global pause changed");
    }

    /// Whether the global pause is in effect
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Relaxed)
    }

    /// Current download speed over the metering window, bytes per second
    pub fn current_speed(&self) -> u64 {
        self.shared.meter.current_speed()
    }

    /// Lifetime per-server success/failure tallies
    pub fn server_stats(&self) -> crate::stats::ServerStatList {
        self.shared
            .total_stats
            .lock()
            .expect("stats lock poisoned")
            .clone()
    }

    /// Replace the server configuration: the pool re-derives normalised
    /// levels and reconciles connections; running downloaders notice the
    /// generation change and retry.
    pub fn reconfigure_servers(&self, servers: Vec<ServerConfig>) -> Result<()> {
        let new_config = {
            let mut guard = self.shared.config.write().expect("config lock poisoned");
            let mut config = (**guard).clone();
            config.servers = servers;
            config.validate()?;
            let arc = Arc::new(config);
            *guard = arc.clone();
            arc
        };
        self.shared.pool.changed(&new_config.servers);
        self.shared
            .downloads_limit
            .store(new_config.downloads_limit(), Ordering::Relaxed);
        self.shared.mark_queue_dirty();
        Ok(())
    }

    /// Snapshot of the queue for display
    pub fn queue_snapshot(&self) -> Vec<NzbSnapshot> {
        let queue = self.shared.queue.lock().expect("queue lock poisoned");
        queue.queue.iter().map(NzbSnapshot::of).collect()
    }

    /// Snapshot of the history: (time, name, status)
    pub fn history_snapshot(&self) -> Vec<(i64, String, String)> {
        let queue = self.shared.queue.lock().expect("queue lock poisoned");
        queue
            .history
            .iter()
            .map(|entry| {
                let status = match &entry.item {
                    HistoryItem::Nzb(nzb) => nzb.text_status(),
                    HistoryItem::Dup(dup) => dup.status.clone(),
                };
                (entry.time, entry.name().to_string(), status)
            })
            .collect()
    }

    /// Stop the coordinator, drain (or terminate) downloaders, and persist
    /// all state.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("shutting down download engine");
        self.shared.shutdown.cancel();
        {
            let active = self.shared.active.lock().expect("registry lock poisoned");
            for entry in active.values() {
                entry.cancel.cancel();
            }
        }

        let deadline = Instant::now() + SHUTDOWN_DRAIN;
        while self.shared.active_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Terminate stragglers, restoring their articles
        let leftover: Vec<u64> = {
            let active = self.shared.active.lock().expect("registry lock poisoned");
            active.keys().copied().collect()
        };
        for task_id in leftover {
            if let Some(entry) = self.shared.claim_task_entry(task_id) {
                if let Some(handle) = entry.handle {
                    handle.abort();
                }
                let mut queue = self.shared.queue.lock().expect("queue lock poisoned");
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
            }
        }

        let config = self.shared.config_snapshot();
        {
            let queue = self.shared.queue.lock().expect("queue lock poisoned");
            self.shared
                .disk
                .save_download_queue(&queue, &config.servers)?;
        }
        self.shared.save_stats()?;
        self.shared.pool.close_unused_connections().await;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }
}

/// Content-hash duplicate lookup over queue and history
fn find_duplicate(queue: &DownloadQueue, candidate: &NzbInfo) -> Option<String> {
    let matches = |hash: &str, filtered: &str, name: &str| -> Option<String> {
        if !candidate.content_hash.is_empty() && candidate.content_hash == hash {
            return Some(name.to_string());
        }
        if !candidate.filtered_content_hash.is_empty()
            && candidate.filtered_content_hash == filtered
        {
            return Some(name.to_string());
        }
        None
    };
    for nzb in &queue.queue {
        if nzb.id == candidate.id {
            continue;
        }
        if let Some(name) = matches(&nzb.content_hash, &nzb.filtered_content_hash, &nzb.name) {
            return Some(name);
        }
    }
    for entry in &queue.history {
        match &entry.item {
            HistoryItem::Nzb(nzb) => {
                if let Some(name) =
                    matches(&nzb.content_hash, &nzb.filtered_content_hash, &nzb.name)
                {
                    return Some(name);
                }
            }
            HistoryItem::Dup(dup) => {
                if !candidate.content_hash.is_empty() && candidate.content_hash == dup.content_hash
                {
                    return Some(dup.name.clone());
                }
            }
        }
    }
    None
}

/// The coordinator loop
async fn main_loop(shared: Arc<EngineShared>) {
    tracing::debug!("coordinator loop started");
    let mut maintenance = maintenance::MaintenanceState::new();
    let mut last_tick = Instant::now();

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }
        if last_tick.elapsed() >= Duration::from_secs(1) {
            last_tick = Instant::now();
            maintenance::tick(&shared, &mut maintenance).await;
        }

        if shared.active_count() >= shared.downloads_limit() {
            tokio::time::sleep(CAPACITY_WAIT).await;
            continue;
        }

        // A level-0 connection is acquired first; the downloader task takes
        // it over and handles failover to higher levels itself.
        let Some(lease) = shared.pool.get_connection(0, None, &[]) else {
            tokio::time::sleep(CAPACITY_WAIT).await;
            continue;
        };

        if !try_spawn_download(&shared, lease) {
            tokio::time::sleep(IDLE_WAIT).await;
        }
    }
    tracing::debug!("coordinator loop stopped");
}

/// Pick the next article and spawn its downloader. Returns false when
/// nothing is schedulable (the lease goes back to the pool).
fn try_spawn_download(shared: &Arc<EngineShared>, lease: PooledConnection) -> bool {
    let config = shared.config_snapshot();
    let ctx = ScheduleContext {
        now: chrono::Utc::now().timestamp(),
        propagation_delay_secs: config.download.propagation_delay_secs as i64,
        paused: shared.is_paused(),
    };
    let continue_partial = config.download.continue_partial;

    let mut queue = shared.queue.lock().expect("queue lock poisoned");
    let disk = &shared.disk;
    let next = scheduler::next_article(&mut queue, &ctx, &mut |file| {
        disk.load_file_articles(file, continue_partial).is_ok()
    });
    let Some(next) = next else {
        drop(queue);
        lease.release_unused();
        return false;
    };

    // Transition the article and counters under the same lock that chose it
    let Some(nzb) = queue.find_mut(next.nzb_id) else {
        drop(queue);
        lease.release_unused();
        return false;
    };
    let force = nzb.force_priority();
    let dest_dir = nzb.dest_dir.clone();
    let nzb_name = nzb.name.clone();
    nzb.active_downloads += 1;
    let Some(file) = nzb.file_mut(next.file_id) else {
        nzb.active_downloads -= 1;
        drop(queue);
        lease.release_unused();
        return false;
    };
    file.set_article_state(next.part_number, ArticleState::Running);
    file.active_downloads += 1;
    if config.download.direct_write && file.output_filename.is_none() {
        file.output_filename = Some(writer::output_path(&dest_dir, file.id));
    }
    let Some(article) = file.article(next.part_number) else {
        // The scheduler chose it under this same lock; a miss means queue
        // corruption, back out rather than crash.
        file.set_article_state(next.part_number, ArticleState::Undefined);
        file.active_downloads -= 1;
        nzb.active_downloads -= 1;
        drop(queue);
        lease.release_unused();
        return false;
    };

    let task_id = shared.next_task_id.fetch_add(1, Ordering::Relaxed);
    let input = TaskInput {
        task_id,
        nzb_id: next.nzb_id,
        file_id: next.file_id,
        part_number: next.part_number,
        message_id: article.message_id.clone(),
        groups: file.groups.clone(),
        file_time: file.time,
        force,
        extra_priority: file.extra_priority,
        output_lock: file.output_lock.clone(),
        dest_dir,
        info_name: format!("{nzb_name}/{} [{}]", file.filename, next.part_number),
    };
    drop(queue);

    shared.meter.set_standby(false);
    let cancel = CancellationToken::new();
    let last_update = Arc::new(AtomicU64::new(shared.now_millis()));
    {
        let mut active = shared.active.lock().expect("registry lock poisoned");
        active.insert(
            task_id,
            ActiveDownload {
                nzb_id: next.nzb_id,
                file_id: next.file_id,
                part_number: next.part_number,
                last_update,
                cancel,
                stopped: false,
                handle: None,
            },
        );
    }

    let task_shared = shared.clone();
    let handle = tokio::spawn(async move {
        let mut stats = TaskStats::default();
        let result = article_task::run(&task_shared, &input, Some(lease), &mut stats).await;
        // Claiming the registry entry makes this task solely responsible
        // for the queue bookkeeping; the hang reaper claims instead when it
        // terminates a task.
        if task_shared.claim_task(input.task_id) {
            completion::article_completed(&task_shared, &input, result, stats).await;
        }
    });
    if let Some(entry) = shared
        .active
        .lock()
        .expect("registry lock poisoned")
        .get_mut(&task_id)
    {
        entry.handle = Some(handle);
    }
    true
}
