//! Server pool: connection cache with level/priority failover
//!
//! The pool owns every [`NewsServer`] and a vector of connection slots, each
//! pre-bound to one server. Failover levels are *normalised*: starting from
//! the lowest configured level, every distinct level with at least one
//! active, non-zero-connection server (or being the minimum level) gets the
//! next integer 0..M. Servers of the minimum level keep normalised level 0
//! even while inactive, so a backup tier can never be promoted to primary.
//!
//! All pool operations are short, non-I/O critical sections under one lock;
//! socket teardown happens outside the lock in
//! [`ServerPool::close_unused_connections`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::ServerConfig;

use super::{NntpConnection, NntpError};

/// Seconds an idle connection is kept warm before the reaper closes it
const CONNECTION_HOLD: Duration = Duration::from_secs(5);

/// A configured news server plus its derived failover state
pub struct NewsServer {
    config: ServerConfig,
    norm_level: AtomicI32,
}

impl NewsServer {
    fn new(config: ServerConfig) -> Self {
        Self {
            config,
            norm_level: AtomicI32::new(-1),
        }
    }

    /// Stable server id
    pub fn id(&self) -> u32 {
        self.config.id
    }

    /// The underlying configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Normalised failover level, or -1 when the server is out of rotation
    pub fn norm_level(&self) -> i32 {
        self.norm_level.load(Ordering::Relaxed)
    }

    /// Co-failover group (0 = none)
    pub fn group(&self) -> u32 {
        self.config.group
    }

    /// Whether the server participates in downloads
    pub fn active(&self) -> bool {
        self.config.active
    }

    /// Display name
    pub fn name(&self) -> String {
        self.config.display_name()
    }
}

struct Slot {
    /// Stable id; leases reference slots by this, never by index, so a
    /// reconfiguration cannot misdirect a later release.
    id: u64,
    server: Arc<NewsServer>,
    in_use: bool,
    free_since: Option<Instant>,
    conn: Option<NntpConnection>,
}

struct PoolInner {
    servers: Vec<Arc<NewsServer>>,
    slots: Vec<Slot>,
    /// Free-slot counter per normalised level
    levels: Vec<u32>,
    max_norm_level: i32,
    next_slot_id: u64,
    /// Server id -> blocked-until instant
    blocked: HashMap<u32, Instant>,
}

impl PoolInner {
    fn rebuild_level_counters(&mut self) {
        let mut levels = vec![0u32; (self.max_norm_level + 1) as usize];
        for slot in &self.slots {
            let norm = slot.server.norm_level();
            if !slot.in_use && slot.server.active() && norm >= 0 {
                levels[norm as usize] += 1;
            }
        }
        self.levels = levels;
    }
}

/// Owns all connections; hands out one matching a requested level
pub struct ServerPool {
    inner: Mutex<PoolInner>,
    generation: AtomicU32,
    io_timeout: Duration,
    /// How long a connect-error block lasts
    block_interval: Duration,
}

impl ServerPool {
    /// Build the pool from the configured server list
    pub fn new(servers: &[ServerConfig], io_timeout: Duration, block_interval: Duration) -> Self {
        let pool = Self {
            inner: Mutex::new(PoolInner {
                servers: Vec::new(),
                slots: Vec::new(),
                levels: Vec::new(),
                max_norm_level: 0,
                next_slot_id: 1,
                blocked: HashMap::new(),
            }),
            generation: AtomicU32::new(0),
            io_timeout,
            block_interval,
        };
        pool.apply_servers(servers);
        pool
    }

    /// Configuration generation; bumped by [`ServerPool::changed`] so
    /// in-flight downloaders can detect reconfiguration and retry.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Highest normalised level currently in rotation
    pub fn max_norm_level(&self) -> i32 {
        self.inner.lock().expect("pool lock poisoned").max_norm_level
    }

    /// Snapshot of the server list
    pub fn servers(&self) -> Vec<Arc<NewsServer>> {
        self.inner.lock().expect("pool lock poisoned").servers.clone()
    }

    /// Socket timeout handed to new connections
    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    /// Number of free slots at a normalised level (0 when out of range)
    pub fn free_slots(&self, level: i32) -> u32 {
        let inner = self.inner.lock().expect("pool lock poisoned");
        usize::try_from(level)
            .ok()
            .and_then(|l| inner.levels.get(l).copied())
            .unwrap_or(0)
    }

    /// Hand out a free connection at exactly `level`.
    ///
    /// Prefers `want_server` (or another server in its co-failover group).
    /// When no preference is given, skips `ignore_servers` and their
    /// co-groups, plus servers under a connect-error block. Returns `None`
    /// when nothing matches.
    pub fn get_connection(
        self: &Arc<Self>,
        level: i32,
        want_server: Option<u32>,
        ignore_servers: &[u32],
    ) -> Option<PooledConnection> {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let level_idx = usize::try_from(level).ok()?;
        if inner.levels.get(level_idx).copied().unwrap_or(0) == 0 {
            return None;
        }

        let now = Instant::now();
        let want = want_server.and_then(|id| {
            inner
                .servers
                .iter()
                .find(|s| s.id() == id)
                .map(|s| (s.id(), s.group()))
        });
        let ignore: Vec<(u32, u32, i32)> = ignore_servers
            .iter()
            .filter_map(|id| {
                inner
                    .servers
                    .iter()
                    .find(|s| s.id() == *id)
                    .map(|s| (s.id(), s.group(), s.norm_level()))
            })
            .collect();

        let mut chosen = None;
        for (idx, slot) in inner.slots.iter().enumerate() {
            let server = &slot.server;
            if slot.in_use || !server.active() || server.norm_level() != level {
                continue;
            }
            if let Some((want_id, want_group)) = want {
                let matches = server.id() == want_id
                    || (want_group > 0 && want_group == server.group());
                if !matches {
                    continue;
                }
            } else {
                let ignored = ignore.iter().any(|(id, group, norm)| {
                    *id == server.id()
                        || (*group > 0 && *group == server.group() && *norm == server.norm_level())
                });
                if ignored {
                    continue;
                }
                if let Some(until) = inner.blocked.get(&server.id())
                    && *until > now
                {
                    continue;
                }
            }
            chosen = Some(idx);
            break;
        }

        let idx = chosen?;
        inner.slots[idx].in_use = true;
        inner.levels[level_idx] -= 1;
        let slot_id = inner.slots[idx].id;
        let server = inner.slots[idx].server.clone();
        let conn = inner.slots[idx].conn.take();
        drop(inner);

        Some(PooledConnection {
            pool: self.clone(),
            slot_id,
            server,
            conn,
            released: false,
        })
    }

    /// Temporarily exclude a server from selection after a connect error
    pub fn block_server(&self, server_id: u32) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        inner
            .blocked
            .insert(server_id, Instant::now() + self.block_interval);
        tracing::debug!(server_id, "server blocked after connect error");
    }

    /// Reconfigure the server set: re-derive normalised levels, reconcile
    /// connection slots up/down, clear blocks, and bump the generation.
    pub fn changed(&self, servers: &[ServerConfig]) {
        self.apply_servers(servers);
        tracing::info!(generation = self.generation(), "server pool reconfigured");
    }

    /// Close idle connections whose cooldown expired or whose server left the
    /// rotation; slots of removed servers are deleted. Invoked roughly once
    /// per second by the coordinator's maintenance tick.
    pub async fn close_unused_connections(&self) {
        let mut to_close: Vec<NntpConnection> = Vec::new();
        {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            let now = Instant::now();

            // Delete idle slots of servers that fell out of rotation
            let mut removed: Vec<NntpConnection> = Vec::new();
            inner.slots.retain_mut(|slot| {
                let gone = !slot.in_use
                    && (slot.server.norm_level() == -1 || !slot.server.active());
                if gone && let Some(conn) = slot.conn.take() {
                    removed.push(conn);
                }
                !gone
            });
            to_close.append(&mut removed);

            // Close (but keep) idle connections past the cooldown
            for slot in inner.slots.iter_mut() {
                if slot.in_use {
                    continue;
                }
                if let Some(free_since) = slot.free_since
                    && now.duration_since(free_since) > CONNECTION_HOLD
                    && let Some(conn) = slot.conn.take()
                {
                    slot.free_since = None;
                    to_close.push(conn);
                }
            }

            inner.rebuild_level_counters();
        }

        for mut conn in to_close {
            conn.disconnect().await;
        }
    }

    fn apply_servers(&self, configs: &[ServerConfig]) {
        let servers: Vec<Arc<NewsServer>> = configs
            .iter()
            .map(|c| Arc::new(NewsServer::new(c.clone())))
            .collect();
        let max_norm_level = normalize_levels(&servers);

        let mut inner = self.inner.lock().expect("pool lock poisoned");

        // Reconcile slots. Slots of surviving servers are rebound to the new
        // NewsServer instance; in-use slots of removed servers stay (their
        // lease will release them, the reaper then deletes them); idle slots
        // of removed servers are dropped here.
        let old_slots = std::mem::take(&mut inner.slots);
        let mut slots: Vec<Slot> = Vec::new();
        for mut slot in old_slots {
            if let Some(server) = servers.iter().find(|s| s.id() == slot.server.id()) {
                slot.server = server.clone();
                slots.push(slot);
            } else if slot.in_use {
                // norm_level stays whatever the removed instance carried;
                // mark it out of rotation explicitly.
                slot.server.norm_level.store(-1, Ordering::Relaxed);
                slots.push(slot);
            }
        }

        // Top up to max_connections per active in-rotation server
        for server in &servers {
            if server.norm_level() < 0 || !server.active() {
                continue;
            }
            let have = slots.iter().filter(|s| s.server.id() == server.id()).count();
            for _ in have..server.config().connections as usize {
                let id = inner.next_slot_id;
                inner.next_slot_id += 1;
                slots.push(Slot {
                    id,
                    server: server.clone(),
                    in_use: false,
                    free_since: None,
                    conn: None,
                });
            }
        }

        inner.servers = servers;
        inner.slots = slots;
        inner.max_norm_level = max_norm_level;
        inner.rebuild_level_counters();
        inner.blocked.clear();
        drop(inner);

        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn free_slot(&self, slot_id: u64, conn: Option<NntpConnection>, was_used: bool) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let Some(slot) = inner.slots.iter_mut().find(|s| s.id == slot_id) else {
            // Slot deleted by a reconfiguration while leased; socket closes.
            return;
        };
        slot.in_use = false;
        slot.conn = conn;
        if was_used {
            slot.free_since = Some(Instant::now());
        }
        let norm = slot.server.norm_level();
        let active = slot.server.active();
        if norm >= 0 && active {
            inner.levels[norm as usize] += 1;
        }
    }
}

/// Derive normalised levels; returns the maximum normalised level.
///
/// Servers of the minimum configured level always stay in rotation (even
/// inactive ones) so that a backup tier cannot become level 0.
fn normalize_levels(servers: &[Arc<NewsServer>]) -> i32 {
    if servers.is_empty() {
        return 0;
    }

    let mut sorted: Vec<&Arc<NewsServer>> = servers.iter().collect();
    sorted.sort_by_key(|s| s.config().level);
    let min_level = sorted[0].config().level;

    let mut max_norm = 0i32;
    let mut last_level = min_level;
    for server in sorted {
        let config = server.config();
        let usable = (config.active && config.connections > 0) || config.level == min_level;
        if usable {
            if config.level != last_level {
                max_norm += 1;
            }
            server.norm_level.store(max_norm, Ordering::Relaxed);
            last_level = config.level;
        } else {
            server.norm_level.store(-1, Ordering::Relaxed);
        }
    }
    max_norm
}

/// Exclusive lease on one pool slot, released back on drop.
///
/// The socket (if any) travels with the lease so the downloader can drive it
/// without holding the pool lock.
pub struct PooledConnection {
    pool: Arc<ServerPool>,
    slot_id: u64,
    server: Arc<NewsServer>,
    conn: Option<NntpConnection>,
    released: bool,
}

impl PooledConnection {
    /// The server this lease is bound to
    pub fn server(&self) -> &Arc<NewsServer> {
        &self.server
    }

    /// Establish the NNTP session if the slot has no warm socket yet
    pub async fn connect(&mut self) -> Result<(), NntpError> {
        if self
            .conn
            .as_ref()
            .is_some_and(|c| c.status() == super::ConnectionStatus::Connected)
        {
            return Ok(());
        }
        let conn =
            NntpConnection::connect(self.server.config(), self.pool.io_timeout()).await?;
        self.conn = Some(conn);
        Ok(())
    }

    /// Mutable access to the underlying connection (None before `connect`)
    pub fn connection(&mut self) -> Option<&mut NntpConnection> {
        self.conn.as_mut()
    }

    /// Take the raw-byte counter from the underlying connection, if any
    pub fn fetch_bytes_read(&mut self) -> u64 {
        self.conn.as_mut().map(|c| c.fetch_bytes_read()).unwrap_or(0)
    }

    /// Return the lease after use. `keep_connected` pools the warm socket
    /// for reuse; otherwise the socket is dropped. The idle cooldown starts
    /// now.
    pub fn release(mut self, keep_connected: bool) {
        let conn = if keep_connected {
            self.conn
                .take()
                .filter(|c| c.status() == super::ConnectionStatus::Connected)
        } else {
            None
        };
        self.pool.free_slot(self.slot_id, conn, true);
        self.released = true;
    }

    /// Return a lease that was never used for I/O, leaving the cooldown
    /// stamp untouched so an idle warm socket still ages out.
    pub fn release_unused(mut self) {
        let conn = self
            .conn
            .take()
            .filter(|c| c.status() == super::ConnectionStatus::Connected);
        self.pool.free_slot(self.slot_id, conn, false);
        self.released = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.released {
            // Dropped without an explicit release (task abort or panic):
            // the slot must still come back, socket discarded.
            self.pool.free_slot(self.slot_id, None, true);
        }
    }
}
