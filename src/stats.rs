//! Speed metering and per-server statistics
//!
//! The [`SpeedMeter`] keeps a small ring of one-second byte counters plus a
//! running sum. Readings come from the hot per-line download path, so the
//! critical section is a handful of integer operations. A periodic self-check
//! guards the running sum against wall-clock jumps: on any mismatch the meter
//! resets instead of reporting garbage.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of one-second slots in the speed ring
const SPEED_SLOTS: usize = 2;

/// Seconds between running-sum self-checks
const SELF_CHECK_INTERVAL: i64 = 30;

fn wall_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct MeterInner {
    slots: [u64; SPEED_SLOTS],
    /// Wall-clock second the current slot belongs to
    slot_time: i64,
    cur_slot: usize,
    /// Running sum over all slots; must always equal `slots.iter().sum()`
    total: u64,
    last_self_check: i64,
    standby: bool,
    /// Accumulated seconds spent actively downloading
    active_secs: i64,
    active_since: Option<i64>,
}

impl MeterInner {
    fn reset(&mut self, now: i64) {
        self.slots = [0; SPEED_SLOTS];
        self.slot_time = now;
        self.cur_slot = 0;
        self.total = 0;
        self.last_self_check = now;
    }

    /// Advance the ring to `now`, clearing slots that fell out of the window.
    /// A wall clock that moved backwards resets the meter entirely.
    fn roll(&mut self, now: i64) {
        if now < self.slot_time {
            self.reset(now);
            return;
        }
        let gap = now - self.slot_time;
        if gap as usize >= SPEED_SLOTS {
            self.reset(now);
            return;
        }
        for _ in 0..gap {
            self.cur_slot = (self.cur_slot + 1) % SPEED_SLOTS;
            self.total -= self.slots[self.cur_slot];
            self.slots[self.cur_slot] = 0;
        }
        self.slot_time = now;
    }

    fn self_check(&mut self, now: i64) {
        if (now - self.last_self_check).abs() < SELF_CHECK_INTERVAL {
            return;
        }
        self.last_self_check = now;
        let sum: u64 = self.slots.iter().sum();
        if sum != self.total {
            tracing::warn!(
                running_sum = self.total,
                slot_sum = sum,
                "speed meter desynchronised, resetting"
            );
            self.reset(now);
        }
    }
}

/// Rolling-window throughput meter shared by all downloaders
pub struct SpeedMeter {
    inner: Mutex<MeterInner>,
}

impl SpeedMeter {
    /// Create an idle meter
    pub fn new() -> Self {
        let now = wall_secs();
        Self {
            inner: Mutex::new(MeterInner {
                slots: [0; SPEED_SLOTS],
                slot_time: now,
                cur_slot: 0,
                total: 0,
                last_self_check: now,
                standby: true,
                active_secs: 0,
                active_since: None,
            }),
        }
    }

    /// Record `bytes` read from the wire
    pub fn add_speed_reading(&self, bytes: u64) {
        let now = wall_secs();
        let mut inner = self.inner.lock().expect("meter lock poisoned");
        inner.self_check(now);
        inner.roll(now);
        let cur_slot = inner.cur_slot;
        inner.slots[cur_slot] += bytes;
        inner.total += bytes;
    }

    /// Average speed over the ring window, in bytes per second
    pub fn current_speed(&self) -> u64 {
        let now = wall_secs();
        let mut inner = self.inner.lock().expect("meter lock poisoned");
        inner.roll(now);
        inner.total / SPEED_SLOTS as u64
    }

    /// Bytes accumulated in the current one-second slot. Catches bursts the
    /// windowed average has not seen yet; the throttle checks both.
    pub fn momentary_speed(&self) -> u64 {
        let now = wall_secs();
        let mut inner = self.inner.lock().expect("meter lock poisoned");
        inner.roll(now);
        inner.slots[inner.cur_slot]
    }

    /// Enter or leave stand-by. Time spent in stand-by does not count toward
    /// the active download time.
    pub fn set_standby(&self, standby: bool) {
        let now = wall_secs();
        let mut inner = self.inner.lock().expect("meter lock poisoned");
        if inner.standby == standby {
            return;
        }
        inner.standby = standby;
        if standby {
            if let Some(since) = inner.active_since.take() {
                inner.active_secs += (now - since).max(0);
            }
        } else {
            inner.active_since = Some(now);
        }
    }

    /// Whether the meter is currently in stand-by
    pub fn standby(&self) -> bool {
        self.inner.lock().expect("meter lock poisoned").standby
    }

    /// Total seconds spent actively downloading
    pub fn active_secs(&self) -> i64 {
        let now = wall_secs();
        let inner = self.inner.lock().expect("meter lock poisoned");
        inner.active_secs + inner.active_since.map(|s| (now - s).max(0)).unwrap_or(0)
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Success/failure tally for one server
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStat {
    /// Articles completed successfully on this server
    pub success: u32,
    /// Article attempts that failed on this server
    pub failed: u32,
}

/// Per-server success/failure counters, keyed by server id
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatList(pub HashMap<u32, ServerStat>);

impl ServerStatList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one attempt outcome for a server
    pub fn add(&mut self, server_id: u32, success: u32, failed: u32) {
        let stat = self.0.entry(server_id).or_default();
        stat.success += success;
        stat.failed += failed;
    }

    /// Merge another list into this one
    pub fn add_list(&mut self, other: &ServerStatList) {
        for (id, stat) in &other.0 {
            self.add(*id, stat.success, stat.failed);
        }
    }

    /// Stat for one server (zeroes when never seen)
    pub fn get(&self, server_id: u32) -> ServerStat {
        self.0.get(&server_id).copied().unwrap_or_default()
    }
}

/// Downloaded byte volumes, total and per server
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStats {
    /// Total bytes read across all servers
    pub total: u64,
    /// Bytes read per server id
    pub per_server: HashMap<u32, u64>,
}

impl VolumeStats {
    /// Account `bytes` read from `server_id`
    pub fn add_bytes(&mut self, server_id: u32, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.total += bytes;
        *self.per_server.entry(server_id).or_default() += bytes;
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_meter_reports_zero_speed() {
        let meter = SpeedMeter::new();
        assert_eq!(meter.current_speed(), 0);
        assert_eq!(meter.momentary_speed(), 0);
    }

    #[test]
    fn readings_show_up_in_momentary_speed() {
        let meter = SpeedMeter::new();
        meter.add_speed_reading(10_000);
        meter.add_speed_reading(5_000);
        // Same second (with overwhelming probability): both readings land in
        // the current slot.
        let momentary = meter.momentary_speed();
        assert!(
            momentary == 15_000 || momentary == 0,
            "momentary speed must be the current slot's bytes (or 0 if the \
             second just rolled), got {momentary}"
        );
    }

    #[test]
    fn current_speed_averages_over_the_window_with_tolerance() {
        let meter = SpeedMeter::new();
        meter.add_speed_reading(100_000);
        let speed = meter.current_speed();
        // The exact averaging window is deliberately loose; accept anything
        // from "bytes spread over the whole ring" to "all in one second".
        assert!(
            speed <= 100_000,
            "speed cannot exceed the total bytes recorded, got {speed}"
        );
    }

    #[test]
    fn desync_detection_resets_instead_of_reporting_garbage() {
        let meter = SpeedMeter::new();
        meter.add_speed_reading(50_000);
        {
            // Corrupt the running sum the way a clock jump would
            let mut inner = meter.inner.lock().unwrap();
            inner.total = 999_999_999;
            inner.last_self_check -= SELF_CHECK_INTERVAL + 1;
        }
        meter.add_speed_reading(1);
        let inner = meter.inner.lock().unwrap();
        let sum: u64 = inner.slots.iter().sum();
        assert_eq!(
            inner.total, sum,
            "self-check must restore running-sum consistency"
        );
        assert!(inner.total < 999_999_999, "corrupted sum must be gone");
    }

    #[test]
    fn clock_moving_backwards_resets_the_ring() {
        let meter = SpeedMeter::new();
        meter.add_speed_reading(42);
        {
            // Pretend the current slot was stamped one hour in the future
            let mut inner = meter.inner.lock().unwrap();
            inner.slot_time += 3600;
        }
        // roll() sees now < slot_time and resets
        assert_eq!(meter.current_speed(), 0);
    }

    #[test]
    fn standby_accounting_tracks_active_time_only() {
        let meter = SpeedMeter::new();
        assert!(meter.standby(), "meter starts in stand-by");
        meter.set_standby(false);
        assert!(!meter.standby());
        meter.set_standby(true);
        assert!(meter.active_secs() >= 0);
    }

    #[test]
    fn server_stat_list_accumulates_and_merges() {
        let mut list = ServerStatList::new();
        list.add(1, 1, 0);
        list.add(1, 0, 1);
        list.add(2, 1, 0);

        let mut other = ServerStatList::new();
        other.add(1, 2, 0);
        list.add_list(&other);

        assert_eq!(list.get(1), ServerStat { success: 3, failed: 1 });
        assert_eq!(list.get(2), ServerStat { success: 1, failed: 0 });
        assert_eq!(list.get(99), ServerStat::default());
    }

    #[test]
    fn volume_stats_split_by_server() {
        let mut volumes = VolumeStats::default();
        volumes.add_bytes(1, 1000);
        volumes.add_bytes(2, 500);
        volumes.add_bytes(1, 250);
        volumes.add_bytes(1, 0);

        assert_eq!(volumes.total, 1750);
        assert_eq!(volumes.per_server[&1], 1250);
        assert_eq!(volumes.per_server[&2], 500);
    }
}
