//! Persistence for per-server statistics and download volumes

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::stats::{ServerStatList, VolumeStats};

use super::atomic_write;

const STATS_FILE_NAME: &str = "stats.state";
const SIGNATURE: &str = "nzb-engine server stats";
const FORMAT_VERSION: u32 = 1;

/// Save the per-server tallies and volumes
pub(super) fn save(
    queue_dir: &Path,
    stats: &ServerStatList,
    volumes: &VolumeStats,
) -> Result<()> {
    let mut out = String::new();
    out.push_str(SIGNATURE);
    out.push('\n');
    out.push_str(&format!("version {FORMAT_VERSION}\n"));
    out.push_str(&format!("total {}\n", volumes.total));

    let mut entries: Vec<_> = stats.0.iter().collect();
    entries.sort_by_key(|(id, _)| **id);
    for (server_id, stat) in entries {
        let bytes = volumes.per_server.get(server_id).copied().unwrap_or(0);
        out.push_str(&format!(
            "S\t{server_id}\t{}\t{}\t{bytes}\n",
            stat.success, stat.failed
        ));
    }
    // Servers with volume but no attempt stats yet
    let mut volume_only: Vec<_> = volumes
        .per_server
        .iter()
        .filter(|(id, _)| !stats.0.contains_key(id))
        .collect();
    volume_only.sort_by_key(|(id, _)| **id);
    for (server_id, bytes) in volume_only {
        out.push_str(&format!("S\t{server_id}\t0\t0\t{bytes}\n"));
    }

    atomic_write(&queue_dir.join(STATS_FILE_NAME), &out)
}

/// Load the tallies saved by a previous session (empty when none exist)
pub(super) fn load(queue_dir: &Path) -> Result<(ServerStatList, VolumeStats)> {
    let path = queue_dir.join(STATS_FILE_NAME);
    if !path.exists() {
        return Ok((ServerStatList::new(), VolumeStats::default()));
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

    let mut stats = ServerStatList::new();
    let mut volumes = VolumeStats::default();
    for line in lines {
        if let Some(total) = line.strip_prefix("total ") {
            volumes.total = total.parse().unwrap_or(0);
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields[0] == "S" && fields.len() >= 5 {
            if let (Ok(id), Ok(success), Ok(failed), Ok(bytes)) = (
                fields[1].parse::<u32>(),
                fields[2].parse(),
                fields[3].parse(),
                fields[4].parse::<u64>(),
            ) {
                if success > 0 || failed > 0 {
                    stats.add(id, success, failed);
                }
                if bytes > 0 {
                    volumes.per_server.insert(id, bytes);
                }
            }
        }
    }
    Ok((stats, volumes))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut stats = ServerStatList::new();
        stats.add(1, 10, 2);
        stats.add(3, 0, 7);
        let mut volumes = VolumeStats::default();
        volumes.add_bytes(1, 5000);
        volumes.add_bytes(9, 123); // volume without stats

        save(dir.path(), &stats, &volumes).unwrap();
        let (loaded_stats, loaded_volumes) = load(dir.path()).unwrap();

        assert_eq!(loaded_stats.get(1).success, 10);
        assert_eq!(loaded_stats.get(3).failed, 7);
        assert_eq!(loaded_volumes.total, 5123);
        assert_eq!(loaded_volumes.per_server[&1], 5000);
        assert_eq!(loaded_volumes.per_server[&9], 123);
    }

    #[test]
    fn missing_stats_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (stats, volumes) = load(dir.path()).unwrap();
        assert!(stats.0.is_empty());
        assert_eq!(volumes.total, 0);
    }
}
