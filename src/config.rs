//! Configuration types for nzb-engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Download behavior configuration (rate, timeouts, retries, decoding)
///
/// Groups settings that drive the coordinator loop and the per-article
/// downloader state machine. Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Download rate ceiling in bytes per second (None = unlimited)
    #[serde(default)]
    pub download_rate: Option<u64>,

    /// Seconds without progress before a downloader is stopped (default: 30)
    #[serde(default = "default_article_timeout")]
    pub article_timeout_secs: u64,

    /// Seconds without progress before a downloader is force-terminated
    /// and its article reset to Undefined (default: 600)
    #[serde(default = "default_terminate_timeout")]
    pub terminate_timeout_secs: u64,

    /// Socket connect/read timeout in seconds (default: 60)
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Retry budget per server for generic failures (default: 3, minimum 1)
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Seconds a server stays blocked after a connect error (default: 10)
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    /// Verify decoded article CRC32 against the yEnc trailer (default: true)
    #[serde(default = "default_true")]
    pub crc_check: bool,

    /// Decode article bodies (yEnc/UU); raw passthrough when false (default: true)
    #[serde(default = "default_true")]
    pub decode: bool,

    /// Write decoded segments directly into a sparse output file instead of
    /// per-article temp fragments (default: true)
    #[serde(default = "default_true")]
    pub direct_write: bool,

    /// Persist and restore per-article progress across restarts (default: true)
    #[serde(default = "default_true")]
    pub continue_partial: bool,

    /// Detect duplicate NZBs by content hash and dupe key (default: true)
    #[serde(default = "default_true")]
    pub dupe_check: bool,

    /// Account raw socket bytes to per-server volumes on every read rather
    /// than per article (default: false)
    #[serde(default)]
    pub accurate_rate: bool,

    /// Seconds to wait after an article's posting time before scheduling it,
    /// giving slow news servers time to propagate (default: 0)
    #[serde(default)]
    pub propagation_delay_secs: u64,

    /// What to do when an NZB's health falls below critical health
    #[serde(default)]
    pub health_check: HealthCheckAction,

    /// Maximum number of concurrent article downloaders, 0 = derive from
    /// server connection counts (default: 0)
    #[serde(default)]
    pub thread_limit: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_rate: None,
            article_timeout_secs: default_article_timeout(),
            terminate_timeout_secs: default_terminate_timeout(),
            connection_timeout_secs: default_connection_timeout(),
            retries: default_retries(),
            retry_interval_secs: default_retry_interval(),
            crc_check: true,
            decode: true,
            direct_write: true,
            continue_partial: true,
            dupe_check: true,
            accurate_rate: false,
            propagation_delay_secs: 0,
            health_check: HealthCheckAction::default(),
            thread_limit: 0,
        }
    }
}

impl DownloadConfig {
    /// Article timeout as a [`Duration`]
    pub fn article_timeout(&self) -> Duration {
        Duration::from_secs(self.article_timeout_secs)
    }

    /// Terminate timeout as a [`Duration`]
    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }

    /// Connection timeout as a [`Duration`]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

/// Policy applied when health drops below critical health
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckAction {
    /// Keep downloading regardless
    #[default]
    None,
    /// Pause the NZB
    Pause,
    /// Delete the NZB (moved to history with delete-status Health)
    Delete,
}

/// Parchive scan depth
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParScan {
    /// Scan only files matched by the par set
    Limited,
    /// Scan every file in the destination
    Full,
    /// Start limited, extend to full when verification fails
    #[default]
    Auto,
}

/// When Parchive verification runs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParCheck {
    /// Only when requested by the user
    Manual,
    /// Automatically when articles failed
    #[default]
    Auto,
    /// Always, even for healthy downloads
    Force,
}

/// Parchive driver configuration (the verifier itself is an external seam)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParConfig {
    /// Scan depth
    #[serde(default)]
    pub par_scan: ParScan,

    /// When verification runs
    #[serde(default)]
    pub par_check: ParCheck,

    /// Whether repair is attempted after a failed verification (default: true)
    #[serde(default = "default_true")]
    pub par_repair: bool,

    /// Abort repair when the estimated time exceeds this many seconds,
    /// 0 = no limit (default: 0)
    #[serde(default)]
    pub par_time_limit_secs: u64,
}

impl Default for ParConfig {
    fn default() -> Self {
        Self {
            par_scan: ParScan::default(),
            par_check: ParCheck::default(),
            par_repair: true,
            par_time_limit_secs: 0,
        }
    }
}

/// Filesystem locations used by the engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Destination directory for completed files (default: "./downloads")
    #[serde(default = "default_dest_dir")]
    pub dest_dir: PathBuf,

    /// Temporary directory for article fragments (default: "./temp")
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Queue directory for persistent state (default: "./queue")
    #[serde(default = "default_queue_dir")]
    pub queue_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            dest_dir: default_dest_dir(),
            temp_dir: default_temp_dir(),
            queue_dir: default_queue_dir(),
        }
    }
}

/// One news server definition
///
/// Immutable after configuration apart from the `active` flag, which
/// [`crate::nntp::ServerPool::changed`] re-reads on every reconfiguration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Stable server id; must be unique across the server list
    pub id: u32,

    /// Display name (defaults to host when empty)
    #[serde(default)]
    pub name: String,

    /// Server hostname
    pub host: String,

    /// Server port (typically 119, or 563 for TLS)
    pub port: u16,

    /// Use TLS
    #[serde(default)]
    pub encryption: bool,

    /// Optional TLS cipher preference string
    #[serde(default)]
    pub cipher: Option<String>,

    /// Username for AUTHINFO (None = no authentication)
    #[serde(default)]
    pub username: Option<String>,

    /// Password for AUTHINFO
    #[serde(default)]
    pub password: Option<String>,

    /// Maximum parallel connections to this server (default: 4)
    #[serde(default = "default_connections")]
    pub connections: u32,

    /// Failover level: 0 = primary, 1..N = backups (default: 0)
    #[serde(default)]
    pub level: u32,

    /// Co-failover group; servers sharing a non-zero group are blacklisted
    /// together for an article (default: 0 = no group)
    #[serde(default)]
    pub group: u32,

    /// Issue GROUP before ARTICLE (default: false; most providers accept
    /// message-id lookups without a group)
    #[serde(default)]
    pub join_group: bool,

    /// Article retention in days, 0 = unlimited (default: 0)
    #[serde(default)]
    pub retention_days: u32,

    /// Whether this server participates in downloads (default: true)
    #[serde(default = "default_true")]
    pub active: bool,
}

impl ServerConfig {
    /// Display name, falling back to `host:port`
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("{}:{}", self.host, self.port)
        } else {
            self.name.clone()
        }
    }
}

/// Top-level engine configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// News servers, ordered by declaration (ids must be unique)
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Download behavior
    #[serde(default)]
    pub download: DownloadConfig,

    /// Parchive driver settings
    #[serde(default)]
    pub par: ParConfig,

    /// Filesystem locations
    #[serde(default)]
    pub paths: PathsConfig,
}

impl Config {
    /// Validate the configuration, returning the first problem found
    pub fn validate(&self) -> crate::error::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.id) {
                return Err(crate::error::Error::Config {
                    message: format!("duplicate server id {}", server.id),
                    key: Some("servers.id".into()),
                });
            }
            if server.host.is_empty() {
                return Err(crate::error::Error::Config {
                    message: format!("server {} has an empty host", server.id),
                    key: Some("servers.host".into()),
                });
            }
        }
        if self.download.terminate_timeout_secs < self.download.article_timeout_secs {
            return Err(crate::error::Error::Config {
                message: "terminate_timeout must be >= article_timeout".into(),
                key: Some("download.terminate_timeout_secs".into()),
            });
        }
        Ok(())
    }

    /// Concurrent downloader limit: explicit `thread_limit` when set,
    /// otherwise 2 plus the connection count of level-0/1 active servers.
    pub fn downloads_limit(&self) -> usize {
        if self.download.thread_limit > 0 {
            return self.download.thread_limit;
        }
        let connections: u32 = self
            .servers
            .iter()
            .filter(|s| s.active && s.level <= 1)
            .map(|s| s.connections)
            .sum();
        2 + connections as usize
    }
}

fn default_true() -> bool {
    true
}

fn default_article_timeout() -> u64 {
    30
}

fn default_terminate_timeout() -> u64 {
    600
}

fn default_connection_timeout() -> u64 {
    60
}

fn default_retries() -> u32 {
    3
}

fn default_retry_interval() -> u64 {
    10
}

fn default_connections() -> u32 {
    4
}

fn default_dest_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("./temp")
}

fn default_queue_dir() -> PathBuf {
    PathBuf::from("./queue")
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn server(id: u32, level: u32, connections: u32) -> ServerConfig {
        ServerConfig {
            id,
            name: String::new(),
            host: "news.example.com".into(),
            port: 119,
            encryption: false,
            cipher: None,
            username: None,
            password: None,
            connections,
            level,
            group: 0,
            join_group: false,
            retention_days: 0,
            active: true,
        }
    }

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn duplicate_server_ids_are_rejected() {
        let config = Config {
            servers: vec![server(1, 0, 4), server(1, 1, 4)],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(
            err.to_string().contains("duplicate server id"),
            "expected duplicate-id error, got: {err}"
        );
    }

    #[test]
    fn terminate_timeout_below_article_timeout_is_rejected() {
        let config = Config {
            download: DownloadConfig {
                article_timeout_secs: 60,
                terminate_timeout_secs: 30,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn downloads_limit_counts_level_zero_and_one_servers() {
        let config = Config {
            servers: vec![server(1, 0, 8), server(2, 1, 4), server(3, 2, 16)],
            ..Default::default()
        };
        // 2 + 8 + 4; the level-2 backup does not contribute
        assert_eq!(config.downloads_limit(), 14);
    }

    #[test]
    fn downloads_limit_ignores_inactive_servers() {
        let mut inactive = server(2, 0, 20);
        inactive.active = false;
        let config = Config {
            servers: vec![server(1, 0, 8), inactive],
            ..Default::default()
        };
        assert_eq!(config.downloads_limit(), 10);
    }

    #[test]
    fn explicit_thread_limit_overrides_derived_limit() {
        let config = Config {
            servers: vec![server(1, 0, 50)],
            download: DownloadConfig {
                thread_limit: 5,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(config.downloads_limit(), 5);
    }

    #[test]
    fn server_display_name_falls_back_to_host_port() {
        let s = server(1, 0, 4);
        assert_eq!(s.display_name(), "news.example.com:119");
    }

    #[test]
    fn config_deserializes_with_all_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.download.retries, 3);
        assert_eq!(config.download.article_timeout_secs, 30);
        assert_eq!(config.download.terminate_timeout_secs, 600);
        assert!(config.download.crc_check);
        assert!(config.download.direct_write);
        assert_eq!(config.download.health_check, HealthCheckAction::None);
    }
}
