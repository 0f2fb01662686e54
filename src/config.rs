//! Configuration management for dnsmon
//!
//! This module defines the main `Config` struct and its sub-structs,
//! responsible for holding the daemon's own settings. It uses the `figment`
//! crate to layer a `dnsmon.toml` file, environment variables and command
//! line arguments over built-in defaults.
//!
//! The list of resolvers and domains under test is *not* part of this
//! configuration; it lives in the JSON watch list document (see
//! [`crate::watchlist`]) so it can be edited while the daemon runs.

use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cli::Cli;

/// Default configuration file looked up when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "dnsmon.toml";

const WATCH_LIST_FILE: &str = "dns_config.json";
const HISTORY_FILE: &str = "dns_performance.json";
const SLOW_QUERY_FILE: &str = "slow_queries.json";
const PID_FILE: &str = "dns-daemon.pid";
const LOG_FILE: &str = "dns-daemon.log";

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// Directory holding every file the daemon reads or writes.
    pub data_dir: PathBuf,
    /// The logging level for the application.
    pub log_level: String,
    /// Measurement cadence.
    pub scheduler: SchedulerConfig,
    /// How individual queries are issued.
    pub probe: ProbeConfig,
    /// Size bounds of the measurement history.
    pub history: HistoryConfig,
    /// Threshold and retention of the slow-query log.
    pub slow_queries: SlowQueryConfig,
    /// Bounds of the diagnostic log file.
    pub log: LogConfig,
    /// Settings used when talking to a running daemon.
    pub control: ControlConfig,
}

/// Measurement cadence.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Minimum time between the starts of two scheduled cycles.
    pub interval_seconds: u64,
    /// Idle sleep between loop iterations.
    pub tick_millis: u64,
}

/// Configuration for the measurement probe.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ProbeConfig {
    /// Path or name of the `dig` executable.
    pub dig_path: PathBuf,
    /// Per-query timeout handed to `dig` and to the library fallback.
    pub timeout_seconds: u64,
    /// Number of UDP tries handed to `dig`.
    pub tries: u32,
    /// Retry a failed `dig` query once through the in-process resolver.
    pub library_fallback: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct HistoryConfig {
    /// Hard cap on the history document size in bytes.
    pub max_bytes: u64,
    /// Size the rotation aims for once the cap is exceeded.
    pub target_bytes: u64,
    /// Rotation never keeps fewer records than this.
    pub min_records: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SlowQueryConfig {
    /// Measurements strictly slower than this are logged.
    pub threshold_ms: f64,
    /// Entries older than this are evicted on every write.
    pub retention_days: i64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LogConfig {
    /// Size at which the diagnostic log gets trimmed.
    pub max_bytes: u64,
    /// Size the diagnostic log is trimmed down to.
    pub trim_to_bytes: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ControlConfig {
    /// Process name matched by the fallback process-table scan.
    pub process_name: String,
}

/// Resolved locations of the daemon's files.
#[derive(Debug, Clone, PartialEq)]
pub struct Paths {
    pub data_dir: PathBuf,
    pub watch_list: PathBuf,
    pub history: PathBuf,
    pub slow_queries: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
}

impl Paths {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        Self {
            watch_list: data_dir.join(WATCH_LIST_FILE),
            history: data_dir.join(HISTORY_FILE),
            slow_queries: data_dir.join(SLOW_QUERY_FILE),
            pid_file: data_dir.join(PID_FILE),
            log_file: data_dir.join(LOG_FILE),
            data_dir,
        }
    }
}

impl Config {
    /// Loads the application configuration.
    ///
    /// Sources are layered lowest to highest: built-in defaults, the TOML
    /// file (`--config` or `dnsmon.toml`, both optional), `DNSMON_*`
    /// environment variables (nested keys separated by `__`), and finally
    /// the command line.
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            // e.g. DNSMON_SCHEDULER__INTERVAL_SECONDS=30
            .merge(Env::prefixed("DNSMON_").split("__"))
            .merge(cli)
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.interval_seconds == 0 {
            anyhow::bail!("scheduler.interval_seconds must be greater than zero");
        }
        if self.scheduler.tick_millis == 0 {
            anyhow::bail!("scheduler.tick_millis must be greater than zero");
        }
        if self.history.target_bytes == 0 || self.history.target_bytes > self.history.max_bytes {
            anyhow::bail!("history.target_bytes must be in 1..=history.max_bytes");
        }
        if self.log.trim_to_bytes > self.log.max_bytes {
            anyhow::bail!("log.trim_to_bytes must not exceed log.max_bytes");
        }
        if self.slow_queries.retention_days <= 0 {
            anyhow::bail!("slow_queries.retention_days must be positive");
        }
        Ok(())
    }

    pub fn paths(&self) -> Paths {
        Paths::new(&self.data_dir)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            log_level: "info".to_string(),
            scheduler: SchedulerConfig {
                interval_seconds: 60,
                tick_millis: 1000,
            },
            probe: ProbeConfig {
                dig_path: PathBuf::from("dig"),
                timeout_seconds: 5,
                tries: 1,
                library_fallback: true,
            },
            history: HistoryConfig {
                max_bytes: 10 * 1024 * 1024,
                target_bytes: 8 * 1024 * 1024,
                min_records: 1000,
            },
            slow_queries: SlowQueryConfig {
                threshold_ms: 1000.0,
                retention_days: 30,
            },
            log: LogConfig {
                max_bytes: 1024 * 1024,
                trim_to_bytes: 900 * 1024,
            },
            control: ControlConfig {
                process_name: "dnsmon".to_string(),
            },
        }
    }
}
