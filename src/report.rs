//! Read-only views over the daemon's documents.
//!
//! These readers never lock and tolerate documents that are missing or not
//! yet written; they show what is there.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::config::Paths;
use crate::control::{daemon_status, DaemonStatus};
use crate::history::{HistoryDocument, MeasurementRecord, MeasurementStatus};
use crate::slow_query::SlowQueryEntry;
use crate::store;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusReport {
    pub daemon: DaemonStatus,
    pub current_cycle_id: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    /// Oldest measurement still in the history, i.e. when counting started.
    pub reset_date: Option<DateTime<Utc>>,
    pub total_records: usize,
    pub current_cycle: Vec<MeasurementRecord>,
    pub servers: Vec<ServerStats>,
    /// Tail of the diagnostic log, oldest line first.
    pub recent_logs: Vec<String>,
}

/// Latency figures for one server. Failed measurements are left out.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServerStats {
    pub server: String,
    pub average_ms: Option<f64>,
    pub count: usize,
    pub last_run_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServerSlowCount {
    pub server: String,
    pub count: usize,
}

/// Log lines shown in the status report.
pub const RECENT_LOG_LINES: usize = 10;

pub fn status(paths: &Paths) -> StatusReport {
    let history: HistoryDocument = read_or_default(&paths.history);
    StatusReport {
        daemon: daemon_status(&paths.pid_file),
        current_cycle_id: history.metadata.current_cycle_id,
        last_updated: history
            .metadata
            .last_updated
            .or_else(|| history.tests.last().map(|r| r.cycle_id)),
        reset_date: history.tests.first().map(|r| r.cycle_id),
        total_records: history.tests.len(),
        current_cycle: history.current_cycle().into_iter().cloned().collect(),
        servers: server_stats(&history),
        recent_logs: recent_log_lines(&paths.log_file, RECENT_LOG_LINES),
    }
}

/// Per-server averages over the whole history and over the current cycle,
/// ordered by server name.
pub fn server_stats(history: &HistoryDocument) -> Vec<ServerStats> {
    let mut all: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    let mut last: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for record in &history.tests {
        let times = all.entry(record.server.as_str()).or_default();
        if record.status != MeasurementStatus::Success {
            continue;
        }
        times.push(record.response_time_ms);
        if Some(record.cycle_id) == history.metadata.current_cycle_id {
            last.entry(record.server.as_str())
                .or_default()
                .push(record.response_time_ms);
        }
    }

    all.into_iter()
        .map(|(server, times)| ServerStats {
            server: server.to_string(),
            average_ms: mean(&times),
            count: times.len(),
            last_run_ms: last.get(server).and_then(|t| mean(t)),
        })
        .collect()
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let avg = values.iter().sum::<f64>() / values.len() as f64;
    Some((avg * 100.0).round() / 100.0)
}

/// The last `limit` non-empty lines of the log. A missing log reads as empty.
fn recent_log_lines(path: &Path, limit: usize) -> Vec<String> {
    let contents = match fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Log not readable");
            return Vec::new();
        }
    };
    let mut lines: Vec<String> = contents
        .lines()
        .rev()
        .filter(|line| !line.trim().is_empty())
        .take(limit)
        .map(str::to_string)
        .collect();
    lines.reverse();
    lines
}

/// Slow-query counts per server, most frequent first.
pub fn slow_query_summary(path: &Path) -> Vec<ServerSlowCount> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for entry in read_slow_queries(path) {
        *counts.entry(entry.server).or_default() += 1;
    }
    let mut summary: Vec<_> = counts
        .into_iter()
        .map(|(server, count)| ServerSlowCount { server, count })
        .collect();
    // BTreeMap order already breaks ties by name; the sort is stable.
    summary.sort_by(|a, b| b.count.cmp(&a.count));
    summary
}

/// One server's slow queries, newest first.
pub fn slow_queries_for(path: &Path, server: &str) -> Vec<SlowQueryEntry> {
    let mut entries: Vec<_> = read_slow_queries(path)
        .into_iter()
        .filter(|e| e.server == server)
        .collect();
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    entries
}

fn read_slow_queries(path: &Path) -> Vec<SlowQueryEntry> {
    read_or_default::<crate::slow_query::SlowQueryDocument>(path).queries
}

fn read_or_default<T: serde::de::DeserializeOwned + Default>(path: &Path) -> T {
    match store::read_json(path) {
        Ok(doc) => doc.unwrap_or_default(),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Document not readable yet");
            T::default()
        }
    }
}
