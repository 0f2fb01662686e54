//! Log of measurements slower than the configured threshold.
//!
//! Unlike the history, this log is bounded by age: every write first drops
//! entries older than the retention window measured from the write time.
//! There is no background sweep, so an expired entry only disappears on the
//! next write.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::config::SlowQueryConfig;
use crate::store::{self, DocumentLock, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlowQueryEntry {
    pub timestamp: DateTime<Utc>,
    pub server: String,
    pub domain: String,
    #[serde(alias = "response_time")]
    pub response_time_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SlowQueryDocument {
    #[serde(default)]
    pub queries: Vec<SlowQueryEntry>,
}

#[derive(Debug, Clone)]
pub struct SlowQueryLog {
    path: PathBuf,
    threshold_ms: f64,
    retention: Duration,
}

impl SlowQueryLog {
    pub fn new(path: impl Into<PathBuf>, config: &SlowQueryConfig) -> Self {
        Self {
            path: path.into(),
            threshold_ms: config.threshold_ms,
            retention: Duration::days(config.retention_days),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a latency qualifies for the log. Failed measurements
    /// (negative sentinel) never do.
    pub fn is_slow(&self, response_time_ms: f64) -> bool {
        response_time_ms > self.threshold_ms
    }

    /// Evicts expired entries, then appends `entry`.
    pub fn record(&self, entry: SlowQueryEntry, now: DateTime<Utc>) -> Result<(), StoreError> {
        let _lock = DocumentLock::acquire(&self.path)?;
        let mut doc = self.load_lenient();

        let cutoff = now - self.retention;
        doc.queries.retain(|q| q.timestamp >= cutoff);
        doc.queries.push(entry);

        store::write_json_atomic(&self.path, &doc)
    }

    /// Reads the log; a missing or unreadable document is empty.
    pub fn load_lenient(&self) -> SlowQueryDocument {
        match store::read_json(&self.path) {
            Ok(doc) => doc.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Slow query log unreadable, treating as empty");
                SlowQueryDocument::default()
            }
        }
    }
}
