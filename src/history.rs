//! Append-only, size-bounded measurement history.
//!
//! The history is a single JSON document:
//!
//! ```json
//! {"metadata": {"current_cycle_id": "...", "last_updated": "...", "schema_version": "2.0"},
//!  "tests": [{"cycle_id": "...", "server": "1.1.1.1", "domain": "example.com",
//!             "response_time_ms": 42.3, "status": "success"}]}
//! ```
//!
//! Records are appended once per cycle. The size cap is checked separately,
//! once per cycle, by [`HistoryStore::rotate_if_oversized`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::HistoryConfig;
use crate::store::{self, DocumentLock, StoreError};

pub const SCHEMA_VERSION: &str = "2.0";

/// Latency recorded for a measurement that produced no timing.
pub const FAILED_RESPONSE_TIME_MS: f64 = -1.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementStatus {
    Success,
    Failed,
}

/// One timed query. Never modified after it is written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeasurementRecord {
    pub cycle_id: DateTime<Utc>,
    pub server: String,
    pub domain: String,
    #[serde(alias = "response_time")]
    pub response_time_ms: f64,
    pub status: MeasurementStatus,
}

impl MeasurementRecord {
    pub fn success(cycle_id: DateTime<Utc>, server: &str, domain: &str, ms: f64) -> Self {
        Self {
            cycle_id,
            server: server.to_string(),
            domain: domain.to_string(),
            response_time_ms: ms,
            status: MeasurementStatus::Success,
        }
    }

    pub fn failed(cycle_id: DateTime<Utc>, server: &str, domain: &str) -> Self {
        Self {
            cycle_id,
            server: server.to_string(),
            domain: domain.to_string(),
            response_time_ms: FAILED_RESPONSE_TIME_MS,
            status: MeasurementStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleMetadata {
    pub current_cycle_id: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub schema_version: String,
}

impl Default for CycleMetadata {
    fn default() -> Self {
        Self {
            current_cycle_id: None,
            last_updated: None,
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HistoryDocument {
    #[serde(default)]
    pub metadata: CycleMetadata,
    #[serde(default)]
    pub tests: Vec<MeasurementRecord>,
}

impl HistoryDocument {
    /// Records belonging to the cycle named in the metadata.
    pub fn current_cycle(&self) -> Vec<&MeasurementRecord> {
        match self.metadata.current_cycle_id {
            Some(id) => self.tests.iter().filter(|r| r.cycle_id == id).collect(),
            None => Vec::new(),
        }
    }
}

/// Outcome of a rotation that actually trimmed the document.
#[derive(Debug, Clone, PartialEq)]
pub struct RotationReport {
    pub size_before: u64,
    pub records_before: usize,
    pub records_kept: usize,
}

/// The on-disk measurement history.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
    limits: HistoryConfig,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>, limits: HistoryConfig) -> Self {
        Self {
            path: path.into(),
            limits,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes an empty document if none exists yet.
    pub fn initialize(&self) -> Result<bool, StoreError> {
        let _lock = DocumentLock::acquire(&self.path)?;
        if self.path.exists() {
            return Ok(false);
        }
        store::write_json_atomic(&self.path, &HistoryDocument::default())?;
        Ok(true)
    }

    /// Reads the document without locking. A missing file reads as empty.
    pub fn load(&self) -> Result<HistoryDocument, StoreError> {
        Ok(store::read_json(&self.path)?.unwrap_or_default())
    }

    /// Appends one cycle's records and points the metadata at that cycle.
    pub fn append(
        &self,
        records: &[MeasurementRecord],
        cycle_id: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let _lock = DocumentLock::acquire(&self.path)?;
        let mut doc = self.load_for_write()?;

        doc.metadata.current_cycle_id = Some(cycle_id);
        doc.metadata.last_updated = Some(now);
        doc.tests.extend_from_slice(records);

        store::write_json_atomic(&self.path, &doc)
    }

    /// Trims the oldest records if the document is above the size cap.
    ///
    /// The number of records kept is `target_bytes / current_size` of the
    /// current count, but never less than `min_records` (or everything, if
    /// there are fewer than that).
    pub fn rotate_if_oversized(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<RotationReport>, StoreError> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };
        if size <= self.limits.max_bytes {
            return Ok(None);
        }

        info!(
            path = %self.path.display(),
            size,
            max = self.limits.max_bytes,
            "History exceeded size cap, rotating"
        );

        let _lock = DocumentLock::acquire(&self.path)?;
        let mut doc = self.load_for_write()?;
        let records_before = doc.tests.len();
        let keep = records_to_keep(
            records_before,
            size,
            self.limits.target_bytes,
            self.limits.min_records,
        );
        if keep == records_before {
            info!(records_before, "Nothing to trim, the floor covers every record");
            return Ok(None);
        }

        doc.tests.drain(..records_before - keep);
        doc.metadata.last_updated = Some(now);
        store::write_json_atomic(&self.path, &doc)?;

        metrics::counter!("history_rotations_total").increment(1);
        info!(records_before, records_kept = keep, "History rotated");

        Ok(Some(RotationReport {
            size_before: size,
            records_before,
            records_kept: keep,
        }))
    }

    /// Drops every record and the current cycle pointer.
    pub fn reset(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let _lock = DocumentLock::acquire(&self.path)?;
        let doc = HistoryDocument {
            metadata: CycleMetadata {
                last_updated: Some(now),
                ..CycleMetadata::default()
            },
            tests: Vec::new(),
        };
        store::write_json_atomic(&self.path, &doc)?;
        info!(path = %self.path.display(), "History reset");
        Ok(())
    }

    /// Loads the document for a read-modify-write. A malformed document is
    /// replaced rather than blocking every future write.
    fn load_for_write(&self) -> Result<HistoryDocument, StoreError> {
        match store::read_json::<HistoryDocument>(&self.path) {
            Ok(doc) => Ok(doc.unwrap_or_default()),
            Err(StoreError::Malformed { source, .. }) => {
                warn!(
                    path = %self.path.display(),
                    error = %source,
                    "History document is malformed, starting a fresh one"
                );
                Ok(HistoryDocument::default())
            }
            Err(e) => Err(e),
        }
    }
}

fn records_to_keep(count: usize, size: u64, target: u64, min_records: usize) -> usize {
    let ratio = target as f64 / size as f64;
    let proportional = (ratio * count as f64).floor() as usize;
    proportional.max(min_records).min(count)
}
