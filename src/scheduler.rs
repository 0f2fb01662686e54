//! The measurement loop.
//!
//! ```text
//! starting -> idle-wait <-> running-cycle
//!                 |
//!                 v
//!             stopping -> stopped
//! ```
//!
//! Each iteration takes one control snapshot, then decides. A cycle, once
//! started, always runs to completion; shutdown is only noticed between
//! iterations.

use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::history::{HistoryStore, MeasurementRecord, MeasurementStatus, RotationReport};
use crate::probe::Probe;
use crate::signals::ControlState;
use crate::slow_query::{SlowQueryEntry, SlowQueryLog};
use crate::watchlist::WatchList;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Starting,
    IdleWait,
    RunningCycle,
    Stopping,
    Stopped,
}

/// What one loop iteration did.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Nothing was due.
    Idle,
    /// A cycle was due but the watch list has no pairs.
    Skipped,
    Cycle(CycleReport),
    /// Shutdown was requested.
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle_id: DateTime<Utc>,
    pub records: Vec<MeasurementRecord>,
    pub slow_queries: usize,
    /// Whether the records reached the history document.
    pub persisted: bool,
    pub rotation: Option<RotationReport>,
}

pub struct Scheduler {
    probe: Arc<dyn Probe>,
    clock: Arc<dyn Clock>,
    control: Arc<ControlState>,
    history: HistoryStore,
    slow_queries: SlowQueryLog,
    watch_list_path: std::path::PathBuf,
    interval: Duration,
    tick: std::time::Duration,
    watch_list: Option<WatchList>,
    last_cycle_start: Option<DateTime<Utc>>,
    last_cycle_id: Option<DateTime<Utc>>,
    state: LoopState,
}

impl Scheduler {
    pub fn new(
        config: &Config,
        probe: Arc<dyn Probe>,
        clock: Arc<dyn Clock>,
        control: Arc<ControlState>,
    ) -> Self {
        let paths = config.paths();
        Self {
            probe,
            clock,
            control,
            history: HistoryStore::new(paths.history, config.history.clone()),
            slow_queries: SlowQueryLog::new(paths.slow_queries, &config.slow_queries),
            watch_list_path: paths.watch_list,
            interval: Duration::seconds(config.scheduler.interval_seconds as i64),
            tick: std::time::Duration::from_millis(config.scheduler.tick_millis),
            watch_list: None,
            last_cycle_start: None,
            last_cycle_id: None,
            state: LoopState::Starting,
        }
    }

    /// New cycle ids will sort after `cycle_id`.
    pub fn resume_after(&mut self, cycle_id: DateTime<Utc>) {
        self.last_cycle_id = Some(cycle_id);
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn slow_queries(&self) -> &SlowQueryLog {
        &self.slow_queries
    }

    /// Runs until shutdown is requested. Sleeps one tick between
    /// iterations, waking early when an intent arrives.
    pub async fn run(&mut self) {
        self.state = LoopState::IdleWait;
        let control = self.control.clone();
        loop {
            if matches!(self.step().await, Step::Stop) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.tick) => {}
                _ = control.wait_for_intent() => {}
            }
        }
    }

    /// One loop iteration, without the idle sleep.
    pub async fn step(&mut self) -> Step {
        let control = self.control.snapshot();
        if !control.running {
            info!("Received shutdown signal, stopping daemon...");
            self.state = LoopState::Stopping;
            return Step::Stop;
        }
        if control.reload {
            info!("Received config reload signal");
            self.watch_list = None;
        }
        if control.force {
            info!("Received force test signal");
        }

        let freshly_loaded = self.watch_list.is_none();
        let list = match &self.watch_list {
            Some(list) => list.clone(),
            None => {
                let list = WatchList::load(&self.watch_list_path);
                info!(
                    servers = list.servers.len(),
                    domains = list.domains.len(),
                    "Configuration loaded"
                );
                self.watch_list = Some(list.clone());
                list
            }
        };

        let now = self.clock.now();
        let due = control.force
            || self
                .last_cycle_start
                .map_or(true, |last| now - last >= self.interval);
        if !due {
            return Step::Idle;
        }

        if list.is_empty() {
            if freshly_loaded || control.force {
                info!("No DNS servers or domains configured, skipping tests");
            } else {
                debug!("No DNS servers or domains configured, skipping tests");
            }
            return Step::Skipped;
        }

        self.state = LoopState::RunningCycle;
        let report = self.run_cycle(&list).await;
        self.last_cycle_start = Some(now);
        self.state = LoopState::IdleWait;
        Step::Cycle(report)
    }

    /// Marks the loop as finished after the caller released its resources.
    pub fn mark_stopped(&mut self) {
        self.state = LoopState::Stopped;
    }

    #[instrument(skip_all, fields(pairs = list.pair_count()))]
    async fn run_cycle(&mut self, list: &WatchList) -> CycleReport {
        let cycle_id = self.next_cycle_id();
        info!(%cycle_id, "Starting DNS tests...");

        let mut records = Vec::with_capacity(list.pair_count());
        let mut slow_queries = 0;

        for (server, domain) in list.servers.iter().cartesian_product(list.domains.iter()) {
            debug!(server, domain, "Testing pair");
            let record = match self.probe.measure(server, domain).await {
                Ok(ms) => {
                    info!("{server} -> {domain}: {ms}ms");
                    metrics::counter!("dns_probe_total", "status" => "success").increment(1);
                    metrics::histogram!("dns_probe_duration_ms").record(ms);
                    MeasurementRecord::success(cycle_id, server, domain, ms)
                }
                Err(e) => {
                    warn!(error = %e, "{server} -> {domain}: FAILED");
                    metrics::counter!("dns_probe_total", "status" => "failed").increment(1);
                    MeasurementRecord::failed(cycle_id, server, domain)
                }
            };

            if record.status == MeasurementStatus::Success
                && self.slow_queries.is_slow(record.response_time_ms)
            {
                let now = self.clock.now();
                let entry = SlowQueryEntry {
                    timestamp: now,
                    server: server.clone(),
                    domain: domain.clone(),
                    response_time_ms: record.response_time_ms,
                };
                match self.slow_queries.record(entry, now) {
                    Ok(()) => slow_queries += 1,
                    Err(e) => error!(error = %e, server, domain, "Failed to record slow query"),
                }
            }

            records.push(record);
        }

        let persisted = match self.history.append(&records, cycle_id, self.clock.now()) {
            Ok(()) => {
                info!(count = records.len(), %cycle_id, "Stored DNS test results for cycle");
                true
            }
            Err(e) => {
                error!(error = %e, %cycle_id, "Failed to store DNS test results, cycle dropped");
                false
            }
        };

        let rotation = self
            .history
            .rotate_if_oversized(self.clock.now())
            .unwrap_or_else(|e| {
                error!(error = %e, "History rotation failed");
                None
            });

        metrics::counter!("dns_cycles_total").increment(1);
        info!("DNS tests completed");

        CycleReport {
            cycle_id,
            records,
            slow_queries,
            persisted,
            rotation,
        }
    }

    /// The clock's current time, nudged forward if needed so ids strictly
    /// increase even when two cycles start within the clock's resolution.
    fn next_cycle_id(&mut self) -> DateTime<Utc> {
        let now = self.clock.now();
        let id = match self.last_cycle_id {
            Some(previous) if now <= previous => previous + Duration::microseconds(1),
            _ => now,
        };
        self.last_cycle_id = Some(id);
        id
    }
}
