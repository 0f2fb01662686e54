#![allow(dead_code)]
//! Test helpers for running the daemon against a temporary data directory,
//! a fake probe and a manually driven clock.

use chrono::{DateTime, TimeZone, Utc};
use dnsmon::{
    app::{App, Launch},
    clock::ManualClock,
    config::{Config, Paths},
    probe::test_utils::FakeProbe,
    signals::ControlState,
    watchlist::WatchList,
};
use std::sync::Arc;
use tempfile::TempDir;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// Everything a daemon test needs, kept alive together.
pub struct TestEnv {
    pub dir: TempDir,
    pub config: Config,
    pub probe: Arc<FakeProbe>,
    pub clock: Arc<ManualClock>,
    pub control: Arc<ControlState>,
}

impl TestEnv {
    pub fn new(probe: FakeProbe) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config.scheduler.tick_millis = 10;
        Self {
            dir,
            config,
            probe: Arc::new(probe),
            clock: Arc::new(ManualClock::new(start_time())),
            control: ControlState::new(),
        }
    }

    pub fn paths(&self) -> Paths {
        self.config.paths()
    }

    pub fn write_watch_list(&self, servers: &[&str], domains: &[&str]) {
        WatchList::new(servers.iter().copied(), domains.iter().copied())
            .save(&self.paths().watch_list)
            .unwrap();
    }

    pub async fn launch(&self) -> anyhow::Result<Launch> {
        App::builder(self.config.clone())
            .probe_override(self.probe.clone())
            .clock_override(self.clock.clone())
            .control_override(self.control.clone())
            .signal_handlers(false)
            .build()
            .await
    }

    /// Builds the app, failing the test if it did not start.
    pub async fn app(&self) -> App {
        match self.launch().await.unwrap() {
            Launch::Ready(app) => app,
            Launch::AlreadyRunning => panic!("lease unexpectedly held"),
        }
    }
}
