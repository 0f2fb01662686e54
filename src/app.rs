//! The daemon's startup and shutdown, decoupled from the entry point.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    clock::{Clock, SystemClock},
    config::Config,
    history::HistoryStore,
    lease::{Lease, LeaseError},
    probe::{DigProbe, FallbackProbe, HickoryProbe, Probe},
    scheduler::Scheduler,
    signals::{self, ControlState},
};

/// Result of starting the daemon.
pub enum Launch {
    /// This process owns the lease and is ready to run.
    Ready(App),
    /// Another instance owns the lease. Not an error: exit quietly.
    AlreadyRunning,
}

/// A started daemon: lease held, tool verified, history initialized.
pub struct App {
    scheduler: Scheduler,
    lease: Lease,
    control: Arc<ControlState>,
    signal_listener: Option<JoinHandle<()>>,
}

impl App {
    /// Creates a new `AppBuilder` to construct an `App`.
    pub fn builder(config: Config) -> AppBuilder {
        AppBuilder::new(config)
    }

    /// The shared control flags; tests use this in place of real signals.
    pub fn control(&self) -> Arc<ControlState> {
        self.control.clone()
    }

    pub fn scheduler(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Runs the measurement loop until shutdown, then releases the lease.
    pub async fn run(mut self) -> Result<()> {
        info!(
            "DNS monitoring daemon started (PID: {})",
            std::process::id()
        );
        self.scheduler.run().await;
        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(listener) = self.signal_listener.take() {
            listener.abort();
        }
        self.lease.release();
        self.scheduler.mark_stopped();
        info!("DNS monitoring daemon stopped");
    }
}

/// Builder for the daemon.
///
/// Production code uses the defaults; tests swap in a fake probe, a manual
/// clock and their own control state, and skip installing signal handlers.
pub struct AppBuilder {
    config: Config,
    probe_override: Option<Arc<dyn Probe>>,
    clock_override: Option<Arc<dyn Clock>>,
    control_override: Option<Arc<ControlState>>,
    install_signal_handlers: bool,
}

impl AppBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            probe_override: None,
            clock_override: None,
            control_override: None,
            install_signal_handlers: true,
        }
    }

    pub fn probe_override(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe_override = Some(probe);
        self
    }

    pub fn clock_override(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock_override = Some(clock);
        self
    }

    pub fn control_override(mut self, control: Arc<ControlState>) -> Self {
        self.control_override = Some(control);
        self
    }

    pub fn signal_handlers(mut self, install: bool) -> Self {
        self.install_signal_handlers = install;
        self
    }

    /// Performs the `starting` phase.
    ///
    /// Order matters. Signal handlers go in first, so a control signal sent
    /// as soon as the pid is published never meets the default disposition.
    /// The lease comes next, so a second instance bails out before touching
    /// anything else. Any later failure drops the lease, which removes the
    /// identity file again, and the listener guard, which stops the listener.
    pub async fn build(self) -> Result<Launch> {
        let config = self.config;
        let paths = config.paths();

        std::fs::create_dir_all(&paths.data_dir).with_context(|| {
            format!("cannot create data directory {}", paths.data_dir.display())
        })?;

        let control = self.control_override.unwrap_or_else(ControlState::new);
        let listener = ListenerGuard(if self.install_signal_handlers {
            Some(
                signals::spawn_listener(control.clone())
                    .context("cannot install signal handlers")?,
            )
        } else {
            None
        });

        let lease = match Lease::acquire(&paths.pid_file) {
            Ok(lease) => lease,
            Err(LeaseError::AlreadyRunning(path)) => {
                debug!(path = %path.display(), "Another instance is already running, exiting");
                return Ok(Launch::AlreadyRunning);
            }
            Err(e) => return Err(e).context("cannot acquire the daemon identity file"),
        };
        log_configuration(&config);

        let clock = self
            .clock_override
            .unwrap_or_else(|| Arc::new(SystemClock));
        let probe = self
            .probe_override
            .unwrap_or_else(|| default_probe(&config, clock.clone()));

        probe
            .check_available()
            .await
            .context("required measurement tool is unavailable")?;

        let history = HistoryStore::new(&paths.history, config.history.clone());
        if history
            .initialize()
            .context("cannot initialize the history document")?
        {
            info!(path = %paths.history.display(), "Initialized empty history");
        }

        let mut scheduler = Scheduler::new(&config, probe, clock, control.clone());
        match history.load() {
            Ok(doc) => {
                if let Some(id) = doc.metadata.current_cycle_id {
                    scheduler.resume_after(id);
                }
            }
            Err(e) => warn!(error = %e, "Could not read previous cycle id"),
        }

        Ok(Launch::Ready(App {
            scheduler,
            lease,
            control,
            signal_listener: listener.into_inner(),
        }))
    }
}

/// Stops the signal listener unless startup got as far as handing it over.
struct ListenerGuard(Option<JoinHandle<()>>);

impl ListenerGuard {
    fn into_inner(mut self) -> Option<JoinHandle<()>> {
        self.0.take()
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(listener) = self.0.take() {
            listener.abort();
        }
    }
}

fn log_configuration(config: &Config) {
    info!("-------------------- Configuration --------------------");
    info!("Data Directory: {}", config.data_dir.display());
    info!("Log Level: {}", config.log_level);
    info!("Cycle Interval: {}s", config.scheduler.interval_seconds);
    info!("Dig Path: {}", config.probe.dig_path.display());
    info!("Query Timeout: {}s", config.probe.timeout_seconds);
    info!(
        "Library Fallback: {}",
        if config.probe.library_fallback {
            "Enabled"
        } else {
            "Disabled"
        }
    );
    info!("Slow Query Threshold: {}ms", config.slow_queries.threshold_ms);
    info!(
        "History Cap: {} bytes (min {} records)",
        config.history.max_bytes, config.history.min_records
    );
    info!("-------------------------------------------------------");
}

/// `dig`, optionally backed by the in-process resolver.
fn default_probe(config: &Config, clock: Arc<dyn Clock>) -> Arc<dyn Probe> {
    let dig: Arc<dyn Probe> = Arc::new(DigProbe::new(&config.probe, clock.clone()));
    if config.probe.library_fallback {
        Arc::new(FallbackProbe::new(
            dig,
            Arc::new(HickoryProbe::new(&config.probe, clock)),
        ))
    } else {
        dig
    }
}
