//! Translation of process signals into control intents.
//!
//! | signal            | intent       | effect on [`ControlState`]           |
//! |-------------------|--------------|--------------------------------------|
//! | SIGTERM / SIGINT  | `Shutdown`   | `running = false`                    |
//! | SIGUSR1           | `Reload`     | watch list cache invalidated         |
//! | SIGUSR2           | `ForceCycle` | `force = true`                       |
//!
//! The listener only flips flags. The scheduler takes one
//! [`ControlSnapshot`] per loop iteration and decides on that, so it never
//! acts on a half-updated view.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlIntent {
    Shutdown,
    Reload,
    ForceCycle,
}

impl ControlIntent {
    /// The signal a controlling process sends to express this intent.
    pub fn signal(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            Self::Shutdown => Signal::SIGTERM,
            Self::Reload => Signal::SIGUSR1,
            Self::ForceCycle => Signal::SIGUSR2,
        }
    }
}

/// Flags shared between the signal listener and the scheduler.
#[derive(Debug)]
pub struct ControlState {
    running: AtomicBool,
    force: AtomicBool,
    reload: AtomicBool,
    wake: Notify,
}

/// What the scheduler acts on for one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSnapshot {
    pub running: bool,
    pub force: bool,
    pub reload: bool,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(true),
            force: AtomicBool::new(false),
            reload: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }
}

impl ControlState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records an intent. Never blocks and performs no I/O.
    pub fn apply(&self, intent: ControlIntent) {
        match intent {
            ControlIntent::Shutdown => self.running.store(false, Ordering::SeqCst),
            ControlIntent::Reload => self.reload.store(true, Ordering::SeqCst),
            ControlIntent::ForceCycle => self.force.store(true, Ordering::SeqCst),
        }
        self.wake.notify_one();
    }

    /// Takes the pending intents. `force` and `reload` are consumed, so an
    /// intent arriving while a cycle runs is seen by the next snapshot.
    pub fn snapshot(&self) -> ControlSnapshot {
        ControlSnapshot {
            running: self.running.load(Ordering::SeqCst),
            force: self.force.swap(false, Ordering::SeqCst),
            reload: self.reload.swap(false, Ordering::SeqCst),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Resolves on the next [`apply`](Self::apply), or immediately if one
    /// happened since the last wait.
    pub async fn wait_for_intent(&self) {
        self.wake.notified().await;
    }
}

/// Installs the signal handlers and spawns the listener task.
///
/// Handler registration fails only if the runtime has no signal driver,
/// which the caller treats as a startup failure.
pub fn spawn_listener(state: Arc<ControlState>) -> std::io::Result<JoinHandle<()>> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut reload = signal(SignalKind::user_defined1())?;
    let mut force = signal(SignalKind::user_defined2())?;

    Ok(tokio::spawn(async move {
        loop {
            let intent = tokio::select! {
                Some(()) = terminate.recv() => ControlIntent::Shutdown,
                Some(()) = interrupt.recv() => ControlIntent::Shutdown,
                Some(()) = reload.recv() => ControlIntent::Reload,
                Some(()) = force.recv() => ControlIntent::ForceCycle,
                else => break,
            };
            state.apply(intent);
        }
        debug!("Signal listener finished.");
    }))
}
