//! Talking to a running daemon from another process.
//!
//! The identity file is the primary way to find the daemon, and it only
//! counts while the daemon holds its lock. Scanning the process table by
//! name is a degraded fallback for when the file is missing or abandoned;
//! it may pick the wrong process if several share the name, so callers are
//! told which lookup was used.

use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::Serialize;
use std::path::Path;
use sysinfo::System;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::lease::{self, Identity};
use crate::signals::ControlIntent;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("no running daemon found")]
    NotRunning,

    #[error("failed to signal pid {pid}: {errno}")]
    Signal { pid: i32, errno: nix::errno::Errno },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "pid", rename_all = "snake_case")]
pub enum DaemonStatus {
    Running(i32),
    /// The lock is held but the pid has not been written yet.
    Starting,
    /// Nobody held the file; it has been removed.
    Stale(i32),
    /// Nobody held the file and it had no pid; it has been removed.
    Invalid,
    Stopped,
}

impl DaemonStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running(_) | Self::Starting)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lookup {
    IdentityFile,
    ProcessScan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub pid: i32,
    pub lookup: Lookup,
}

/// Inspects the identity file, removing it if no daemon holds it.
pub fn daemon_status(pid_file: &Path) -> DaemonStatus {
    match lease::inspect(pid_file) {
        Ok(Identity::Absent) => DaemonStatus::Stopped,
        Ok(Identity::Held(Some(pid))) => DaemonStatus::Running(pid),
        Ok(Identity::Held(None)) => DaemonStatus::Starting,
        Ok(Identity::Abandoned(Some(pid))) => DaemonStatus::Stale(pid),
        Ok(Identity::Abandoned(None)) => DaemonStatus::Invalid,
        Err(e) => {
            warn!(path = %pid_file.display(), error = %e, "Identity file unreadable");
            DaemonStatus::Stopped
        }
    }
}

/// Sends the signal for `intent` to the daemon.
pub fn deliver(
    intent: ControlIntent,
    pid_file: &Path,
    process_name: &str,
) -> Result<Delivery, ControlError> {
    let delivery = match daemon_status(pid_file) {
        DaemonStatus::Running(pid) => Delivery {
            pid,
            lookup: Lookup::IdentityFile,
        },
        status => {
            debug!(?status, "Identity file unusable, scanning process table");
            let pid = scan_for_process(process_name).ok_or(ControlError::NotRunning)?;
            warn!(pid, process_name, "Daemon located by process scan");
            Delivery {
                pid,
                lookup: Lookup::ProcessScan,
            }
        }
    };

    kill(Pid::from_raw(delivery.pid), intent.signal()).map_err(|errno| ControlError::Signal {
        pid: delivery.pid,
        errno,
    })?;
    info!(pid = delivery.pid, ?intent, "Signal delivered");
    Ok(delivery)
}

/// First process named `name` other than the caller.
fn scan_for_process(name: &str) -> Option<i32> {
    let own = std::process::id();
    let mut system = System::new();
    system.refresh_processes();
    let mut pids: Vec<u32> = system
        .processes()
        .iter()
        .filter(|(pid, process)| pid.as_u32() != own && process.name() == name)
        .map(|(pid, _)| pid.as_u32())
        .collect();
    pids.sort_unstable();
    pids.first().and_then(|pid| i32::try_from(*pid).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::Lease;
    use nix::fcntl::{Flock, FlockArg};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn missing_file_means_stopped() {
        let dir = tempdir().unwrap();
        assert_eq!(daemon_status(&dir.path().join("d.pid")), DaemonStatus::Stopped);
    }

    #[test]
    fn live_lease_is_running() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.pid");
        let _lease = Lease::acquire(&path).unwrap();
        assert_eq!(
            daemon_status(&path),
            DaemonStatus::Running(std::process::id() as i32)
        );
    }

    #[test]
    fn garbage_file_is_removed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.pid");
        fs::write(&path, "garbage").unwrap();
        assert_eq!(daemon_status(&path), DaemonStatus::Invalid);
        assert!(!path.exists());
    }

    #[test]
    fn dead_pid_is_stale_and_removed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.pid");
        // Spawn and reap a short-lived child so its pid is known dead.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        fs::write(&path, pid.to_string()).unwrap();

        assert_eq!(daemon_status(&path), DaemonStatus::Stale(pid));
        assert!(!path.exists());
    }

    #[test]
    fn reused_pid_in_unlocked_file_is_not_signalled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.pid");
        // An unrelated live process that inherited the crashed daemon's pid.
        let mut stranger = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = stranger.id() as i32;
        fs::write(&path, pid.to_string()).unwrap();

        let result = deliver(ControlIntent::Shutdown, &path, "dnsmon-no-such-process-name");
        assert!(matches!(result, Err(ControlError::NotRunning)));
        assert!(!path.exists());
        assert!(stranger.try_wait().unwrap().is_none());

        stranger.kill().unwrap();
        stranger.wait().unwrap();
    }

    #[test]
    fn daemon_between_lock_and_pid_is_starting() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.pid");
        let file = fs::File::create(&path).unwrap();
        let _held = Flock::lock(file, FlockArg::LockExclusiveNonblock).unwrap();

        let status = daemon_status(&path);
        assert_eq!(status, DaemonStatus::Starting);
        assert!(status.is_running());
        assert!(path.exists());
        assert!(Lease::acquire(&path).is_err());
    }

    #[test]
    fn delivery_without_daemon_fails() {
        let dir = tempdir().unwrap();
        let result = deliver(
            ControlIntent::Reload,
            &dir.path().join("d.pid"),
            "dnsmon-no-such-process-name",
        );
        assert!(matches!(result, Err(ControlError::NotRunning)));
    }

    #[test]
    fn status_serializes_with_tag() {
        let json = serde_json::to_value(DaemonStatus::Running(42)).unwrap();
        assert_eq!(json, serde_json::json!({"status": "running", "pid": 42}));
    }
}
