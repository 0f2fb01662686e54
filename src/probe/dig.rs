//! Probe that shells out to `dig`.

use async_trait::async_trait;
use regex::Regex;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, trace};

use super::{cache_busted_name, round_ms, Probe, ProbeError};
use crate::clock::Clock;
use crate::config::ProbeConfig;

static QUERY_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r";;\s*Query time:\s*(\d+)\s*msec").expect("valid regex"));

/// Exit statuses after which `dig` has a timing to report. 0 covers every
/// answered query including NXDOMAIN; 1 is accepted as well since some
/// builds use it for negative answers.
const ANSWERED_EXIT_CODES: [i32; 2] = [0, 1];

pub struct DigProbe {
    dig_path: PathBuf,
    timeout_seconds: u64,
    tries: u32,
    clock: Arc<dyn Clock>,
}

impl DigProbe {
    pub fn new(config: &ProbeConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            dig_path: config.dig_path.clone(),
            timeout_seconds: config.timeout_seconds,
            tries: config.tries,
            clock,
        }
    }

    fn command(&self, server: &str, name: &str) -> Command {
        let mut cmd = Command::new(&self.dig_path);
        cmd.arg(format!("@{server}"))
            .arg(name)
            .arg("A")
            .arg(format!("+tries={}", self.tries))
            .arg(format!("+time={}", self.timeout_seconds))
            .arg("+noall")
            .arg("+stats")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Probe for DigProbe {
    async fn measure(&self, server: &str, domain: &str) -> Result<f64, ProbeError> {
        let name = cache_busted_name(self.clock.now(), domain);
        trace!(server, name = %name, "Running dig");

        let start = Instant::now();
        let output = self
            .command(server, &name)
            .output()
            .await
            .map_err(|e| spawn_error(&self.dig_path, e))?;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let stdout = String::from_utf8_lossy(&output.stdout);
        match output.status.code() {
            Some(code) if ANSWERED_EXIT_CODES.contains(&code) => {
                let ms = parse_query_time(&stdout).unwrap_or_else(|| {
                    debug!(server, domain, "dig reported no query time, using wall clock");
                    round_ms(elapsed_ms)
                });
                Ok(ms)
            }
            Some(9) => Err(ProbeError::Timeout(format!("no reply from {server}"))),
            Some(code) => Err(ProbeError::Transport(format!(
                "dig exited with {code}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
            None => Err(ProbeError::Transport("dig terminated by a signal".to_string())),
        }
    }

    async fn check_available(&self) -> Result<(), ProbeError> {
        let status = Command::new(&self.dig_path)
            .arg("-v")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| spawn_error(&self.dig_path, e))?;
        if status.success() {
            Ok(())
        } else {
            Err(ProbeError::ToolMissing(format!(
                "{} -v exited with {status}",
                self.dig_path.display()
            )))
        }
    }
}

fn spawn_error(path: &std::path::Path, e: std::io::Error) -> ProbeError {
    if e.kind() == ErrorKind::NotFound {
        ProbeError::ToolMissing(format!("{} not found", path.display()))
    } else {
        ProbeError::Transport(format!("failed to run {}: {e}", path.display()))
    }
}

/// Extracts the `;; Query time: N msec` figure from `dig` output.
pub fn parse_query_time(output: &str) -> Option<f64> {
    QUERY_TIME
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}
