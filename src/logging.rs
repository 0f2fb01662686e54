//! Diagnostic logging.
//!
//! Events go to stdout and to a size-capped append log in the data
//! directory. Each event is appended under an exclusive `flock` on the log
//! file; when the file grows past `max_bytes` it is trimmed in place to at
//! most `trim_to_bytes`, keeping the newest whole lines.

use anyhow::Result;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{
    fmt::{self, format::Writer, time::FormatTime, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::clock::Clock;
use crate::config::LogConfig;

/// Formats event timestamps as `[YYYY-mm-dd HH:MM:SS]` from the injected clock.
#[derive(Clone)]
pub struct ClockTimer(pub Arc<dyn Clock>);

impl FormatTime for ClockTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        use std::fmt::Write as _;
        write!(w, "[{}]", self.0.now().format("%Y-%m-%d %H:%M:%S"))
    }
}

/// `MakeWriter` for the capped diagnostic log.
#[derive(Debug, Clone)]
pub struct CappedLog {
    path: PathBuf,
    max_bytes: u64,
    trim_to_bytes: u64,
}

impl CappedLog {
    pub fn new(path: impl Into<PathBuf>, config: &LogConfig) -> Self {
        Self {
            path: path.into(),
            max_bytes: config.max_bytes,
            trim_to_bytes: config.trim_to_bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `bytes` and trims the file if it went over the cap.
    pub fn append(&self, bytes: &[u8]) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)?;
        let mut file = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| io::Error::from(errno))?;

        file.write_all(bytes)?;
        if file.metadata()?.len() > self.max_bytes {
            trim_newest_lines(&mut file, self.trim_to_bytes)?;
        }
        Ok(())
    }
}

/// Rewrites `file` in place keeping at most `keep_bytes` of its tail,
/// starting at a line boundary. Callers hold the lock.
fn trim_newest_lines(file: &mut File, keep_bytes: u64) -> io::Result<()> {
    let len = file.metadata()?.len();
    if len <= keep_bytes {
        return Ok(());
    }

    // One byte before the cut, so a cut on a line boundary keeps that line.
    file.seek(SeekFrom::Start(len - keep_bytes - 1))?;
    let mut tail = Vec::with_capacity(keep_bytes as usize + 1);
    file.read_to_end(&mut tail)?;

    // Drop the partial line the cut landed in.
    let start = tail
        .iter()
        .position(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(tail.len());
    let kept = &tail[start..];

    file.set_len(0)?;
    // Append mode writes at the end, which is now offset 0.
    file.write_all(kept)?;
    file.sync_data()
}

/// One formatted event, written on drop.
pub struct CappedLogWriter {
    log: CappedLog,
    buf: Vec<u8>,
}

impl Write for CappedLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let result = self.log.append(&self.buf);
        self.buf.clear();
        result
    }
}

impl Drop for CappedLogWriter {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            eprintln!("dnsmon: failed to write {}: {}", self.log.path.display(), e);
        }
    }
}

impl<'a> MakeWriter<'a> for CappedLog {
    type Writer = CappedLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CappedLogWriter {
            log: self.clone(),
            buf: Vec::new(),
        }
    }
}

/// Installs the daemon's global subscriber: stdout plus, when given, the
/// capped diagnostic file. `RUST_LOG` overrides `level`.
pub fn init(level: &str, clock: Arc<dyn Clock>, file: Option<CappedLog>) -> Result<()> {
    let filter = env_filter(level)?;

    let stdout_layer = fmt::layer()
        .with_timer(ClockTimer(clock.clone()))
        .with_target(false);

    let file_layer = file.map(|log| {
        fmt::layer()
            .with_timer(ClockTimer(clock))
            .with_target(false)
            .with_ansi(false)
            .with_writer(log)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

/// Subscriber for one-shot commands: stderr only, so stdout stays clean
/// for their JSON output.
pub fn init_for_commands(level: &str, clock: Arc<dyn Clock>) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(level)?)
        .with(
            fmt::layer()
                .with_timer(ClockTimer(clock))
                .with_target(false)
                .with_writer(io::stderr),
        )
        .try_init()?;
    Ok(())
}

fn env_filter(level: &str) -> Result<EnvFilter> {
    Ok(EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn capped(path: &Path, max: u64, keep: u64) -> CappedLog {
        CappedLog::new(
            path,
            &LogConfig {
                max_bytes: max,
                trim_to_bytes: keep,
            },
        )
    }

    #[test]
    fn appends_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.log");
        let log = capped(&path, 1024, 900);
        log.append(b"[2024-05-01 12:00:00] one\n").unwrap();
        log.append(b"[2024-05-01 12:00:01] two\n").unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "[2024-05-01 12:00:00] one\n[2024-05-01 12:00:01] two\n"
        );
    }

    #[test]
    fn trims_to_newest_whole_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.log");
        let log = capped(&path, 100, 60);

        for i in 0..20 {
            log.append(format!("line {i:02} xxxxxx\n").as_bytes()).unwrap();
        }

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.len() as u64 <= 100);
        assert!(contents.ends_with("line 19 xxxxxx\n"));
        assert!(contents.lines().all(|l| l.starts_with("line ")));
        assert!(!contents.contains("line 00"));
    }

    #[test]
    fn writer_flushes_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.log");
        let log = capped(&path, 1024, 900);
        {
            let mut writer = log.make_writer();
            writer.write_all(b"partial ").unwrap();
            writer.write_all(b"event\n").unwrap();
            assert!(!path.exists());
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "partial event\n");
    }
}
