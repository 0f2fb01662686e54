//! Single-instance guard.
//!
//! The daemon holds an exclusive, non-blocking `flock` on its pid file for
//! its whole lifetime. The lock is what proves ownership; the pid written
//! into the file only tells other processes whom to signal. An identity
//! file nobody holds locked is abandoned whatever pid it names, so a file
//! left behind by a crash never blocks a new daemon and never points a
//! controller at an unrelated process that inherited the pid.
//!
//! Whoever deletes the file does so while holding its lock, and whoever
//! takes the lock checks that the locked inode is still the one the path
//! names. A contender that locked an inode which was unlinked meanwhile
//! notices and starts over on the fresh file.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// How often acquisition and inspection look again after losing a race.
const ATTEMPTS: usize = 5;

/// Pause before retrying a contended lock. Inspections hold it briefly.
const CONTENDED_RETRY: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("another daemon instance holds {0}")]
    AlreadyRunning(PathBuf),

    #[error("I/O failure on identity file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not lock identity file {path}: {errno}")]
    Lock { path: PathBuf, errno: Errno },
}

/// What the identity file says about the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    Absent,
    /// Locked by a live daemon; `None` until it has written its pid.
    Held(Option<i32>),
    /// Not locked by anyone. The inspection removed it.
    Abandoned(Option<i32>),
}

enum Attempt {
    Held(Flock<File>),
    Contended,
    Replaced,
}

/// Proof that this process is the only running daemon.
///
/// Dropping the lease releases it: the identity file is removed, then the
/// lock is let go. Release runs at most once.
pub struct Lease {
    path: PathBuf,
    lock: Option<Flock<File>>,
}

impl Lease {
    /// Takes the lease on `path`, creating the file if needed.
    ///
    /// The file is only truncated after the lock is held, so a losing
    /// contender never touches the winner's identity.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LeaseError> {
        let path = path.as_ref().to_path_buf();
        for attempt in 1..=ATTEMPTS {
            match lock_current(&path)? {
                Attempt::Held(lock) => return Self::publish(path, lock),
                Attempt::Replaced => {
                    debug!(path = %path.display(), "Identity file replaced while locking, retrying");
                }
                Attempt::Contended if attempt < ATTEMPTS => std::thread::sleep(CONTENDED_RETRY),
                Attempt::Contended => break,
            }
        }
        Err(LeaseError::AlreadyRunning(path))
    }

    fn publish(path: PathBuf, mut lock: Flock<File>) -> Result<Self, LeaseError> {
        let io_err = |source| LeaseError::Io {
            path: path.clone(),
            source,
        };

        if let Some(pid) = read_pid(&mut lock).map_err(io_err)? {
            warn!(pid, path = %path.display(), "Replacing stale identity file");
        }

        lock.set_len(0).map_err(io_err)?;
        lock.seek(SeekFrom::Start(0)).map_err(io_err)?;
        write!(lock, "{}", std::process::id()).map_err(io_err)?;
        lock.flush().map_err(io_err)?;
        lock.sync_all().map_err(io_err)?;

        debug!(path = %path.display(), pid = std::process::id(), "Lease acquired");
        Ok(Self {
            path,
            lock: Some(lock),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.lock.is_some()
    }

    /// Removes the identity file, then releases the lock. Idempotent.
    pub fn release(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        match fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "Identity file removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove identity file"),
        }
        if let Err((_, errno)) = lock.unlock() {
            warn!(%errno, "Failed to unlock identity file");
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

fn lock_current(path: &Path) -> Result<Attempt, LeaseError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| LeaseError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => lock,
        Err((_, Errno::EWOULDBLOCK)) => return Ok(Attempt::Contended),
        Err((_, errno)) => {
            return Err(LeaseError::Lock {
                path: path.to_path_buf(),
                errno,
            })
        }
    };

    match is_linked(&lock, path) {
        Ok(true) => Ok(Attempt::Held(lock)),
        Ok(false) => Ok(Attempt::Replaced),
        Err(source) => Err(LeaseError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Looks at the identity file without taking the lease.
///
/// A file nobody holds locked is removed while this call holds its lock,
/// so it cannot race a daemon that is starting up.
pub fn inspect(path: &Path) -> io::Result<Identity> {
    for _ in 0..ATTEMPTS {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Identity::Absent),
            Err(e) => return Err(e),
        };

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(mut lock) => {
                if !is_linked(&lock, path)? {
                    continue;
                }
                let pid = read_pid(&mut lock)?;
                match fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
                return Ok(Identity::Abandoned(pid));
            }
            Err((mut file, Errno::EWOULDBLOCK)) => {
                return Ok(Identity::Held(read_pid(&mut file)?));
            }
            Err((_, errno)) => return Err(io::Error::from(errno)),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::Other,
        "identity file kept changing while inspected",
    ))
}

/// Whether `file` is still the inode `path` names.
fn is_linked(file: &File, path: &Path) -> io::Result<bool> {
    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// The positive pid recorded in `file`, if any.
fn read_pid(file: &mut File) -> io::Result<Option<i32>> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut contents)?;
    Ok(contents.trim().parse::<i32>().ok().filter(|pid| *pid > 0))
}
