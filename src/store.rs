//! Whole-document JSON persistence shared by the history store, the
//! slow-query log and the watch list.
//!
//! Every write is one scoped transaction:
//!
//! 1. take an exclusive `flock` on the sidecar `<file>.lock`
//! 2. read the current document
//! 3. modify it in memory
//! 4. write `.<file>.tmp.<pid>`, fsync, rename over the target
//! 5. drop the lock
//!
//! Readers never lock. Because the target is only ever replaced by
//! `rename`, a reader sees either the previous or the next document, never
//! a torn one. The lock lives on a sidecar file and not on the document
//! itself since the document's inode changes on every write.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not lock {path}: {errno}")]
    Lock { path: PathBuf, errno: Errno },

    #[error("malformed document {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not serialize document for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// An exclusive advisory lock guarding writes to one document.
///
/// Released when dropped.
pub struct DocumentLock {
    _lock: Flock<File>,
}

impl DocumentLock {
    /// Blocks until the write lock for `document` is held.
    pub fn acquire(document: &Path) -> Result<Self, StoreError> {
        let lock_path = sidecar_lock_path(document);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| StoreError::io(&lock_path, e))?;
        let lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| StoreError::Lock {
                path: lock_path.clone(),
                errno,
            })?;
        Ok(Self { _lock: lock })
    }
}

/// `<dir>/<name>.lock`
pub fn sidecar_lock_path(document: &Path) -> PathBuf {
    let mut name = document
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "document".into());
    name.push(".lock");
    document.with_file_name(name)
}

/// Reads and parses a document. A missing file is `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Malformed {
            path: path.to_path_buf(),
            source,
        })
}

/// Serializes `value` and atomically replaces `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes)
}

/// Writes `bytes` to a temporary file next to `path`, syncs it and renames
/// it over `path`. On failure the temporary file is removed and `path` is
/// left untouched.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let temp_path = temp_path_for(path);
    let result = (|| {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, path)
    })();

    result.map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        StoreError::io(path, e)
    })
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    path.with_file_name(format!(".{}.tmp.{}", name, std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        items: Vec<u32>,
    }

    #[test]
    fn missing_document_reads_as_none() {
        let dir = tempdir().unwrap();
        let doc: Option<Doc> = read_json(&dir.path().join("absent.json")).unwrap();
        assert!(doc.is_none());
    }

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_json_atomic(&path, &Doc { items: vec![1] }).unwrap();
        write_json_atomic(&path, &Doc { items: vec![1, 2] }).unwrap();

        let doc: Doc = read_json(&path).unwrap().unwrap();
        assert_eq!(doc.items, vec![1, 2]);

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn malformed_document_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        fs::write(&path, b"{\"items\": [1,").unwrap();
        let result: Result<Option<Doc>, _> = read_json(&path);
        assert!(matches!(result, Err(StoreError::Malformed { .. })));
    }

    #[test]
    fn sidecar_lock_sits_next_to_document() {
        assert_eq!(
            sidecar_lock_path(Path::new("/data/slow_queries.json")),
            PathBuf::from("/data/slow_queries.json.lock")
        );
    }

    #[test]
    fn document_lock_is_reacquirable_after_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let first = DocumentLock::acquire(&path).unwrap();
        drop(first);
        let _second = DocumentLock::acquire(&path).unwrap();
    }
}
