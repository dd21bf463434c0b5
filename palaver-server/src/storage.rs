//! Durable blob storage.
//!
//! The store and replication layers never touch the filesystem directly;
//! they speak to a [`DurableLog`] keyed by `/`-separated logical paths
//! ("groups/lobby/changes.log", "peers/s2/last_sent", ...). Writes are
//! durable before the call returns — that is the whole contract the
//! crash-recovery story rests on.
//!
//! Two implementations: [`FsLog`] for real deployments and [`MemoryLog`]
//! for tests.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

/// Append-only / overwrite blob storage with durable writes.
pub trait DurableLog: Send + Sync {
    /// Overwrite the blob at `path` with `bytes`. Durable on return.
    fn put(&self, path: &str, bytes: &[u8]) -> io::Result<()>;

    /// Append one record (newline-terminated) to the blob at `path`.
    /// Durable on return. Records must not contain raw newlines; JSON
    /// encoding guarantees that.
    fn append(&self, path: &str, record: &[u8]) -> io::Result<()>;

    /// Read the whole blob, or `None` if it does not exist.
    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>>;

    /// Names of entries directly under `prefix`, sorted.
    fn list(&self, prefix: &str) -> io::Result<Vec<String>>;

    /// Delete the blob at `path`. Deleting a missing blob is not an error.
    fn delete(&self, path: &str) -> io::Result<()>;

    /// Read a record-per-line blob back as individual records.
    fn read_records(&self, path: &str) -> io::Result<Vec<Vec<u8>>> {
        let Some(bytes) = self.read(path)? else {
            return Ok(Vec::new());
        };
        Ok(bytes
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| line.to_vec())
            .collect())
    }
}

fn check_path(path: &str) -> io::Result<()> {
    let ok = !path.is_empty()
        && path
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != "..");
    if ok {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid blob path: {path:?}"),
        ))
    }
}

// ── Filesystem implementation ───────────────────────────────────────────────

/// Blob storage rooted at a data directory.
pub struct FsLog {
    root: PathBuf,
}

impl FsLog {
    /// Open (creating if needed) a data directory.
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        check_path(path)?;
        Ok(self.root.join(path))
    }

    fn ensure_parent(full: &Path) -> io::Result<()> {
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl DurableLog for FsLog {
    fn put(&self, path: &str, bytes: &[u8]) -> io::Result<()> {
        let full = self.resolve(path)?;
        Self::ensure_parent(&full)?;
        // Write-then-rename so a crash mid-write never leaves a torn blob.
        let tmp = full.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &full)?;
        Ok(())
    }

    fn append(&self, path: &str, record: &[u8]) -> io::Result<()> {
        let full = self.resolve(path)?;
        Self::ensure_parent(&full)?;
        let mut file = fs::OpenOptions::new().append(true).create(true).open(&full)?;
        let mut line = Vec::with_capacity(record.len() + 1);
        line.extend_from_slice(record);
        line.push(b'\n');
        file.write_all(&line)?;
        file.sync_all()?;
        Ok(())
    }

    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        let full = self.resolve(path)?;
        match fs::read(&full) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        let dir = self.resolve(prefix)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut names = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            if let Some(name) = name.to_str() {
                // Skip half-written put() leftovers.
                if !name.ends_with(".tmp") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn delete(&self, path: &str) -> io::Result<()> {
        let full = self.resolve(path)?;
        match fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// ── In-memory implementation ────────────────────────────────────────────────

/// In-memory blob storage for tests. A shared `Arc<MemoryLog>` survives a
/// simulated restart, so recovery paths can be exercised without a disk.
#[derive(Default)]
pub struct MemoryLog {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl DurableLog for MemoryLog {
    fn put(&self, path: &str, bytes: &[u8]) -> io::Result<()> {
        check_path(path)?;
        self.blobs.lock().insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn append(&self, path: &str, record: &[u8]) -> io::Result<()> {
        check_path(path)?;
        let mut blobs = self.blobs.lock();
        let blob = blobs.entry(path.to_string()).or_default();
        blob.extend_from_slice(record);
        blob.push(b'\n');
        Ok(())
    }

    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        check_path(path)?;
        Ok(self.blobs.lock().get(path).cloned())
    }

    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        check_path(prefix)?;
        let want = format!("{prefix}/");
        let blobs = self.blobs.lock();
        let mut names: Vec<String> = Vec::new();
        for key in blobs.keys() {
            if let Some(rest) = key.strip_prefix(&want) {
                let name = rest.split('/').next().unwrap_or(rest).to_string();
                if names.last() != Some(&name) {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }

    fn delete(&self, path: &str) -> io::Result<()> {
        check_path(path)?;
        self.blobs.lock().remove(path);
        Ok(())
    }
}
