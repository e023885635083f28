//! The function-result cache.
//!
//! Materialized server-function results are kept as DataDDX documents on
//! disk, shared across server processes. Advisory file locks serialize
//! writers and keep readers safe: building an entry takes an exclusive lock,
//! which is downgraded to shared before the entry is streamed out; concurrent
//! readers hold shared locks. Nothing here blocks — every lock acquisition is
//! a try, and the caller drives the retry state machine.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fs2::FileExt;
use log::{debug, warn};

/// Characters of a cache key that would be hostile in a file name.
const MANGLED: &[char] = &['/', '(', ')', ',', '"', '\''];

/// Lock held by a [`CacheHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Shared,
    Exclusive,
}

/// An open, locked cache entry. Dropping the handle releases the lock.
#[derive(Debug)]
pub struct CacheHandle {
    file: File,
    path: PathBuf,
    state: LockState,
}

impl CacheHandle {
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> LockState {
        self.state
    }
}

/// A disk-backed, size-bounded cache of function results, keyed by dataset
/// name and function sub-expression.
#[derive(Debug)]
pub struct FunctionCache {
    root: PathBuf,
    prefix: String,
    max_bytes: u64,
}

impl FunctionCache {
    /// Open (creating if needed) the cache directory.
    pub fn new(root: &Path, prefix: &str, max_bytes: u64) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;

        Ok(Self {
            root: root.to_owned(),
            prefix: prefix.to_owned(),
            max_bytes,
        })
    }

    /// Build the key naming a function result: the dataset name and the
    /// function sub-expression, with file-hostile characters mangled to `#`.
    pub fn cache_key(dataset: &str, function_ce: &str) -> String {
        let raw = format!("{dataset}#{function_ce}");
        raw.chars()
            .map(|c| if MANGLED.contains(&c) { '#' } else { c })
            .collect()
    }

    /// Where the entry for `key` lives. A pure function of key and root.
    pub fn file_for_key(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}{key}", self.prefix))
    }

    fn info_path(&self) -> PathBuf {
        self.root.join(format!("{}dap.cache_info", self.prefix))
    }

    /// Try to open `path` for reading under a shared lock. `None` when the
    /// entry does not exist or is exclusively locked by a writer.
    pub fn get_read_lock(&self, path: &Path) -> Option<CacheHandle> {
        let file = File::open(path).ok()?;
        match file.try_lock_shared() {
            Ok(()) => Some(CacheHandle {
                file,
                path: path.to_owned(),
                state: LockState::Shared,
            }),
            Err(_) => None,
        }
    }

    /// Create the entry file and take an exclusive lock on it. `None` when
    /// the file already exists (someone else created or is creating it).
    pub fn create_and_lock(&self, path: &Path) -> std::io::Result<Option<CacheHandle>> {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e),
        };

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(CacheHandle {
                file,
                path: path.to_owned(),
                state: LockState::Exclusive,
            })),
            // We created the file but lost the lock race; let the caller
            // retry as a reader.
            Err(_) => Ok(None),
        }
    }

    /// Atomically convert the writer's exclusive lock to a shared one, so the
    /// fresh entry can be purged by no one while it is being streamed.
    pub fn exclusive_to_shared_lock(&self, handle: &mut CacheHandle) -> std::io::Result<()> {
        handle.file.lock_shared()?;
        handle.state = LockState::Shared;
        Ok(())
    }

    /// Release the lock and close the entry.
    pub fn unlock_and_close(&self, handle: CacheHandle) -> std::io::Result<()> {
        fs2::FileExt::unlock(&handle.file)
    }

    /// Remove a cache entry. Readers holding shared locks keep their open
    /// file; the name disappears for everyone else.
    pub fn purge_file(&self, path: &Path) -> std::io::Result<()> {
        debug!("purging cache entry {}", path.display());
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Is the entry usable? It must exist, be nonzero in size, and be no
    /// older than the dataset it was derived from. A dataset that cannot be
    /// stat'd (a virtual dataset) never invalidates the entry.
    pub fn is_valid(&self, path: &Path, dataset: &str) -> bool {
        let Ok(meta) = std::fs::metadata(path) else {
            return false;
        };
        if meta.len() == 0 {
            return false;
        }
        let entry_time = meta.modified().ok();

        let dataset_time = std::fs::metadata(dataset).ok().and_then(|m| m.modified().ok());

        match (entry_time, dataset_time) {
            (Some(entry), Some(dataset)) => dataset <= entry,
            _ => true,
        }
    }

    /// Re-total the entries after a write and persist the figure beside them.
    /// Returns the new total.
    pub fn update_cache_info(&self, _just_written: &Path) -> std::io::Result<u64> {
        let total = self
            .entries()?
            .iter()
            .map(|entry| entry.size)
            .sum::<u64>();

        let mut info = File::create(self.info_path())?;
        info.try_lock_exclusive().ok();
        write!(info, "{total}")?;

        Ok(total)
    }

    /// The persisted total from the last write, if any.
    pub fn read_cache_info(&self) -> Option<u64> {
        let mut text = String::new();
        File::open(self.info_path())
            .ok()?
            .read_to_string(&mut text)
            .ok()?;
        text.trim().parse().ok()
    }

    pub fn cache_too_big(&self, total: u64) -> bool {
        total > self.max_bytes
    }

    /// Evict oldest-first until the cache fits its budget. The caller's
    /// freshly written entry is never evicted, and neither is any entry a
    /// reader currently holds a lock on.
    pub fn update_and_purge(&self, excluding: &Path) -> std::io::Result<()> {
        let mut entries = self.entries()?;
        entries.sort_by_key(|entry| entry.mtime);

        let mut total: u64 = entries.iter().map(|e| e.size).sum();

        for entry in &entries {
            if total <= self.max_bytes {
                break;
            }
            if entry.path == excluding {
                continue;
            }

            // A lock we cannot take means a reader is mid-stream; skip.
            let Ok(file) = File::open(&entry.path) else {
                continue;
            };
            if file.try_lock_exclusive().is_err() {
                debug!("not evicting locked entry {}", entry.path.display());
                continue;
            }

            match std::fs::remove_file(&entry.path) {
                Ok(()) => total = total.saturating_sub(entry.size),
                Err(e) => warn!("could not evict {}: {e}", entry.path.display()),
            }
            fs2::FileExt::unlock(&file).ok();
        }

        let mut info = File::create(self.info_path())?;
        write!(info, "{total}")?;
        Ok(())
    }

    fn entries(&self) -> std::io::Result<Vec<CacheEntry>> {
        let info = self.info_path();
        let mut entries = Vec::new();

        for dirent in std::fs::read_dir(&self.root)? {
            let dirent = dirent?;
            let path = dirent.path();
            if path == info {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !file_name.starts_with(&self.prefix) {
                continue;
            }
            let Ok(meta) = dirent.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }

            entries.push(CacheEntry {
                path,
                size: meta.len(),
                mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        Ok(entries)
    }
}

#[derive(Debug)]
struct CacheEntry {
    path: PathBuf,
    size: u64,
    mtime: SystemTime,
}
