use std::collections::BTreeMap;
use std::fs::{self, File, TryLockError};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

pub const CANDIDATES_PATH: &str = "data/candidate_urls.json";
pub const VALIDATIONS_PATH: &str = "data/cleaned/url_validation_results.json";
pub const PROFILES_PATH: &str = "data/external/peterson_profiles.json";
pub const COURSES_PATH: &str = "data/external/peterson_courses.json";
pub const UNIFIED_PATH: &str = "data/peterson_unified.json";
pub const CLEAN_PATH: &str = "data/cleaned/peterson_data.json";
pub const REJECTED_PATH: &str = "data/cleaned/peterson_rejected.json";

const LOCK_ATTEMPTS: u32 = 10;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Keyed JSON document store, one file per record type.
///
/// The file is the only shared mutable resource between workers, so every
/// write goes through an exclusive advisory lock on a sidecar lock file and
/// lands via write-to-temp + atomic rename. A reader never observes a
/// half-written store; two writers never interleave.
pub struct Store<T> {
    path: PathBuf,
    backup_path: PathBuf,
    lock_path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Store<T> {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".to_string());
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Store {
            backup_path: dir.join(format!("{stem}_backup.json")),
            lock_path: dir.join(format!("{stem}.lock")),
            path,
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the full keyed snapshot. A missing file is an empty store.
    pub fn load(&self) -> Result<BTreeMap<String, T>> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("malformed store file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to read store {}", self.path.display()))
            }
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<T>> {
        Ok(self.load()?.remove(key))
    }

    /// Replace the whole store in one locked section: backup the previous
    /// consistent state, then atomically swap in the new snapshot.
    pub fn put_all(&self, snapshot: &BTreeMap<String, T>) -> Result<()> {
        let _lock = self.acquire_lock()?;
        self.copy_to_backup()?;
        self.write_atomic(snapshot)
    }

    /// Apply `f` to the current snapshot under the exclusive lock and commit
    /// the result atomically. Used for single-key writes mid-stage; does NOT
    /// refresh the backup, which must keep the last stage-complete state.
    pub fn locked_update<R>(&self, f: impl FnOnce(&mut BTreeMap<String, T>) -> R) -> Result<R> {
        let _lock = self.acquire_lock()?;
        let mut snapshot = self.load()?;
        let out = f(&mut snapshot);
        self.write_atomic(&snapshot)?;
        Ok(out)
    }

    /// Copy the current store file to its `*_backup` sibling. Called once at
    /// the start of a stage that performs per-key writes, so the backup
    /// always reflects the last stage-complete state.
    pub fn snapshot_backup(&self) -> Result<()> {
        let _lock = self.acquire_lock()?;
        self.copy_to_backup()
    }

    fn copy_to_backup(&self) -> Result<()> {
        if self.path.exists() {
            fs::copy(&self.path, &self.backup_path).with_context(|| {
                format!("failed to back up store to {}", self.backup_path.display())
            })?;
            debug!("backed up {} -> {}", self.path.display(), self.backup_path.display());
        }
        Ok(())
    }

    fn write_atomic(&self, snapshot: &BTreeMap<String, T>) -> Result<()> {
        let dir = self.ensure_dir()?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create temp file next to {}", self.path.display()))?;
        serde_json::to_writer_pretty(&mut tmp, snapshot)
            .with_context(|| format!("failed to serialize store {}", self.path.display()))?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .with_context(|| format!("failed to replace store {}", self.path.display()))?;
        Ok(())
    }

    fn ensure_dir(&self) -> Result<&Path> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create store directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Bounded lock acquisition: storage contention is retried, then fatal
    /// for this stage invocation only. The lock releases when the returned
    /// file handle drops.
    fn acquire_lock(&self) -> Result<File> {
        self.ensure_dir()?;
        let lock = File::create(&self.lock_path)
            .with_context(|| format!("failed to open lock file {}", self.lock_path.display()))?;
        for _ in 0..LOCK_ATTEMPTS {
            match lock.try_lock() {
                Ok(()) => return Ok(lock),
                Err(TryLockError::WouldBlock) => std::thread::sleep(LOCK_RETRY_DELAY),
                Err(TryLockError::Error(e)) => {
                    return Err(e).with_context(|| {
                        format!("failed to lock store {}", self.path.display())
                    });
                }
            }
        }
        bail!(
            "could not acquire lock on {} after {} attempts",
            self.path.display(),
            LOCK_ATTEMPTS
        );
    }
}

// ── Tests ──
