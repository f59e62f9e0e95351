//! Commit metadata stores.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// A store that persists the latest commit blob atomically.
///
/// The log serializes access: at most one commit write is in flight at any
/// time, always under the commit coordinator's lock.
pub trait CommitManager: Send + Sync + 'static {
    /// Atomically replace the stored blob.
    fn commit(&self, blob: &[u8]) -> io::Result<()>;

    /// Retrieve the latest stored blob, or `None` for a fresh store.
    fn get_latest(&self) -> io::Result<Option<Vec<u8>>>;
}

/// Commit manager backed by a single local file.
///
/// Writes go to a `.tmp` sibling first and are renamed into place, so the
/// latest blob is replaced atomically and a crash mid-write leaves the
/// previous commit intact.
pub struct LocalCommitManager {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl LocalCommitManager {
    /// Create a manager writing to `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut tmp_name = path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        Self {
            path,
            tmp_path: PathBuf::from(tmp_name),
        }
    }

    /// Path of the commit file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CommitManager for LocalCommitManager {
    fn commit(&self, blob: &[u8]) -> io::Result<()> {
        let mut file = fs::File::create(&self.tmp_path)?;
        file.write_all(blob)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.tmp_path, &self.path)?;

        // Persist the rename itself on filesystems that need it.
        if let Some(dir) = self.path.parent() {
            if let Ok(dir_file) = fs::File::open(dir) {
                let _ = dir_file.sync_all();
            }
        }
        Ok(())
    }

    fn get_latest(&self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// In-memory commit manager.
///
/// Holds the latest blob in process memory only; pairs with
/// [`crate::device::NullDisk`] for memory-only logs and tests.
#[derive(Default)]
pub struct MemoryCommitManager {
    latest: Mutex<Option<Vec<u8>>>,
}

impl MemoryCommitManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommitManager for MemoryCommitManager {
    fn commit(&self, blob: &[u8]) -> io::Result<()> {
        *self.latest.lock() = Some(blob.to_vec());
        Ok(())
    }

    fn get_latest(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.latest.lock().clone())
    }
}
