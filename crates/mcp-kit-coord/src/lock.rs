use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt as _;
use tracing::debug;

use crate::error::CoordError;

/// The on-disk election record.
///
/// Extra fields in the file are ignored on read; a file that fails to parse
/// into this shape counts as stale and reads as `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// PID of the primary.
    pub pid: u32,
    /// Semantic version the primary reported at election time.
    pub version: String,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl LockRecord {
    pub fn for_current_process(version: &str) -> Self {
        Self {
            pid: std::process::id(),
            version: version.to_string(),
            timestamp: now_ms(),
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Default lock path for a given shared port: `<tmpdir>/mcp-kit-<port>.lock`.
pub fn default_lock_path(port: u16) -> PathBuf {
    std::env::temp_dir().join(format!("mcp-kit-{port}.lock"))
}

/// Single-file lock store.
///
/// Election relies exclusively on [`LockStore::try_create`]; `overwrite` and
/// `remove` are reserved for the owning primary and the stale-reclaim path.
#[derive(Debug, Clone)]
pub struct LockStore {
    path: PathBuf,
}

impl LockStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically create the lock file with `record` as content.
    ///
    /// `Ok(false)` means exactly one thing: the file already exists. Every
    /// other failure is a real I/O error.
    pub async fn try_create(&self, record: &LockRecord) -> Result<bool, CoordError> {
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(self.io_err(e)),
        };

        let bytes = serde_json::to_vec(record).map_err(|e| self.io_err(e.into()))?;
        file.write_all(&bytes).await.map_err(|e| self.io_err(e))?;
        file.flush().await.map_err(|e| self.io_err(e))?;
        debug!(path = %self.path.display(), pid = record.pid, "lock acquired");
        Ok(true)
    }

    /// Read the lock record, treating every form of corruption as absence.
    pub async fn read(&self) -> Option<LockRecord> {
        let bytes = tokio::fs::read(&self.path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Unconditional write; only the owning primary rotates its own record.
    pub async fn overwrite(&self, record: &LockRecord) -> Result<(), CoordError> {
        let bytes = serde_json::to_vec(record).map_err(|e| self.io_err(e.into()))?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|e| self.io_err(e))
    }

    /// Remove the lock file. Absence is success.
    pub async fn remove(&self) -> Result<(), CoordError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "lock removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn io_err(&self, source: std::io::Error) -> CoordError {
        CoordError::LockIo {
            path: self.path.clone(),
            source,
        }
    }
}
