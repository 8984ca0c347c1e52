use serde::Deserialize;
use std::{fs, path::{Path, PathBuf}, time::Duration};

use crate::engine::BLOCK_SIZE;
use crate::error::Result;

/// Lower bound for the shared block cache, in bytes.
pub const MIN_CACHE_BYTES: u64 = 8 * 1024 * 1024;

/// Default wait for the database structural lock.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 1000;

/// Settings for a [`Database`](crate::engine::Database).
///
/// Loaded from JSON with every field optional except `path`:
///
/// ```text
/// {
///   "path": "./dbdata",
///   "remove_on_error": true,
///   "lock_timeout_ms": 500,
///   "memory_size": 268435456
/// }
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Directory holding one `<table>.db` file per table
    pub path: PathBuf,
    /// Delete table files that fail to load instead of aborting startup
    #[serde(default)]
    pub remove_on_error: bool,
    /// Timeout for the structural database lock, in milliseconds
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,
    /// Memory available to the process; the cache takes an eighth of it
    #[serde(default)]
    pub memory_size: Option<u64>,
}

fn default_lock_timeout() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

impl DatabaseConfig {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            remove_on_error: false,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            memory_size: None,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn with_remove_on_error(mut self, remove: bool) -> Self {
        self.remove_on_error = remove;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_memory_size(mut self, bytes: u64) -> Self {
        self.memory_size = Some(bytes);
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Number of blocks the shared cache should hold: at least 8 MiB worth,
    /// or an eighth of `memory_size` when that is larger.
    pub fn cache_blocks(&self) -> usize {
        let budget = self.memory_size.map(|m| m / 8).unwrap_or(0);
        let bytes = budget.max(MIN_CACHE_BYTES);
        (bytes / BLOCK_SIZE as u64) as usize
    }
}
