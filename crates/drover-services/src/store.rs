//! Durable keyed persistence.
//!
//! Every subsystem writes under its own key prefix (`task/`, `worker/`,
//! `payment/`, `template/`, `accesscode/`); no cross-prefix transactions
//! exist. Values are serialized JSON so a store root stays
//! human-inspectable with nothing but `cat`.
//!
//! Two backends: `MemoryStore` for tests and embedded use, `FsStore`
//! for the daemon. FsStore maps keys to paths (a `/` in the key becomes
//! a subdirectory) and writes atomically: temp file, fsync, rename.

use dashmap::DashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// ── Key prefixes ──────────────────────────────────────────────────────────────

pub mod prefix {
    pub const TASK: &str = "task/";
    pub const WORKER: &str = "worker/";
    pub const PAYMENT: &str = "payment/";
    pub const TEMPLATE: &str = "template/";
    pub const ACCESS_CODE: &str = "accesscode/";
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {0}: {1}")]
    Io(String, std::io::Error),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<StoreError> for drover_core::ManagerError {
    fn from(e: StoreError) -> Self {
        drover_core::ManagerError::Store(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ── Trait ─────────────────────────────────────────────────────────────────────

/// Synchronous keyed store. Operations are cheap enough to run on the
/// subsystem actor; callers never hold a subsystem lock across a store
/// call that can block on the network (there are none).
pub trait KvStore: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn delete(&self, key: &str) -> Result<()>;
    /// All entries under a prefix, sorted by key.
    fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Keys are built from ids that cross the trust boundary; refuse
/// anything that could escape the store root.
fn check_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.ends_with('/')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

// ── Memory backend ────────────────────────────────────────────────────────────

/// In-memory backend for tests and development.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        check_key(key)?;
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        check_key(key)?;
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    fn delete(&self, key: &str) -> Result<()> {
        check_key(key)?;
        self.entries.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out: Vec<(String, Vec<u8>)> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

// ── Filesystem backend ────────────────────────────────────────────────────────

/// One file per key under a root directory.
#[derive(Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::Io(root.display().to_string(), e))?;
        Ok(Self { root })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl KvStore for FsStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        check_key(key)?;
        let path = self.key_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(parent.display().to_string(), e))?;
        }

        // Atomic write: tmp file → fsync → rename.
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)
                .map_err(|e| StoreError::Io(tmp.display().to_string(), e))?;
            file.write_all(value)
                .map_err(|e| StoreError::Io(tmp.display().to_string(), e))?;
            file.sync_all()
                .map_err(|e| StoreError::Io(tmp.display().to_string(), e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| StoreError::Io(path.display().to_string(), e))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        check_key(key)?;
        let path = self.key_path(key);
        if !path.exists() {
            return Ok(None);
        }
        fs::read(&path)
            .map(Some)
            .map_err(|e| StoreError::Io(path.display().to_string(), e))
    }

    fn delete(&self, key: &str) -> Result<()> {
        check_key(key)?;
        let path = self.key_path(key);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| StoreError::Io(path.display().to_string(), e))?;
        }
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        let start = self.root.join(prefix.trim_end_matches('/'));
        if !start.exists() {
            return Ok(out);
        }
        let mut stack = vec![start];
        while let Some(dir) = stack.pop() {
            let entries =
                fs::read_dir(&dir).map_err(|e| StoreError::Io(dir.display().to_string(), e))?;
            for entry in entries {
                let entry = entry.map_err(|e| StoreError::Io(dir.display().to_string(), e))?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().map(|e| e == "tmp").unwrap_or(false) {
                    // Leftover from an interrupted write.
                    continue;
                } else {
                    let key = path
                        .strip_prefix(&self.root)
                        .map_err(|_| StoreError::InvalidKey(path.display().to_string()))?
                        .to_string_lossy()
                        .replace('\\', "/");
                    let value = fs::read(&path)
                        .map_err(|e| StoreError::Io(path.display().to_string(), e))?;
                    out.push((key, value));
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

/// Encode a payment nonce so lexicographic key order is numeric order.
pub fn padded_nonce(nonce: u64) -> String {
    format!("{nonce:020}")
}
