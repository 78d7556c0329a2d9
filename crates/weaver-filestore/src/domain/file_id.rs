//! File identity: the handle tasks exchange for a backing-store object.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A backing-store key annotated with the object's size in bytes.
///
/// Equality and hashing look at the key only: one key never denotes two
/// different sizes, so the size is metadata rather than identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileIdentity {
    key: String,
    size: u64,
}

impl FileIdentity {
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
        }
    }

    /// Build an identity for a key whose content is the local file at `path`.
    pub async fn for_path(key: impl Into<String>, path: &Path) -> std::io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(Self::new(key, metadata.len()))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl PartialEq for FileIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for FileIdentity {}

impl Hash for FileIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Identity of an object that is still being streamed into the store.
///
/// The size is shared with the write listener of the stream and grows as
/// bytes go through. Clones observe the same counter.
#[derive(Debug, Clone)]
pub struct PendingFileIdentity {
    key: String,
    size: Arc<AtomicU64>,
}

impl PendingFileIdentity {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub(crate) fn add(&self, bytes: usize) {
        self.size.fetch_add(bytes as u64, Ordering::AcqRel);
    }

    /// Freeze the current size into a regular identity.
    pub fn snapshot(&self) -> FileIdentity {
        FileIdentity::new(self.key.clone(), self.size())
    }
}
