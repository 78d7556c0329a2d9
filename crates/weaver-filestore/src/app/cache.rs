//! Local cache strategies for global file reads.
//!
//! `NoCache` downloads straight to the destination. `NodeCache` keeps one
//! shared copy per key under `<workdir>/cache/files` and hands tasks links or
//! copies of it, depending on whether they asked for a mutable file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ulid::Ulid;

use super::journal::TaskJournal;
use super::node::NodeContext;
use crate::deferred::{DeferredAction, DeferredFunction};
use crate::domain::{FileIdentity, FileStoreError, StateError};
use crate::ports::BackingStore;
use crate::state::cache_state::{self, Reservation};

/// How a global file should be materialized locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOptions {
    /// Destination; relative paths resolve against the task temp dir.
    /// `None` picks a fresh temp file name.
    pub user_path: Option<PathBuf>,
    /// Allow the node cache to keep a copy.
    pub cache: bool,
    /// The caller may modify the result, so it must be an independent copy.
    pub mutable: bool,
    /// Prefer a symlink over a hard link for immutable cached reads.
    pub symlink: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            user_path: None,
            cache: true,
            mutable: false,
            symlink: false,
        }
    }
}

impl ReadOptions {
    pub fn to(mut self, path: impl Into<PathBuf>) -> Self {
        self.user_path = Some(path.into());
        self
    }

    pub fn mutable(mut self, mutable: bool) -> Self {
        self.mutable = mutable;
        self
    }

    pub fn symlink(mut self, symlink: bool) -> Self {
        self.symlink = symlink;
        self
    }

    pub fn cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }
}

#[async_trait]
pub trait LocalCache: Send + Sync {
    fn name(&self) -> &'static str;

    /// Materialize `id` at `dest`, which must not exist yet.
    async fn fetch(
        &self,
        store: &dyn BackingStore,
        journal: &TaskJournal,
        id: &FileIdentity,
        dest: &Path,
        options: &ReadOptions,
    ) -> Result<(), FileStoreError>;

    /// Drop any shared copy of `key`.
    async fn forget(&self, key: &str) -> Result<(), FileStoreError>;
}

/// Pick the strategy the node is configured for.
pub fn for_node(node: &NodeContext) -> Box<dyn LocalCache> {
    if node.caching() {
        Box::new(NodeCache::new(node.cache_dir(), node.cache_max_bytes()))
    } else {
        Box::new(NoCache)
    }
}

/// Stream `key` into a new file at `dest`.
pub async fn download(
    store: &dyn BackingStore,
    key: &str,
    dest: &Path,
) -> Result<u64, FileStoreError> {
    let mut reader = store.get_stream(key).await?;
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dest)
        .await
        .map_err(|e| FileStoreError::io(dest, e))?;
    let copied = tokio::io::copy(&mut reader, &mut file)
        .await
        .map_err(|e| FileStoreError::io(dest, e))?;
    file.sync_all()
        .await
        .map_err(|e| FileStoreError::io(dest, e))?;
    Ok(copied)
}

/// Every read is a fresh, independent download.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

#[async_trait]
impl LocalCache for NoCache {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn fetch(
        &self,
        store: &dyn BackingStore,
        _journal: &TaskJournal,
        id: &FileIdentity,
        dest: &Path,
        _options: &ReadOptions,
    ) -> Result<(), FileStoreError> {
        download(store, id.key(), dest).await?;
        Ok(())
    }

    async fn forget(&self, _key: &str) -> Result<(), FileStoreError> {
        Ok(())
    }
}

/// Shared per-node cache with a byte quota. No eviction: once full, reads
/// fall back to plain downloads.
#[derive(Debug, Clone)]
pub struct NodeCache {
    dir: Arc<PathBuf>,
    max_bytes: u64,
}

impl NodeCache {
    pub fn new(dir: PathBuf, max_bytes: u64) -> Self {
        Self {
            dir: Arc::new(dir),
            max_bytes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn blocking<R, F>(&self, f: F) -> Result<R, FileStoreError>
    where
        R: Send + 'static,
        F: FnOnce(&Path) -> Result<R, StateError> + Send + 'static,
    {
        let dir = Arc::clone(&self.dir);
        let result = tokio::task::spawn_blocking(move || f(&dir))
            .await
            .map_err(|e| FileStoreError::io(self.dir.as_path(), std::io::Error::other(e)))?;
        Ok(result?)
    }

    async fn is_cached(&self, key: &str) -> Result<bool, FileStoreError> {
        let key = key.to_string();
        self.blocking(move |dir| {
            let committed = cache_state::snapshot(dir)?
                .is_some_and(|state| state.entries.contains_key(&key));
            Ok(committed && cache_state::cached_file_path(dir, &key).exists())
        })
        .await
    }

    /// Reserve, download into the cache outside the lock, then commit.
    /// Returns false when the cache would not take the file.
    async fn populate(
        &self,
        store: &dyn BackingStore,
        journal: &TaskJournal,
        id: &FileIdentity,
    ) -> Result<bool, FileStoreError> {
        let key = id.key().to_string();
        let bytes = id.size();
        let max_bytes = self.max_bytes;
        let token = Ulid::new();
        let reservation = {
            let key = key.clone();
            self.blocking(move |dir| {
                cache_state::prepare(dir)?;
                cache_state::reserve(dir, &key, token, bytes, max_bytes)
            })
            .await?
        };
        match reservation {
            Reservation::Cached => return Ok(true),
            Reservation::Refused => {
                tracing::debug!(key = %key, bytes, "cache refused file");
                return Ok(false);
            }
            Reservation::Reserved => {}
        }

        // A crash before commit leaves the reservation for the sweep.
        let release = DeferredAction::ReleaseCacheReservation {
            key: key.clone(),
            token,
        };
        journal
            .register(DeferredFunction::create(&release)?)
            .await?;

        let partial = cache_state::partial_path(&self.dir, &key);
        let downloaded = match download(store, &key, &partial).await {
            Ok(downloaded) => downloaded,
            Err(e) => {
                let key = key.clone();
                self.blocking(move |dir| cache_state::release_reservation(dir, &key, token))
                    .await?;
                return Err(e);
            }
        };
        let target = cache_state::cached_file_path(&self.dir, &key);
        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|e| FileStoreError::io(&target, e))?;
        {
            let key = key.clone();
            self.blocking(move |dir| {
                cache_state::commit(dir, &key, token, downloaded, max_bytes)
            })
            .await?;
        }
        tracing::debug!(key = %key, bytes = downloaded, "cached file");
        Ok(true)
    }

    async fn materialize(
        &self,
        key: &str,
        dest: &Path,
        options: &ReadOptions,
    ) -> Result<(), FileStoreError> {
        let cached = cache_state::cached_file_path(&self.dir, key);
        if options.mutable {
            return copy_new(&cached, dest).await;
        }
        if options.symlink {
            return tokio::fs::symlink(&cached, dest)
                .await
                .map_err(|e| FileStoreError::io(dest, e));
        }
        match tokio::fs::hard_link(&cached, dest).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(FileStoreError::DestinationExists(dest.to_path_buf()))
            }
            Err(e) => {
                tracing::debug!(key, err = %e, "hard link failed, copying");
                copy_new(&cached, dest).await
            }
        }
    }
}

async fn copy_new(source: &Path, dest: &Path) -> Result<(), FileStoreError> {
    if tokio::fs::try_exists(dest).await.unwrap_or(false) {
        return Err(FileStoreError::DestinationExists(dest.to_path_buf()));
    }
    tokio::fs::copy(source, dest)
        .await
        .map_err(|e| FileStoreError::io(dest, e))?;
    Ok(())
}

#[async_trait]
impl LocalCache for NodeCache {
    fn name(&self) -> &'static str {
        "node"
    }

    async fn fetch(
        &self,
        store: &dyn BackingStore,
        journal: &TaskJournal,
        id: &FileIdentity,
        dest: &Path,
        options: &ReadOptions,
    ) -> Result<(), FileStoreError> {
        let cached = self.is_cached(id.key()).await?
            || (options.cache && self.populate(store, journal, id).await?);
        if cached {
            self.materialize(id.key(), dest, options).await
        } else {
            download(store, id.key(), dest).await.map(|_| ())
        }
    }

    async fn forget(&self, key: &str) -> Result<(), FileStoreError> {
        let owned = key.to_string();
        if let Some(bytes) = self.blocking(move |dir| cache_state::forget(dir, &owned)).await? {
            tracing::debug!(key, bytes, "dropped cached copy");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::node::CrashFlag;
    use crate::domain::TaskId;
    use crate::impls::LocalBackingStore;
    use crate::state::TaskStateRecord;
    use tokio::io::AsyncWriteExt;
    use ulid::Ulid;

    struct Fixture {
        dir: tempfile::TempDir,
        store: LocalBackingStore,
        journal: TaskJournal,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBackingStore::new(dir.path().join("store"));
        let state = TaskStateRecord::new(
            1,
            TaskId::from_ulid(Ulid::new()),
            "job",
            dir.path().join("tmp"),
            chrono::Utc::now(),
        );
        std::fs::create_dir_all(dir.path().join("tmp")).unwrap();
        let journal = TaskJournal::create(
            dir.path().join("state.json"),
            state,
            CrashFlag::new(),
            Arc::new(crate::ports::SystemClock),
        )
        .await
        .unwrap();
        Fixture {
            dir,
            store,
            journal,
        }
    }

    async fn put(store: &LocalBackingStore, data: &[u8]) -> FileIdentity {
        let (mut writer, key) = store.put_stream(Some("t")).await.unwrap();
        writer.write_all(data).await.unwrap();
        writer.shutdown().await.unwrap();
        FileIdentity::new(key, data.len() as u64)
    }

    #[tokio::test]
    async fn no_cache_always_downloads_a_copy() {
        let f = fixture().await;
        let id = put(&f.store, b"abc").await;
        let dest = f.dir.path().join("tmp/out");

        NoCache
            .fetch(&f.store, &f.journal, &id, &dest, &ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"abc");
        assert!(!std::fs::symlink_metadata(&dest).unwrap().file_type().is_symlink());
    }

    #[tokio::test]
    async fn node_cache_links_immutable_and_copies_mutable() {
        let f = fixture().await;
        let cache = NodeCache::new(f.dir.path().join("cache"), 1024);
        let id = put(&f.store, b"shared").await;

        let linked = f.dir.path().join("tmp/linked");
        cache
            .fetch(&f.store, &f.journal, &id, &linked, &ReadOptions::default())
            .await
            .unwrap();
        let own = f.dir.path().join("tmp/own");
        cache
            .fetch(&f.store, &f.journal, &id, &own, &ReadOptions::default().mutable(true))
            .await
            .unwrap();
        let sym = f.dir.path().join("tmp/sym");
        cache
            .fetch(&f.store, &f.journal, &id, &sym, &ReadOptions::default().symlink(true))
            .await
            .unwrap();

        std::fs::write(&own, b"changed").unwrap();
        assert_eq!(std::fs::read(&linked).unwrap(), b"shared");
        assert!(std::fs::symlink_metadata(&sym).unwrap().file_type().is_symlink());

        let state = cache_state::snapshot(cache.dir()).unwrap().unwrap();
        assert_eq!(state.used_bytes, 6);
        assert_eq!(state.reserved_bytes, 0);
        // The reservation guard is registered even though it was committed.
        assert_eq!(f.journal.deferred().await.len(), 1);
    }

    #[tokio::test]
    async fn over_quota_reads_bypass_the_cache() {
        let f = fixture().await;
        let cache = NodeCache::new(f.dir.path().join("cache"), 2);
        let id = put(&f.store, b"too big").await;
        let dest = f.dir.path().join("tmp/out");

        cache
            .fetch(&f.store, &f.journal, &id, &dest, &ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"too big");
        assert!(!cache_state::cached_file_path(cache.dir(), id.key()).exists());
    }

    #[tokio::test]
    async fn forget_drops_the_shared_copy() {
        let f = fixture().await;
        let cache = NodeCache::new(f.dir.path().join("cache"), 1024);
        let id = put(&f.store, b"x").await;
        let dest = f.dir.path().join("tmp/out");
        cache
            .fetch(&f.store, &f.journal, &id, &dest, &ReadOptions::default())
            .await
            .unwrap();

        cache.forget(id.key()).await.unwrap();
        assert!(!cache.is_cached(id.key()).await.unwrap());
        // Hard links outlive the cache entry.
        assert_eq!(std::fs::read(&dest).unwrap(), b"x");
    }
}
