//! Node cache bookkeeping.
//!
//! Shared by every task on the node, so every change goes through
//! [`FileLock`] on `cache.lock`: lock, read-modify-write the record, unlock.
//! Downloads happen between `reserve` and `commit`, never under the lock.
//!
//! ```text
//! <workdir>/cache/
//!     cache.lock
//!     cache-state.json
//!     files/<encoded key>
//! ```

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::lock::FileLock;
use super::record;
use crate::domain::StateError;

const STATE_FILE: &str = "cache-state.json";
const LOCK_FILE: &str = "cache.lock";
const FILES_DIR: &str = "files";

pub fn cache_dir(workdir: &Path) -> PathBuf {
    workdir.join("cache")
}

pub fn state_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join(STATE_FILE)
}

pub fn files_dir(cache_dir: &Path) -> PathBuf {
    cache_dir.join(FILES_DIR)
}

/// Where the cached copy of `key` lives. Keys may contain `/` and anything
/// else, so every byte outside `[A-Za-z0-9_-]` is escaped as `%XX`.
pub fn cached_file_path(cache_dir: &Path, key: &str) -> PathBuf {
    let mut name = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-' => name.push(byte as char),
            _ => name.push_str(&format!("%{byte:02X}")),
        }
    }
    files_dir(cache_dir).join(name)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStateRecord {
    pub max_bytes: u64,
    pub used_bytes: u64,
    pub reserved_bytes: u64,
    /// Committed copies: key -> size.
    #[serde(default)]
    pub entries: BTreeMap<String, u64>,
    /// In-flight downloads by key.
    #[serde(default)]
    pub reservations: BTreeMap<String, OpenReservation>,
}

/// Room set aside for one download. The token tells a later reservation of
/// the same key apart from this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenReservation {
    pub token: Ulid,
    pub bytes: u64,
}

impl CacheStateRecord {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            ..Self::default()
        }
    }

    pub fn free_bytes(&self) -> u64 {
        self.max_bytes
            .saturating_sub(self.used_bytes)
            .saturating_sub(self.reserved_bytes)
    }
}

/// Result of asking the cache for room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The key is already committed.
    Cached,
    /// Room was set aside; the caller must `commit` or `release_reservation`.
    Reserved,
    /// Over quota, or another task is already downloading the key.
    Refused,
}

fn lock_cache(cache_dir: &Path) -> Result<FileLock, StateError> {
    let path = cache_dir.join(LOCK_FILE);
    FileLock::acquire(&path).map_err(|source| StateError::Io { path, source })
}

/// Run `f` on the record under the lock and persist the result.
fn update<R>(
    cache_dir: &Path,
    max_bytes: u64,
    f: impl FnOnce(&mut CacheStateRecord) -> R,
) -> Result<R, StateError> {
    let _guard = lock_cache(cache_dir)?;
    let path = state_path(cache_dir);
    let mut state = record::try_load(&path)?.unwrap_or_else(|| CacheStateRecord::new(max_bytes));
    let out = f(&mut state);
    record::write(&path, &state)?;
    Ok(out)
}

/// Create the cache layout if needed.
pub fn prepare(cache_dir: &Path) -> Result<(), StateError> {
    let files = files_dir(cache_dir);
    std::fs::create_dir_all(&files).map_err(|source| StateError::Io {
        path: files,
        source,
    })
}

/// Current record, without locking. Readers only ever see whole records.
pub fn snapshot(cache_dir: &Path) -> Result<Option<CacheStateRecord>, StateError> {
    record::try_load(&state_path(cache_dir))
}

/// Ask for `bytes` of room to download `key`, under `token`.
pub fn reserve(
    cache_dir: &Path,
    key: &str,
    token: Ulid,
    bytes: u64,
    max_bytes: u64,
) -> Result<Reservation, StateError> {
    update(cache_dir, max_bytes, |state| {
        if state.entries.contains_key(key) {
            return Reservation::Cached;
        }
        if state.reservations.contains_key(key) || bytes > state.free_bytes() {
            return Reservation::Refused;
        }
        state
            .reservations
            .insert(key.to_string(), OpenReservation { token, bytes });
        state.reserved_bytes += bytes;
        Reservation::Reserved
    })
}

/// Remove the reservation for `key` if it is still the one made under
/// `token`. Returns its size.
fn close_reservation(state: &mut CacheStateRecord, key: &str, token: Ulid) -> Option<u64> {
    let open = state.reservations.get(key).filter(|open| open.token == token)?;
    let bytes = open.bytes;
    state.reservations.remove(key);
    state.reserved_bytes = state.reserved_bytes.saturating_sub(bytes);
    Some(bytes)
}

/// Turn the reservation made under `token` into a committed entry of
/// `bytes` bytes.
pub fn commit(
    cache_dir: &Path,
    key: &str,
    token: Ulid,
    bytes: u64,
    max_bytes: u64,
) -> Result<(), StateError> {
    update(cache_dir, max_bytes, |state| {
        close_reservation(state, key, token);
        if let Some(previous) = state.entries.insert(key.to_string(), bytes) {
            state.used_bytes = state.used_bytes.saturating_sub(previous);
        }
        state.used_bytes += bytes;
    })
}

/// Give back a reservation that never committed. Only the reservation made
/// under `token` is touched: one already committed or released, or a newer
/// reservation of the same key, is left alone.
pub fn release_reservation(cache_dir: &Path, key: &str, token: Ulid) -> Result<(), StateError> {
    if !state_path(cache_dir).exists() {
        return Ok(());
    }
    let released = update(cache_dir, 0, |state| close_reservation(state, key, token))?;
    if let Some(bytes) = released {
        remove_file_if_present(&partial_path(cache_dir, key))?;
        tracing::debug!(key, bytes, %token, "released cache reservation");
    }
    Ok(())
}

/// Drop a committed copy. Returns the freed size, if the key was cached.
pub fn forget(cache_dir: &Path, key: &str) -> Result<Option<u64>, StateError> {
    if !state_path(cache_dir).exists() {
        return Ok(None);
    }
    let _guard = lock_cache(cache_dir)?;
    let path = state_path(cache_dir);
    let Some(mut state) = record::try_load::<CacheStateRecord>(&path)? else {
        return Ok(None);
    };
    let freed = state.entries.remove(key);
    if let Some(bytes) = freed {
        state.used_bytes = state.used_bytes.saturating_sub(bytes);
        record::write(&path, &state)?;
        remove_file_if_present(&cached_file_path(cache_dir, key))?;
    }
    Ok(freed)
}

/// Download target used while a reservation is open.
pub fn partial_path(cache_dir: &Path, key: &str) -> PathBuf {
    let mut path = cached_file_path(cache_dir, key).into_os_string();
    path.push(".partial");
    PathBuf::from(path)
}

fn remove_file_if_present(path: &Path) -> Result<(), StateError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StateError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_dir(dir.path());
        prepare(&cache).unwrap();
        (dir, cache)
    }

    #[test]
    fn reserve_commit_then_cached() {
        let (_dir, cache) = cache();
        let token = Ulid::new();
        assert_eq!(reserve(&cache, "a", token, 10, 100).unwrap(), Reservation::Reserved);
        let state = snapshot(&cache).unwrap().unwrap();
        assert_eq!(state.reserved_bytes, 10);
        assert_eq!(state.reservations["a"], OpenReservation { token, bytes: 10 });

        commit(&cache, "a", token, 10, 100).unwrap();
        let state = snapshot(&cache).unwrap().unwrap();
        assert_eq!((state.used_bytes, state.reserved_bytes), (10, 0));
        assert_eq!(reserve(&cache, "a", Ulid::new(), 10, 100).unwrap(), Reservation::Cached);
    }

    #[test]
    fn over_quota_and_duplicate_downloads_are_refused() {
        let (_dir, cache) = cache();
        let t = Ulid::new;
        assert_eq!(reserve(&cache, "big", t(), 101, 100).unwrap(), Reservation::Refused);
        assert_eq!(reserve(&cache, "a", t(), 60, 100).unwrap(), Reservation::Reserved);
        assert_eq!(reserve(&cache, "a", t(), 1, 100).unwrap(), Reservation::Refused);
        assert_eq!(reserve(&cache, "b", t(), 60, 100).unwrap(), Reservation::Refused);
        assert_eq!(reserve(&cache, "b", t(), 40, 100).unwrap(), Reservation::Reserved);
    }

    #[test]
    fn release_is_a_no_op_after_commit() {
        let (_dir, cache) = cache();
        let token = Ulid::new();
        reserve(&cache, "a", token, 10, 100).unwrap();
        commit(&cache, "a", token, 10, 100).unwrap();
        release_reservation(&cache, "a", token).unwrap();

        let state = snapshot(&cache).unwrap().unwrap();
        assert_eq!(state.used_bytes, 10);
        assert_eq!(state.entries.get("a"), Some(&10));
    }

    #[test]
    fn release_returns_the_space() {
        let (_dir, cache) = cache();
        let token = Ulid::new();
        reserve(&cache, "a", token, 70, 100).unwrap();
        std::fs::write(partial_path(&cache, "a"), b"half").unwrap();

        release_reservation(&cache, "a", token).unwrap();
        release_reservation(&cache, "a", token).unwrap();

        let state = snapshot(&cache).unwrap().unwrap();
        assert_eq!(state.free_bytes(), 100);
        assert!(!partial_path(&cache, "a").exists());
    }

    #[test]
    fn stale_release_leaves_a_newer_reservation_of_the_key_alone() {
        let (_dir, cache) = cache();
        let first = Ulid::new();
        reserve(&cache, "a", first, 10, 100).unwrap();
        commit(&cache, "a", first, 10, 100).unwrap();
        forget(&cache, "a").unwrap();

        // Same key, same size, different download.
        let second = Ulid::new();
        reserve(&cache, "a", second, 10, 100).unwrap();
        std::fs::write(partial_path(&cache, "a"), b"in flight").unwrap();

        release_reservation(&cache, "a", first).unwrap();
        let state = snapshot(&cache).unwrap().unwrap();
        assert_eq!(state.reservations["a"].token, second);
        assert_eq!(state.reserved_bytes, 10);
        assert!(partial_path(&cache, "a").exists());
    }

    #[test]
    fn forget_frees_the_entry_and_file() {
        let (_dir, cache) = cache();
        let token = Ulid::new();
        reserve(&cache, "k/1", token, 4, 100).unwrap();
        std::fs::write(cached_file_path(&cache, "k/1"), b"data").unwrap();
        commit(&cache, "k/1", token, 4, 100).unwrap();

        assert_eq!(forget(&cache, "k/1").unwrap(), Some(4));
        assert_eq!(forget(&cache, "k/1").unwrap(), None);
        assert!(!cached_file_path(&cache, "k/1").exists());
        assert_eq!(snapshot(&cache).unwrap().unwrap().used_bytes, 0);
    }

    #[test]
    fn cached_names_stay_inside_the_cache() {
        let path = cached_file_path(Path::new("/c"), "../x/y.z");
        assert_eq!(path, Path::new("/c/files/%2E%2E%2Fx%2Fy%2Ez"));
    }

    #[test]
    fn missing_cache_ignores_release_and_forget() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_dir(dir.path());
        release_reservation(&cache, "a", Ulid::new()).unwrap();
        assert_eq!(forget(&cache, "a").unwrap(), None);
    }
}
