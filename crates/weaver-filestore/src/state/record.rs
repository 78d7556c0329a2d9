//! Atomic state records.
//!
//! A record is any serde type persisted as one JSON file. Writes go to
//! `<path>.tmp` and are renamed over `<path>`, so a reader sees either the
//! old complete record or the new one, never a mix. Nothing here promises a
//! reader sees the *latest* record.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::StateError;

/// Sibling path used while a new record is being written.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Read a record.
///
/// A missing file is `StateError::Missing`; anything that does not parse,
/// including an empty or truncated file, is `StateError::Corrupt`. What a
/// missing record means is the caller's call.
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T, StateError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StateError::Missing {
                path: path.to_path_buf(),
            });
        }
        Err(source) => {
            return Err(StateError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&bytes).map_err(|source| StateError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Like `load`, but absence is `Ok(None)`. Corruption still fails.
pub fn try_load<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
    match load(path) {
        Ok(record) => Ok(Some(record)),
        Err(StateError::Missing { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Persist a record: write the temp sibling, fsync, rename over `path`.
pub fn write<T: Serialize>(path: &Path, record: &T) -> Result<(), StateError> {
    let io_err = |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    };
    let bytes = serde_json::to_vec_pretty(record).map_err(|source| StateError::Encode {
        path: path.to_path_buf(),
        source,
    })?;

    let tmp = temp_path(path);
    let mut file = File::create(&tmp).map_err(io_err)?;
    file.write_all(&bytes).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);

    fs::rename(&tmp, path).map_err(io_err)
}

/// `load` on the blocking pool.
pub async fn load_async<T>(path: PathBuf) -> Result<T, StateError>
where
    T: DeserializeOwned + Send + 'static,
{
    let for_err = path.clone();
    tokio::task::spawn_blocking(move || load(&path))
        .await
        .map_err(|e| join_error(for_err, e))?
}

/// `write` on the blocking pool.
pub async fn write_async<T>(path: PathBuf, record: T) -> Result<(), StateError>
where
    T: Serialize + Send + 'static,
{
    let for_err = path.clone();
    tokio::task::spawn_blocking(move || write(&path, &record))
        .await
        .map_err(|e| join_error(for_err, e))?
}

fn join_error(path: PathBuf, e: tokio::task::JoinError) -> StateError {
    StateError::Io {
        path,
        source: io::Error::other(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Snapshot {
        generation: u32,
        payload: Vec<String>,
    }

    fn snapshot(generation: u32) -> Snapshot {
        Snapshot {
            generation,
            payload: (0..generation).map(|i| format!("entry-{i}")).collect(),
        }
    }

    #[test]
    fn write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        write(&path, &snapshot(3)).unwrap();
        let back: Snapshot = load(&path).unwrap();
        assert_eq!(back, snapshot(3));
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn missing_is_not_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let err = load::<Snapshot>(&path).unwrap_err();
        assert!(matches!(err, StateError::Missing { .. }));
        assert!(try_load::<Snapshot>(&path).unwrap().is_none());
    }

    #[test]
    fn truncated_record_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write(&path, &snapshot(5)).unwrap();

        let full = fs::read(&path).unwrap();
        fs::write(&path, &full[..full.len() / 2]).unwrap();

        assert!(matches!(
            load::<Snapshot>(&path),
            Err(StateError::Corrupt { .. })
        ));
        assert!(try_load::<Snapshot>(&path).is_err());
    }

    #[test]
    fn empty_record_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"").unwrap();
        assert!(matches!(
            load::<Snapshot>(&path),
            Err(StateError::Corrupt { .. })
        ));
    }

    #[test]
    fn writer_killed_mid_temp_write_leaves_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write(&path, &snapshot(1)).unwrap();

        // A writer that died before its rename leaves half a temp file.
        let next = serde_json::to_vec_pretty(&snapshot(2)).unwrap();
        fs::write(temp_path(&path), &next[..next.len() / 3]).unwrap();

        let seen: Snapshot = load(&path).unwrap();
        assert_eq!(seen, snapshot(1));

        // The next writer simply overwrites the stale temp file.
        write(&path, &snapshot(2)).unwrap();
        assert_eq!(load::<Snapshot>(&path).unwrap(), snapshot(2));
    }

    #[test]
    fn concurrent_readers_never_see_a_torn_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write(&path, &snapshot(0)).unwrap();

        let writer_path = path.clone();
        let writer = std::thread::spawn(move || {
            for generation in 1..=200 {
                write(&writer_path, &snapshot(generation % 20)).unwrap();
            }
        });

        let mut reads = 0;
        while !writer.is_finished() || reads < 50 {
            let seen: Snapshot = load(&path).unwrap();
            assert_eq!(seen, snapshot(seen.generation));
            reads += 1;
        }
        writer.join().unwrap();
    }

    #[test]
    fn unencodable_record_is_not_reported_as_corrupt() {
        use std::collections::HashMap;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        // JSON object keys must be strings.
        let record: HashMap<(u8, u8), u8> = HashMap::from([((1, 2), 3)]);

        let err = write(&path, &record).unwrap_err();
        assert!(matches!(err, StateError::Encode { .. }));
        assert!(!path.exists());
    }
}
