//! Directory-backed `BackingStore`.
//!
//! Objects live under `<root>/objects/<key>`. Keys are `<hint>/<ulid>` or a
//! bare ULID; shared names map to `shared/<name>`. Good enough for a single
//! node, for tests, and for the CLI.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use url::Url;

use crate::domain::StoreError;
use crate::ports::{
    BackingStore, IdGenerator, ObjectReader, ObjectWriter, SystemClock, UlidGenerator,
};

const SHARED_PREFIX: &str = "shared";

pub struct LocalBackingStore {
    root: PathBuf,
    ids: Box<dyn IdGenerator>,
}

impl LocalBackingStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self::with_id_generator(root, UlidGenerator::new(SystemClock))
    }

    pub fn with_id_generator(root: impl AsRef<Path>, ids: impl IdGenerator + 'static) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            ids: Box::new(ids),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key to its on-disk path, refusing anything that could escape
    /// the objects directory.
    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(self.root.join("objects").join(relative))
    }

    fn new_key(&self, name_hint: Option<&str>) -> String {
        let ulid = self.ids.generate_ulid();
        match name_hint.map(sanitize_component) {
            Some(hint) if !hint.is_empty() => format!("{hint}/{ulid}"),
            _ => ulid.to_string(),
        }
    }

    async fn ensure_parent(&self, key: &str, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(key, e))?;
        }
        Ok(())
    }

    /// Copy `source` into `key`, going through a sibling temp name so the
    /// object appears in one rename.
    async fn install(&self, key: &str, source: &Path) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        self.ensure_parent(key, &path).await?;
        let staging = path.with_extension(format!("{}.importing", self.ids.generate_ulid()));
        fs::copy(source, &staging)
            .await
            .map_err(|e| StoreError::io(key, e))?;
        fs::rename(&staging, &path)
            .await
            .map_err(|e| StoreError::io(key, e))?;
        Ok(())
    }
}

fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

fn file_path_from_url(raw: &str) -> Result<PathBuf, StoreError> {
    let url = Url::parse(raw).map_err(|e| StoreError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if url.scheme() != "file" {
        return Err(StoreError::UnsupportedScheme(url.scheme().to_string()));
    }
    url.to_file_path().map_err(|()| StoreError::InvalidUrl {
        url: raw.to_string(),
        reason: "not a local file path".to_string(),
    })
}

#[async_trait]
impl BackingStore for LocalBackingStore {
    async fn put_stream(
        &self,
        name_hint: Option<&str>,
    ) -> Result<(ObjectWriter, String), StoreError> {
        let key = self.new_key(name_hint);
        let path = self.path_for(&key)?;
        self.ensure_parent(&key, &path).await?;
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::io(&key, e))?;
        tracing::debug!(key = %key, "opened object for writing");
        Ok((Box::new(file), key))
    }

    async fn get_stream(&self, key: &str) -> Result<ObjectReader, StoreError> {
        let path = self.path_for(key)?;
        match fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    async fn import_from_url(
        &self,
        url: &str,
        shared_name: Option<&str>,
    ) -> Result<String, StoreError> {
        let source = file_path_from_url(url)?;
        let key = match shared_name {
            Some(name) => format!("{SHARED_PREFIX}/{}", sanitize_component(name)),
            None => self.new_key(None),
        };
        self.install(&key, &source).await?;
        tracing::debug!(key = %key, url, "imported object");
        Ok(key)
    }

    async fn export_to_url(&self, key: &str, url: &str) -> Result<(), StoreError> {
        let source = self.path_for(key)?;
        let target = file_path_from_url(url)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(key, e))?;
        }
        match fs::copy(&source, &target).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !source.exists() => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(key, "deleted object");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    async fn delete_owned(&self, owner: &str) -> Result<(), StoreError> {
        let group = sanitize_component(owner);
        if group.is_empty() || group == SHARED_PREFIX {
            return Err(StoreError::NotFound(owner.to_string()));
        }
        let path = self.root.join("objects").join(&group);
        match fs::remove_dir_all(&path).await {
            Ok(()) => {
                tracing::debug!(owner = %group, "deleted owned objects");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(group, e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::io(key, e))
    }

    async fn size(&self, key: &str) -> Result<u64, StoreError> {
        let path = self.path_for(key)?;
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(StoreError::io(key, e)),
        }
    }
}
