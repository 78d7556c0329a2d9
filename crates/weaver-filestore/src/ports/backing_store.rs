//! BackingStore port - the shared object store behind every task.
//!
//! Keys are opaque strings chosen by the store. Sizes are tracked by the
//! file store, not here. Concurrency safety of single-key reads and writes is
//! the store's job.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::domain::StoreError;

pub type ObjectWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Open a writer for a new object. The key is assigned up front; the
    /// object is complete once the writer has been shut down.
    ///
    /// `name_hint` lets the store group objects (for example by owning task).
    async fn put_stream(
        &self,
        name_hint: Option<&str>,
    ) -> Result<(ObjectWriter, String), StoreError>;

    /// Open a reader positioned at the start of the object.
    async fn get_stream(&self, key: &str) -> Result<ObjectReader, StoreError>;

    /// Copy the object at `url` into the store. With `shared_name` the
    /// object is installed under that well-known name, atomically replacing
    /// any previous one.
    async fn import_from_url(
        &self,
        url: &str,
        shared_name: Option<&str>,
    ) -> Result<String, StoreError>;

    async fn export_to_url(&self, key: &str, url: &str) -> Result<(), StoreError>;

    /// Delete an object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Delete every object written with `name_hint == owner`. Nothing owned
    /// is not an error.
    async fn delete_owned(&self, owner: &str) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Size of a stored object in bytes.
    async fn size(&self, key: &str) -> Result<u64, StoreError>;
}
