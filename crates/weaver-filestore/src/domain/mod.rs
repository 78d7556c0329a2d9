//! Domain model: ids, file identities, task descriptions, log records, errors.

pub mod errors;
pub mod file_id;
pub mod ids;
pub mod log;
pub mod task;

pub use errors::{
    ConfigError, DeferredError, FileStoreError, RegistryError, StateError, StoreError,
};
pub use file_id::{FileIdentity, PendingFileIdentity};
pub use ids::TaskId;
pub use log::{LogLevel, LogRecord};
pub use task::{TaskCompletion, TaskDescription, TaskOutcome, TaskReport};
