//! weaver-filestore
//!
//! Worker-side file staging for Weaver tasks: moves files between a task's
//! scratch space and the shared backing store, and makes sure cleanup still
//! happens when the task's process dies.
//!
//! # Modules
//! - **domain**: ids, file identities, task descriptions, log records, errors
//! - **ports**: BackingStore, TaskController, ProcessProbe, Clock, IdGenerator
//! - **impls**: directory-backed store, in-memory controller, process probes
//! - **state**: atomic state records, task and cache records, file lock
//! - **stream**: size-tracked writer
//! - **deferred**: deferred functions and their handler registry
//! - **app**: node context, staging context, cache strategies, recovery sweep

pub mod app;
pub mod deferred;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod state;
pub mod stream;

pub use app::{FileStagingContext, FileStoreConfig, NodeContext, ReadOptions};
pub use deferred::{DeferredAction, DeferredFunction, DeferredRegistry};
pub use domain::{FileIdentity, FileStoreError, TaskDescription, TaskId, TaskOutcome};
