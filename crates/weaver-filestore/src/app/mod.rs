//! App - the file store proper.
//!
//! Combines the ports into what a task and a node actually use.
//!
//! # Components
//! - **FileStoreConfig**: node configuration (TOML + `WEAVER_*` env)
//! - **NodeContext**: per-node shared state (write permits, crash flag, probe, registry)
//! - **FileStagingContext**: per-task file movement and finalization
//! - **LocalCache**: `NoCache` / `NodeCache` read strategies
//! - **recovery**: dead-task sweep, node shutdown, inspection

pub mod cache;
pub mod config;
pub mod context;
pub mod journal;
pub mod node;
pub mod recovery;

pub use self::cache::{LocalCache, NoCache, NodeCache, ReadOptions};
pub use self::config::FileStoreConfig;
pub use self::context::{
    CompletionHandle, FileStagingContext, GlobalWriteStream, Phase, release_job_files,
};
pub use self::journal::TaskJournal;
pub use self::node::{CrashFlag, NodeContext};
pub use self::recovery::{
    RecoveredTask, SweepReport, TaskSummary, UnresolvedTask, find_and_handle_dead_tasks, inspect,
    shutdown,
};
