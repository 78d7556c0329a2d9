//! Node context: everything tasks on one node share.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tokio::sync::{Notify, Semaphore};

use super::config::FileStoreConfig;
use crate::deferred::{DeferredEnv, DeferredRegistry};
use crate::impls::SignalProbe;
use crate::ports::{BackingStore, Clock, IdGenerator, ProcessProbe, SystemClock, UlidGenerator};
use crate::state::{cache_state, task_state};

/// Set once when the node can no longer keep its state consistent. Every
/// file store operation checks it and refuses to continue. Never resets.
#[derive(Debug, Clone, Default)]
pub struct CrashFlag {
    inner: Arc<CrashFlagInner>,
}

#[derive(Debug, Default)]
struct CrashFlagInner {
    reason: OnceLock<String>,
    notify: Notify,
}

impl CrashFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. The first reason sticks.
    pub fn set(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.inner.reason.set(reason.clone()).is_ok() {
            tracing::error!(%reason, "node crash flag set");
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.inner.reason.get().is_some()
    }

    pub fn reason(&self) -> Option<&str> {
        self.inner.reason.get().map(String::as_str)
    }

    /// Resolve once the flag is set.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Per-node owner of shared concurrency state. Passed explicitly to every
/// staging context and to the recovery sweep.
pub struct NodeContext {
    workdir: PathBuf,
    pid: u32,
    caching: bool,
    cache_max_bytes: u64,
    write_permits: Arc<Semaphore>,
    crash: CrashFlag,
    probe: Arc<dyn ProcessProbe>,
    registry: Arc<DeferredRegistry>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl NodeContext {
    pub fn from_config(config: &FileStoreConfig) -> Self {
        Self {
            workdir: config.workdir.clone(),
            pid: std::process::id(),
            caching: config.caching,
            cache_max_bytes: config.cache_max_bytes,
            write_permits: Arc::new(Semaphore::new(config.max_concurrent_writes)),
            crash: CrashFlag::new(),
            probe: Arc::new(SignalProbe),
            registry: Arc::new(DeferredRegistry::new()),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_registry(mut self, registry: DeferredRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Pid recorded as the owner of task records. Defaults to this process.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn tasks_dir(&self) -> PathBuf {
        task_state::tasks_dir(&self.workdir)
    }

    pub fn cache_dir(&self) -> PathBuf {
        cache_state::cache_dir(&self.workdir)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn caching(&self) -> bool {
        self.caching
    }

    pub fn cache_max_bytes(&self) -> u64 {
        self.cache_max_bytes
    }

    pub fn write_permits(&self) -> &Arc<Semaphore> {
        &self.write_permits
    }

    pub fn crash_flag(&self) -> &CrashFlag {
        &self.crash
    }

    pub fn probe(&self) -> &dyn ProcessProbe {
        self.probe.as_ref()
    }

    pub fn registry(&self) -> &Arc<DeferredRegistry> {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn ids(&self) -> &dyn IdGenerator {
        self.ids.as_ref()
    }

    /// What deferred functions get to touch when run on this node.
    pub fn deferred_env(&self, store: Arc<dyn BackingStore>) -> DeferredEnv {
        DeferredEnv {
            store,
            registry: Arc::clone(&self.registry),
            cache_dir: self.cache_dir(),
        }
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("workdir", &self.workdir)
            .field("pid", &self.pid)
            .field("caching", &self.caching)
            .field("crashed", &self.crash.is_set())
            .finish_non_exhaustive()
    }
}
