//! File staging context: one per running task.
//!
//! Mediates between the task's temp dir and the backing store, and owns the
//! task's state record so that a crash at any point leaves enough on disk
//! for the recovery sweep.
//!
//! Lifecycle: `Open` -> `open()` -> `Running` -> `finish()` -> `Closed`.
//! File operations are only accepted while `Running`.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{OwnedSemaphorePermit, watch};

use super::cache::{self, LocalCache, ReadOptions};
use super::journal::TaskJournal;
use super::node::NodeContext;
use super::recovery::find_and_handle_dead_tasks;
use crate::deferred::{self, DeferredFunction};
use crate::domain::{
    FileIdentity, FileStoreError, LogLevel, LogRecord, PendingFileIdentity, StoreError,
    TaskCompletion, TaskDescription, TaskId, TaskOutcome, TaskReport,
};
use crate::ports::{BackingStore, ObjectReader, ObjectWriter, TaskController};
use crate::state::{TaskDir, TaskStateRecord};
use crate::stream::SizeTrackedStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Open,
    Running,
    Closed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Open => "open",
            Phase::Running => "running",
            Phase::Closed => "closed",
        }
    }
}

pub struct FileStagingContext {
    task: TaskDescription,
    node: Arc<NodeContext>,
    store: Arc<dyn BackingStore>,
    controller: Arc<dyn TaskController>,
    cache: Box<dyn LocalCache>,
    dir: TaskDir,
    phase: Phase,
    journal: Option<TaskJournal>,
    files_to_delete: Vec<String>,
    jobs_to_delete: Vec<TaskId>,
    cleanup_files: Vec<String>,
    failed_deferred: Vec<String>,
    local_files: HashMap<String, Vec<PathBuf>>,
    logs: Vec<LogRecord>,
    committed: Option<TaskCompletion>,
    done: watch::Sender<bool>,
}

impl FileStagingContext {
    /// Build a context for `task`, with the cache strategy the node is
    /// configured for.
    pub fn create(
        task: TaskDescription,
        node: Arc<NodeContext>,
        store: Arc<dyn BackingStore>,
        controller: Arc<dyn TaskController>,
    ) -> Self {
        let cache = cache::for_node(&node);
        Self::with_cache(task, node, store, controller, cache)
    }

    pub fn with_cache(
        task: TaskDescription,
        node: Arc<NodeContext>,
        store: Arc<dyn BackingStore>,
        controller: Arc<dyn TaskController>,
        cache: Box<dyn LocalCache>,
    ) -> Self {
        let dir = TaskDir::new(node.workdir(), task.task_id());
        let (done, _) = watch::channel(false);
        Self {
            task,
            node,
            store,
            controller,
            cache,
            dir,
            phase: Phase::Open,
            journal: None,
            files_to_delete: Vec::new(),
            jobs_to_delete: Vec::new(),
            cleanup_files: Vec::new(),
            failed_deferred: Vec::new(),
            local_files: HashMap::new(),
            logs: Vec::new(),
            committed: None,
            done,
        }
    }

    pub fn task(&self) -> &TaskDescription {
        &self.task
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.dir.temp_dir()
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.state_path()
    }

    pub fn cache_strategy(&self) -> &'static str {
        self.cache.name()
    }

    /// Recover tasks left behind by dead processes on this node, then create
    /// the task directory and the initial state record.
    pub async fn open(&mut self) -> Result<(), FileStoreError> {
        self.check_crash()?;
        if self.phase != Phase::Open {
            return Err(FileStoreError::InvalidTransition {
                operation: "open",
                state: self.phase.as_str(),
            });
        }
        match find_and_handle_dead_tasks(&self.node, Arc::clone(&self.store), false).await {
            Ok(report) if !report.recovered.is_empty() => {
                tracing::info!(
                    task_id = %self.task.task_id(),
                    recovered = report.recovered.len(),
                    failed_deferred = report.failed_deferred(),
                    "recovered dead tasks before opening"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "recovery sweep on open failed"),
        }
        let tasks_dir = self.node.tasks_dir();
        tokio::fs::create_dir_all(&tasks_dir)
            .await
            .map_err(|e| FileStoreError::io(&tasks_dir, e))?;
        tokio::fs::create_dir(self.dir.root())
            .await
            .map_err(|e| FileStoreError::io(self.dir.root(), e))?;
        let temp_dir = self.dir.temp_dir();
        tokio::fs::create_dir(&temp_dir)
            .await
            .map_err(|e| FileStoreError::io(&temp_dir, e))?;

        let state = TaskStateRecord::new(
            self.node.pid(),
            self.task.task_id(),
            self.task.job_name(),
            temp_dir,
            self.node.clock().now(),
        );
        let journal = TaskJournal::create(
            self.dir.state_path(),
            state,
            self.node.crash_flag().clone(),
            Arc::clone(self.node.clock()),
        )
        .await?;
        self.journal = Some(journal);
        self.phase = Phase::Running;
        tracing::debug!(
            task_id = %self.task.task_id(),
            job = self.task.job_name(),
            "file store open"
        );
        Ok(())
    }

    fn check_crash(&self) -> Result<(), FileStoreError> {
        match self.node.crash_flag().reason() {
            Some(reason) => Err(FileStoreError::Aborted(reason.to_string())),
            None => Ok(()),
        }
    }

    fn ensure_running(&self, operation: &'static str) -> Result<&TaskJournal, FileStoreError> {
        self.check_crash()?;
        match (&self.journal, self.phase) {
            (Some(journal), Phase::Running) => Ok(journal),
            _ => Err(FileStoreError::NotRunning { operation }),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.dir.temp_dir().join(path)
        }
    }

    fn remember_local(&mut self, key: &str, path: PathBuf) {
        self.local_files
            .entry(key.to_string())
            .or_default()
            .push(path);
    }

    fn fresh_name(&self, prefix: &str, suffix: &str) -> PathBuf {
        let ulid = self.node.ids().generate_ulid();
        self.dir.temp_dir().join(format!("{prefix}{ulid}{suffix}"))
    }

    // ----- local temp space -----

    /// A new empty directory inside the temp dir.
    pub async fn local_temp_dir(&self) -> Result<PathBuf, FileStoreError> {
        self.ensure_running("local_temp_dir")?;
        let path = self.fresh_name("t", "");
        tokio::fs::create_dir(&path)
            .await
            .map_err(|e| FileStoreError::io(&path, e))?;
        Ok(path)
    }

    /// A new empty file inside the temp dir.
    pub async fn local_temp_file(&self) -> Result<PathBuf, FileStoreError> {
        self.ensure_running("local_temp_file")?;
        let path = self.fresh_name("tmp", ".tmp");
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| FileStoreError::io(&path, e))?;
        Ok(path)
    }

    /// A path inside the temp dir that does not exist right now. Nothing
    /// stops another writer from taking it before the caller does.
    pub async fn local_temp_file_name(&self) -> Result<PathBuf, FileStoreError> {
        let path = self.local_temp_file().await?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| FileStoreError::io(&path, e))?;
        Ok(path)
    }

    // ----- global files -----

    async fn write_permit(&self) -> Result<OwnedSemaphorePermit, FileStoreError> {
        Arc::clone(self.node.write_permits())
            .acquire_owned()
            .await
            .map_err(|_| FileStoreError::Aborted("write semaphore closed".to_string()))
    }

    /// Cleanup objects are grouped under the task that owns them, so
    /// retiring the job can drop them in one go.
    fn owner_hint(&self, cleanup: bool) -> Option<String> {
        cleanup.then(|| self.task.task_id().to_string())
    }

    /// Upload a local file. Relative paths resolve against the temp dir.
    /// With `cleanup`, the object belongs to this task's job and is deleted
    /// when the job is retired (see [`release_job_files`]).
    pub async fn write_global_file(
        &mut self,
        path: impl AsRef<Path>,
        cleanup: bool,
    ) -> Result<FileIdentity, FileStoreError> {
        self.ensure_running("write_global_file")?;
        let path = self.resolve(path.as_ref());
        let _permit = self.write_permit().await?;

        let mut source = tokio::fs::File::open(&path)
            .await
            .map_err(|e| FileStoreError::io(&path, e))?;
        let hint = self.owner_hint(cleanup);
        let (mut writer, key) = self.store.put_stream(hint.as_deref()).await?;
        tokio::io::copy(&mut source, &mut writer)
            .await
            .map_err(|e| StoreError::io(&key, e))?;
        writer.shutdown().await.map_err(|e| StoreError::io(&key, e))?;

        let id = FileIdentity::for_path(key, &path)
            .await
            .map_err(|e| FileStoreError::io(&path, e))?;
        if cleanup {
            self.cleanup_files.push(id.key().to_string());
        }
        self.remember_local(id.key(), path);
        tracing::debug!(key = %id, size = id.size(), "wrote global file");
        Ok(id)
    }

    /// Open a streaming upload. The caller writes into the returned stream
    /// and ends it with [`GlobalWriteStream::finish`].
    pub async fn write_global_file_stream(
        &mut self,
        cleanup: bool,
    ) -> Result<GlobalWriteStream, FileStoreError> {
        self.ensure_running("write_global_file_stream")?;
        let permit = self.write_permit().await?;
        let hint = self.owner_hint(cleanup);
        let (writer, key) = self.store.put_stream(hint.as_deref()).await?;
        if cleanup {
            self.cleanup_files.push(key.clone());
        }
        Ok(GlobalWriteStream::new(writer, key, permit))
    }

    /// Materialize a global file locally and return its path.
    pub async fn read_global_file(
        &mut self,
        id: &FileIdentity,
        options: ReadOptions,
    ) -> Result<PathBuf, FileStoreError> {
        let journal = self.ensure_running("read_global_file")?;
        let dest = match &options.user_path {
            Some(path) => {
                let dest = self.resolve(path);
                if tokio::fs::try_exists(&dest).await.unwrap_or(true) {
                    return Err(FileStoreError::DestinationExists(dest));
                }
                dest
            }
            None => self.fresh_name("tmp", ".tmp"),
        };
        self.cache
            .fetch(self.store.as_ref(), journal, id, &dest, &options)
            .await?;
        self.remember_local(id.key(), dest.clone());
        tracing::debug!(
            key = %id,
            path = %dest.display(),
            cache = self.cache.name(),
            "read global file"
        );
        Ok(dest)
    }

    /// Stream a global file from offset 0.
    pub async fn read_global_file_stream(
        &self,
        id: &FileIdentity,
    ) -> Result<ObjectReader, FileStoreError> {
        self.ensure_running("read_global_file_stream")?;
        Ok(self.store.get_stream(id.key()).await?)
    }

    /// Remove every local copy this task made of `id`. The backing store
    /// is not touched.
    pub async fn delete_local_file(&mut self, id: &FileIdentity) -> Result<(), FileStoreError> {
        self.ensure_running("delete_local_file")?;
        let paths = self
            .local_files
            .remove(id.key())
            .ok_or_else(|| FileStoreError::NotLocal(id.key().to_string()))?;
        for path in paths {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(FileStoreError::io(&path, e)),
            }
        }
        Ok(())
    }

    /// Drop local copies now and schedule the global object for deletion
    /// once the task has succeeded.
    pub async fn delete_global_file(&mut self, id: &FileIdentity) -> Result<(), FileStoreError> {
        match self.delete_local_file(id).await {
            Ok(()) | Err(FileStoreError::NotLocal(_)) => {}
            Err(e) => return Err(e),
        }
        self.cache.forget(id.key()).await?;
        if !self.files_to_delete.iter().any(|k| k == id.key()) {
            self.files_to_delete.push(id.key().to_string());
        }
        Ok(())
    }

    pub async fn import_file(
        &self,
        url: &str,
        shared_name: Option<&str>,
    ) -> Result<FileIdentity, FileStoreError> {
        self.ensure_running("import_file")?;
        let key = self.store.import_from_url(url, shared_name).await?;
        let size = self.store.size(&key).await?;
        Ok(FileIdentity::new(key, size))
    }

    pub async fn export_file(&self, id: &FileIdentity, url: &str) -> Result<(), FileStoreError> {
        self.ensure_running("export_file")?;
        Ok(self.store.export_to_url(id.key(), url).await?)
    }

    // ----- deferred functions, logging, scheduling -----

    /// Record a deferred function. It is on disk before this returns.
    pub async fn register_deferred_function(
        &self,
        function: DeferredFunction,
    ) -> Result<(), FileStoreError> {
        let journal = self.ensure_running("register_deferred_function")?;
        journal.register(function).await
    }

    /// Log through `tracing` now and buffer the message for the controller.
    pub fn log_to_controller(
        &mut self,
        text: impl Into<String>,
        level: LogLevel,
    ) -> Result<(), FileStoreError> {
        self.ensure_running("log_to_controller")?;
        let record = LogRecord::new(text, level);
        record.emit(self.task.job_name());
        self.logs.push(record);
        Ok(())
    }

    /// Ask the scheduler to drop another task once this one has committed.
    pub fn schedule_job_deletion(&mut self, task_id: TaskId) -> Result<(), FileStoreError> {
        self.ensure_running("schedule_job_deletion")?;
        self.jobs_to_delete.push(task_id);
        Ok(())
    }

    // ----- finalization -----

    /// Run deferred functions, commit to the controller and remove the task
    /// directory.
    pub async fn finish(&mut self, outcome: TaskOutcome) -> Result<TaskReport, FileStoreError> {
        self.check_crash()?;
        let Some(journal) = self.journal.as_ref().filter(|_| self.phase == Phase::Running) else {
            return Err(FileStoreError::InvalidTransition {
                operation: "finish",
                state: self.phase.as_str(),
            });
        };

        let functions = journal.deferred().await;
        let env = self.node.deferred_env(Arc::clone(&self.store));
        self.failed_deferred = deferred::run_deferred_functions(&functions, &env).await;
        journal.clear_deferred().await?;

        let completion = match self.committed.clone() {
            Some(completion) => completion,
            None => self.update_job_when_done(outcome.is_success()).await?,
        };

        match tokio::fs::remove_dir_all(self.dir.root()).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(FileStoreError::io(self.dir.root(), e)),
        }
        self.journal = None;
        self.phase = Phase::Closed;
        tracing::info!(
            task_id = %self.task.task_id(),
            job = self.task.job_name(),
            succeeded = completion.succeeded,
            failed_deferred = completion.failed_deferred.len(),
            "task finished"
        );

        Ok(TaskReport {
            completion,
            logs: std::mem::take(&mut self.logs),
            temp_dir: self.dir.temp_dir(),
        })
    }

    /// Commit the task's completion and buffered logs. After a successful
    /// task, the objects passed to `delete_global_file` are deleted and the
    /// jobs passed to `schedule_job_deletion` are retired. This task's own
    /// cleanup objects stay until its job is retired. Downstream waiters are
    /// released last.
    pub async fn update_job_when_done(
        &mut self,
        succeeded: bool,
    ) -> Result<TaskCompletion, FileStoreError> {
        self.ensure_running("update_job_when_done")?;
        if self.committed.is_some() {
            return Err(FileStoreError::InvalidTransition {
                operation: "update_job_when_done",
                state: "committed",
            });
        }
        let completion = TaskCompletion {
            task_id: self.task.task_id(),
            job_name: self.task.job_name().to_string(),
            succeeded,
            files_to_delete: self.files_to_delete.clone(),
            jobs_to_delete: self.jobs_to_delete.clone(),
            cleanup_files: self.cleanup_files.clone(),
            failed_deferred: self.failed_deferred.clone(),
            finished_at: self.node.clock().now(),
        };
        self.controller
            .commit(completion.clone(), self.logs.clone())
            .await
            .map_err(FileStoreError::Commit)?;
        self.committed = Some(completion.clone());

        if succeeded {
            for key in &self.files_to_delete {
                if let Err(e) = self.store.delete(key).await {
                    tracing::error!(key = %key, error = %e, "failed to delete global file");
                }
            }
            for job in &self.jobs_to_delete {
                if let Err(e) = release_job_files(self.store.as_ref(), *job).await {
                    tracing::error!(job = %job, error = %e, "failed to release job files");
                }
            }
        }
        self.done.send_replace(true);
        Ok(completion)
    }

    /// Handle a downstream task can wait on until this task has committed.
    pub fn completion_handle(&self) -> CompletionHandle {
        CompletionHandle {
            rx: self.done.subscribe(),
        }
    }

    /// Future resolving once this task has committed.
    pub fn block_fn(
        &self,
    ) -> impl std::future::Future<Output = Result<(), FileStoreError>> + Send + 'static {
        self.completion_handle().wait()
    }
}

/// Retire a job's files: delete every object its task wrote with
/// `cleanup = true`. Run for each entry of a successful completion's
/// `jobs_to_delete`; a scheduler retiring jobs itself calls it directly.
pub async fn release_job_files(
    store: &dyn BackingStore,
    task_id: TaskId,
) -> Result<(), StoreError> {
    store.delete_owned(&task_id.to_string()).await?;
    tracing::debug!(job = %task_id, "released job files");
    Ok(())
}

impl std::fmt::Debug for FileStagingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStagingContext")
            .field("task_id", &self.task.task_id())
            .field("phase", &self.phase)
            .field("cache", &self.cache.name())
            .finish_non_exhaustive()
    }
}

/// Waits for a task's completion to be committed.
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    rx: watch::Receiver<bool>,
}

impl CompletionHandle {
    pub fn is_done(&self) -> bool {
        *self.rx.borrow()
    }

    /// Errors if the context went away without committing.
    pub async fn wait(mut self) -> Result<(), FileStoreError> {
        self.rx
            .wait_for(|done| *done)
            .await
            .map(|_| ())
            .map_err(|_| FileStoreError::Aborted("task ended without committing".to_string()))
    }
}

/// Streaming upload into the backing store.
///
/// Tracks its size as bytes go through: `file_id()` can be read at any time.
/// `shutdown` only flushes; the object is completed by `finish`. Dropping the
/// stream without finishing releases the write permit and leaves the partial
/// object to the store.
pub struct GlobalWriteStream {
    inner: SizeTrackedStream<ObjectWriter>,
    pending: PendingFileIdentity,
    _permit: OwnedSemaphorePermit,
}

impl GlobalWriteStream {
    fn new(writer: ObjectWriter, key: String, permit: OwnedSemaphorePermit) -> Self {
        let pending = PendingFileIdentity::new(key);
        let mut inner = SizeTrackedStream::new(writer);
        let counter = pending.clone();
        inner.on_write(move |written| counter.add(written));
        Self {
            inner,
            pending,
            _permit: permit,
        }
    }

    /// Identity of the object being written, sized so far.
    pub fn file_id(&self) -> &PendingFileIdentity {
        &self.pending
    }

    /// Register another listener on the underlying size-tracked stream.
    pub fn on_write(&mut self, listener: impl FnMut(usize) + Send + 'static) {
        self.inner.on_write(listener);
    }

    pub async fn write_lines<I, B>(&mut self, chunks: I) -> io::Result<()>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        self.inner.write_lines(chunks).await
    }

    /// Close the backing stream and return the final identity.
    pub async fn finish(mut self) -> Result<FileIdentity, FileStoreError> {
        let key = self.pending.key().to_string();
        self.inner
            .shutdown()
            .await
            .map_err(|e| StoreError::io(&key, e))?;
        let id = self.pending.snapshot();
        tracing::debug!(key = %id, size = id.size(), "streamed global file");
        Ok(id)
    }
}

impl AsyncWrite for GlobalWriteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }
}

impl std::fmt::Debug for GlobalWriteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalWriteStream")
            .field("key", &self.pending.key())
            .field("size", &self.pending.size())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::FileStoreConfig;
    use crate::impls::{InMemoryController, LocalBackingStore};
    use tokio::io::AsyncReadExt;

    struct Harness {
        _dir: tempfile::TempDir,
        node: Arc<NodeContext>,
        store: Arc<LocalBackingStore>,
        controller: Arc<InMemoryController>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = FileStoreConfig::new(dir.path().join("work"));
        Harness {
            node: Arc::new(NodeContext::from_config(&config)),
            store: Arc::new(LocalBackingStore::new(dir.path().join("store"))),
            controller: Arc::new(InMemoryController::new()),
            _dir: dir,
        }
    }

    impl Harness {
        fn context(&self, command: &str) -> FileStagingContext {
            let task = TaskDescription::new(self.node.ids().generate_task_id(), "t", command);
            FileStagingContext::create(
                task,
                Arc::clone(&self.node),
                self.store.clone(),
                self.controller.clone(),
            )
        }

        async fn running(&self) -> FileStagingContext {
            let mut ctx = self.context("_toil job");
            ctx.open().await.unwrap();
            ctx
        }
    }

    #[tokio::test]
    async fn operations_before_open_are_usage_errors() {
        let h = harness();
        let mut ctx = h.context("_toil job");
        let err = ctx.local_temp_file().await.unwrap_err();
        assert!(matches!(
            err,
            FileStoreError::NotRunning {
                operation: "local_temp_file"
            }
        ));
        assert!(ctx.log_to_controller("x", LogLevel::Info).is_err());
        assert!(matches!(
            ctx.finish(TaskOutcome::Succeeded).await,
            Err(FileStoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn open_writes_state_record_with_our_pid() {
        let h = harness();
        let ctx = h.running().await;
        let state: TaskStateRecord = crate::state::record::load(&ctx.state_path()).unwrap();
        assert_eq!(state.pid, std::process::id());
        assert_eq!(state.job_name, "job");
        assert!(ctx.temp_dir().is_dir());
        assert_eq!(ctx.cache_strategy(), "none");
    }

    #[tokio::test]
    async fn temp_entries_live_under_the_temp_dir() {
        let h = harness();
        let ctx = h.running().await;

        let dir = ctx.local_temp_dir().await.unwrap();
        let file = ctx.local_temp_file().await.unwrap();
        let name = ctx.local_temp_file_name().await.unwrap();

        for path in [&dir, &file, &name] {
            assert!(path.starts_with(ctx.temp_dir()));
        }
        assert!(dir.is_dir());
        assert!(file.is_file());
        assert!(!name.exists());
        assert_ne!(file, name);
    }

    #[tokio::test]
    async fn write_then_read_global_file() {
        let h = harness();
        let mut ctx = h.running().await;
        tokio::fs::write(ctx.temp_dir().join("in.txt"), b"hello")
            .await
            .unwrap();

        let id = ctx.write_global_file("in.txt", false).await.unwrap();
        assert_eq!(id.size(), 5);

        let path = ctx
            .read_global_file(&id, ReadOptions::default())
            .await
            .unwrap();
        assert!(path.starts_with(ctx.temp_dir()));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello");

        let mut reader = ctx.read_global_file_stream(&id).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn read_refuses_existing_destination() {
        let h = harness();
        let mut ctx = h.running().await;
        let file = ctx.local_temp_file().await.unwrap();
        let id = ctx.write_global_file(&file, false).await.unwrap();

        let err = ctx
            .read_global_file(&id, ReadOptions::default().to(&file))
            .await
            .unwrap_err();
        assert!(matches!(err, FileStoreError::DestinationExists(p) if p == file));
    }

    #[tokio::test]
    async fn streamed_write_tracks_size() {
        let h = harness();
        let mut ctx = h.running().await;

        let mut stream = ctx.write_global_file_stream(false).await.unwrap();
        let pending = stream.file_id().clone();
        assert_eq!(pending.size(), 0);
        stream.write_all(b"abc").await.unwrap();
        stream.write_lines(["de", "f"]).await.unwrap();
        stream.shutdown().await.unwrap();
        assert_eq!(pending.size(), 6);

        let id = stream.finish().await.unwrap();
        assert_eq!(id.size(), 6);
        assert_eq!(h.store.size(id.key()).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn write_permit_is_released_after_streaming() {
        let h = harness();
        let mut ctx = h.running().await;
        let permits = h.node.write_permits().available_permits();

        let stream = ctx.write_global_file_stream(false).await.unwrap();
        assert_eq!(h.node.write_permits().available_permits(), permits - 1);
        drop(stream);
        assert_eq!(h.node.write_permits().available_permits(), permits);
    }

    #[tokio::test]
    async fn delete_local_file_requires_a_local_copy() {
        let h = harness();
        let mut ctx = h.running().await;
        let id = FileIdentity::new("elsewhere", 1);
        assert!(matches!(
            ctx.delete_local_file(&id).await,
            Err(FileStoreError::NotLocal(k)) if k == "elsewhere"
        ));
    }

    #[tokio::test]
    async fn crash_flag_aborts_operations() {
        let h = harness();
        let ctx = h.running().await;
        h.node.crash_flag().set("test");
        assert!(matches!(
            ctx.local_temp_file().await,
            Err(FileStoreError::Aborted(_))
        ));
    }

    #[tokio::test]
    async fn finish_commits_and_removes_the_task_dir() {
        let h = harness();
        let mut ctx = h.running().await;
        let handle = ctx.completion_handle();
        let downstream = tokio::spawn(ctx.block_fn());
        ctx.log_to_controller("hello controller", LogLevel::Warn)
            .unwrap();
        let other = h.node.ids().generate_task_id();
        ctx.schedule_job_deletion(other).unwrap();

        let report = ctx.finish(TaskOutcome::Succeeded).await.unwrap();
        assert!(report.completion.succeeded);
        assert_eq!(report.completion.jobs_to_delete, vec![other]);
        assert_eq!(report.logs[0].text, "hello controller");
        assert!(!report.temp_dir.exists());
        assert_eq!(ctx.phase(), Phase::Closed);
        assert!(handle.is_done());
        downstream.await.unwrap().unwrap();

        let committed = h.controller.commit_for(ctx.task().task_id()).await.unwrap();
        assert_eq!(committed.logs.len(), 1);
        assert!(matches!(
            ctx.local_temp_file().await,
            Err(FileStoreError::NotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn dropped_context_fails_waiters() {
        let h = harness();
        let ctx = h.running().await;
        let waiter = ctx.block_fn();
        drop(ctx);
        assert!(matches!(waiter.await, Err(FileStoreError::Aborted(_))));
    }
}
