//! The running task's side of its state record.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::node::CrashFlag;
use crate::deferred::DeferredFunction;
use crate::domain::FileStoreError;
use crate::ports::Clock;
use crate::state::{TaskStateRecord, record};

/// Owns the task's `state.json` while the task runs.
///
/// Every change is persisted before the call returns. A change that cannot be
/// persisted raises the node crash flag: the on-disk record no longer
/// describes the cleanup this task owes.
pub struct TaskJournal {
    path: PathBuf,
    state: Mutex<TaskStateRecord>,
    crash: CrashFlag,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TaskJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskJournal")
            .field("path", &self.path)
            .field("state", &self.state)
            .field("crash", &self.crash)
            .finish_non_exhaustive()
    }
}

impl TaskJournal {
    /// Write the initial record.
    pub async fn create(
        path: PathBuf,
        state: TaskStateRecord,
        crash: CrashFlag,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, FileStoreError> {
        record::write_async(path.clone(), state.clone()).await?;
        tracing::debug!(path = %path.display(), pid = state.pid, "task state record created");
        Ok(Self {
            path,
            state: Mutex::new(state),
            crash,
            clock,
        })
    }

    /// Append a deferred function and persist the record.
    pub async fn register(&self, function: DeferredFunction) -> Result<(), FileStoreError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.deferred.push(function);
        next.updated_at = self.clock.now();
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }

    /// Deferred functions in registration order.
    pub async fn deferred(&self) -> Vec<DeferredFunction> {
        self.state.lock().await.deferred.clone()
    }

    /// Persist an empty deferred list once the functions have run, so a
    /// sweep does not replay them.
    pub async fn clear_deferred(&self) -> Result<(), FileStoreError> {
        let mut state = self.state.lock().await;
        if state.deferred.is_empty() {
            return Ok(());
        }
        let mut next = state.clone();
        next.deferred.clear();
        next.updated_at = self.clock.now();
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }

    async fn persist(&self, next: &TaskStateRecord) -> Result<(), FileStoreError> {
        if let Err(e) = record::write_async(self.path.clone(), next.clone()).await {
            self.crash.set(format!(
                "could not persist task state {}: {e}",
                self.path.display()
            ));
            return Err(e.into());
        }
        Ok(())
    }
}
