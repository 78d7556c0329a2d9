//! Dead-task recovery sweep and node shutdown.
//!
//! A task whose process died still has its state record on disk. The sweep
//! finds those records, claims each by renaming it to
//! `state.recovering-<our pid>.json` (only one sweeper wins the rename),
//! replays the deferred functions in order and removes the task directory.
//! Progress is persisted after every function, so a sweeper that dies
//! mid-way is picked up by the next one where it stopped.
//!
//! A record holding a function this process cannot run (no handler
//! registered for it here) is handed back untouched, to be recovered by a
//! process that has the handler.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use super::node::NodeContext;
use crate::deferred::{DeferredEnv, run_deferred_functions};
use crate::domain::{FileStoreError, StateError, TaskId};
use crate::ports::BackingStore;
use crate::state::{TaskDir, TaskStateRecord, record, task_state};

#[derive(Debug, Clone, Serialize)]
pub struct RecoveredTask {
    pub task_id: TaskId,
    pub job_name: String,
    /// Pid of the process that left the record behind.
    pub pid: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_deferred: Vec<String>,
}

/// A dead task left in place because its deferred functions need handlers
/// this process does not have.
#[derive(Debug, Clone, Serialize)]
pub struct UnresolvedTask {
    pub dir: PathBuf,
    pub task_id: TaskId,
    pub pid: u32,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub recovered: Vec<RecoveredTask>,
    /// Task directories left alone because their owner is alive.
    pub live: Vec<PathBuf>,
    /// Records that could not be parsed. Left in place for an operator.
    pub corrupt: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unresolved: Vec<UnresolvedTask>,
}

impl SweepReport {
    pub fn failed_deferred(&self) -> usize {
        self.recovered
            .iter()
            .map(|t| t.failed_deferred.len())
            .sum()
    }

    fn note_corrupt(&mut self, path: PathBuf, source: &serde_json::Error) {
        tracing::error!(path = %path.display(), error = %source, "corrupt task state record");
        self.corrupt.push(path);
    }
}

/// What a task directory currently holds.
#[derive(Debug)]
enum Holder {
    /// `state.json`, owned by the task process.
    Owner(PathBuf),
    /// `state.recovering-<pid>.json`, claimed by a sweeper.
    Claimer(PathBuf, u32),
}

async fn holders(dir: &Path) -> Result<Vec<Holder>, FileStoreError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(FileStoreError::io(dir, e)),
    };
    let mut found = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| FileStoreError::io(dir, e))?
    {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if task_state::is_state_file(name) {
            found.push(Holder::Owner(entry.path()));
        } else if let Some(pid) = task_state::claimer_pid(name) {
            found.push(Holder::Claimer(entry.path(), pid));
        }
    }
    Ok(found)
}

async fn task_dirs(node: &NodeContext) -> Result<Vec<PathBuf>, FileStoreError> {
    let tasks_dir = node.tasks_dir();
    let mut entries = match tokio::fs::read_dir(&tasks_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(FileStoreError::io(&tasks_dir, e)),
    };
    let mut dirs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| FileStoreError::io(&tasks_dir, e))?
    {
        let is_dir = entry
            .file_type()
            .await
            .map_err(|e| FileStoreError::io(entry.path(), e))?
            .is_dir();
        if is_dir {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

enum Recovery {
    Recovered(RecoveredTask),
    /// Another sweeper claimed the record first.
    LostRace,
    Unresolved(UnresolvedTask),
}

/// Whether the process `pid` has given up its claim on a record.
fn abandoned(node: &NodeContext, pid: u32, batch_system_shutdown: bool) -> bool {
    if pid == node.pid() {
        return false;
    }
    batch_system_shutdown || !node.probe().is_alive(pid)
}

/// Find task records whose process is gone and run their deferred functions.
///
/// With `batch_system_shutdown`, every record not owned by this process is
/// treated as dead.
pub async fn find_and_handle_dead_tasks(
    node: &NodeContext,
    store: Arc<dyn BackingStore>,
    batch_system_shutdown: bool,
) -> Result<SweepReport, FileStoreError> {
    let env = node.deferred_env(store);
    let mut report = SweepReport::default();

    for dir in task_dirs(node).await? {
        for holder in holders(&dir).await? {
            let (path, pid) = match holder {
                Holder::Owner(path) => {
                    match record::load_async::<TaskStateRecord>(path.clone()).await {
                        Ok(state) => (path, state.pid),
                        Err(StateError::Missing { .. }) => continue,
                        Err(StateError::Corrupt { path, source }) => {
                            report.note_corrupt(path, &source);
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Holder::Claimer(path, pid) => (path, pid),
            };

            if !abandoned(node, pid, batch_system_shutdown) {
                tracing::debug!(dir = %dir.display(), pid, "task owner alive");
                report.live.push(dir.clone());
                continue;
            }

            match recover(node, &env, &dir, &path).await {
                Ok(Recovery::Recovered(recovered)) => report.recovered.push(recovered),
                Ok(Recovery::LostRace) => {}
                Ok(Recovery::Unresolved(task)) => report.unresolved.push(task),
                Err(FileStoreError::State(StateError::Corrupt { path, source })) => {
                    report.note_corrupt(path, &source);
                }
                Err(e) => {
                    tracing::error!(dir = %dir.display(), error = %e, "recovering task failed");
                }
            }
        }
    }

    tracing::info!(
        recovered = report.recovered.len(),
        live = report.live.len(),
        corrupt = report.corrupt.len(),
        unresolved = report.unresolved.len(),
        failed_deferred = report.failed_deferred(),
        "recovery sweep done"
    );
    Ok(report)
}

/// Claim `held` and replay its deferred functions.
async fn recover(
    node: &NodeContext,
    env: &DeferredEnv,
    dir: &Path,
    held: &Path,
) -> Result<Recovery, FileStoreError> {
    let task_dir = TaskDir::at(dir);
    let claimed = task_dir.recovering_path(node.pid());
    match tokio::fs::rename(held, &claimed).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(dir = %dir.display(), "lost claim race");
            return Ok(Recovery::LostRace);
        }
        Err(e) => return Err(FileStoreError::io(held, e)),
    }

    let mut state: TaskStateRecord = record::load_async(claimed.clone()).await?;
    let missing: Vec<String> = state
        .deferred
        .iter()
        .filter(|function| !function.can_run(&env.registry))
        .map(|function| function.name().to_string())
        .collect();
    if !missing.is_empty() {
        let owner = task_dir.state_path();
        tokio::fs::rename(&claimed, &owner)
            .await
            .map_err(|e| FileStoreError::io(&claimed, e))?;
        tracing::warn!(
            task_id = %state.task_id,
            pid = state.pid,
            missing = ?missing,
            "dead task needs deferred handlers not registered here, leaving it"
        );
        return Ok(Recovery::Unresolved(UnresolvedTask {
            dir: dir.to_path_buf(),
            task_id: state.task_id,
            pid: state.pid,
            missing,
        }));
    }
    tracing::info!(
        task_id = %state.task_id,
        job = %state.job_name,
        pid = state.pid,
        deferred = state.deferred.len(),
        "recovering dead task"
    );

    let mut failed = Vec::new();
    while !state.deferred.is_empty() {
        let function = state.deferred.remove(0);
        failed.extend(run_deferred_functions(std::slice::from_ref(&function), env).await);
        state.updated_at = node.clock().now();
        record::write_async(claimed.clone(), state.clone()).await?;
    }

    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(FileStoreError::io(dir, e)),
    }

    Ok(Recovery::Recovered(RecoveredTask {
        task_id: state.task_id,
        job_name: state.job_name,
        pid: state.pid,
        failed_deferred: failed,
    }))
}

/// Tear the node down: recover every task record not owned by this
/// process, then remove the tasks and cache directories. Safe to call again.
///
/// Tasks the sweep had to leave unresolved keep the tasks directory alive.
pub async fn shutdown(
    node: &NodeContext,
    store: Arc<dyn BackingStore>,
) -> Result<SweepReport, FileStoreError> {
    let report = find_and_handle_dead_tasks(node, store, true).await?;
    let mut doomed = vec![node.cache_dir()];
    if report.unresolved.is_empty() {
        doomed.push(node.tasks_dir());
    } else {
        tracing::warn!(
            unresolved = report.unresolved.len(),
            "keeping task records that need other deferred handlers"
        );
    }
    for dir in doomed {
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => tracing::debug!(dir = %dir.display(), "removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(FileStoreError::io(&dir, e)),
        }
    }
    tracing::info!(workdir = %node.workdir().display(), "node shut down");
    Ok(report)
}

/// One task directory as seen from outside.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    /// Owner pid, or the claiming sweeper's pid for a claimed record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub claimed: bool,
    pub alive: bool,
    pub corrupt: bool,
    pub deferred: Vec<String>,
}

/// List task directories and their records without touching them.
pub async fn inspect(node: &NodeContext) -> Result<Vec<TaskSummary>, FileStoreError> {
    let mut summaries = Vec::new();
    for dir in task_dirs(node).await? {
        let holders = holders(&dir).await?;
        if holders.is_empty() {
            summaries.push(TaskSummary {
                dir,
                task_id: None,
                job_name: None,
                pid: None,
                claimed: false,
                alive: false,
                corrupt: false,
                deferred: Vec::new(),
            });
            continue;
        }
        for holder in holders {
            let (path, claimer) = match holder {
                Holder::Owner(path) => (path, None),
                Holder::Claimer(path, pid) => (path, Some(pid)),
            };
            let mut summary = TaskSummary {
                dir: dir.clone(),
                task_id: None,
                job_name: None,
                pid: claimer,
                claimed: claimer.is_some(),
                alive: false,
                corrupt: false,
                deferred: Vec::new(),
            };
            match record::load_async::<TaskStateRecord>(path).await {
                Ok(state) => {
                    summary.task_id = Some(state.task_id);
                    summary.job_name = Some(state.job_name.clone());
                    summary.deferred = state.deferred_names();
                    summary.pid = Some(claimer.unwrap_or(state.pid));
                }
                Err(StateError::Missing { .. }) => continue,
                Err(StateError::Corrupt { .. }) => summary.corrupt = true,
                Err(e) => return Err(e.into()),
            }
            summary.alive = summary.pid.is_some_and(|pid| node.probe().is_alive(pid));
            summaries.push(summary);
        }
    }
    Ok(summaries)
}
