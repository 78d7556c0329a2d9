//! Task description and completion records.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;
use super::log::LogRecord;

/// What the file store needs to know about the task it serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescription {
    task_id: TaskId,
    name: String,
    command: String,
}

impl TaskDescription {
    pub fn new(task_id: TaskId, name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            task_id,
            name: name.into(),
            command: command.into(),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Human-readable job name used in logs.
    ///
    /// Commands look like `_toil <job-name> ...`, so the second word wins;
    /// a one-word command is its own name and an empty one falls back to
    /// `name`.
    pub fn job_name(&self) -> &str {
        let mut words = self.command.split_whitespace();
        let first = words.next();
        match (first, words.next()) {
            (_, Some(second)) => second,
            (Some(first), None) => first,
            (None, None) => &self.name,
        }
    }
}

/// How the task's user code ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded,
    Failed,
}

impl TaskOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, TaskOutcome::Succeeded)
    }
}

/// What finalization commits to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub task_id: TaskId,
    pub job_name: String,
    pub succeeded: bool,

    /// Keys passed to `delete_global_file`; removed from the store once the
    /// commit went through.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_to_delete: Vec<String>,

    /// Jobs this one asked the scheduler to drop. On success their cleanup
    /// files are deleted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs_to_delete: Vec<TaskId>,

    /// Keys written with `cleanup = true`. They belong to this task's job
    /// and are deleted when the job is retired.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleanup_files: Vec<String>,

    /// Names of deferred functions that failed at task end.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_deferred: Vec<String>,

    pub finished_at: DateTime<Utc>,
}

/// Summary handed back to the caller of `finish`.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub completion: TaskCompletion,
    pub logs: Vec<LogRecord>,
    pub temp_dir: PathBuf,
}
