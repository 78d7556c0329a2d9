//! Per-task state record and task directory layout.
//!
//! ```text
//! <workdir>/tasks/<task-id>/
//!     state.json                   owned by the running task
//!     state.recovering-<pid>.json  claimed by a sweeper
//!     tmp/                         the task's temp dir
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deferred::DeferredFunction;
use crate::domain::TaskId;

const STATE_FILE: &str = "state.json";
const RECOVERING_PREFIX: &str = "state.recovering-";
const RECOVERING_SUFFIX: &str = ".json";
const TEMP_DIR: &str = "tmp";

pub fn tasks_dir(workdir: &Path) -> PathBuf {
    workdir.join("tasks")
}

/// One task's directory under `<workdir>/tasks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDir {
    root: PathBuf,
}

impl TaskDir {
    pub fn new(workdir: &Path, task_id: TaskId) -> Self {
        Self::at(tasks_dir(workdir).join(task_id.to_string()))
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    /// Name a record takes once `pid` has claimed it for recovery.
    pub fn recovering_path(&self, pid: u32) -> PathBuf {
        self.root
            .join(format!("{RECOVERING_PREFIX}{pid}{RECOVERING_SUFFIX}"))
    }
}

/// Pid encoded in a `state.recovering-<pid>.json` file name.
pub fn claimer_pid(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix(RECOVERING_PREFIX)?
        .strip_suffix(RECOVERING_SUFFIX)?
        .parse()
        .ok()
}

pub fn is_state_file(file_name: &str) -> bool {
    file_name == STATE_FILE
}

/// What a running task persists so another process can clean up after it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStateRecord {
    pub pid: u32,
    pub task_id: TaskId,
    pub job_name: String,
    pub temp_dir: PathBuf,
    #[serde(default)]
    pub deferred: Vec<DeferredFunction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskStateRecord {
    pub fn new(
        pid: u32,
        task_id: TaskId,
        job_name: impl Into<String>,
        temp_dir: PathBuf,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            pid,
            task_id,
            job_name: job_name.into(),
            temp_dir,
            deferred: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn deferred_names(&self) -> Vec<String> {
        self.deferred.iter().map(|f| f.name().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::DeferredAction;
    use crate::state::record;
    use rstest::rstest;
    use ulid::Ulid;

    #[rstest]
    #[case("state.recovering-42.json", Some(42))]
    #[case("state.recovering-.json", None)]
    #[case("state.recovering-x.json", None)]
    #[case("state.json", None)]
    #[case("state.recovering-42.json.tmp", None)]
    fn claimer_pid_parses_file_names(#[case] name: &str, #[case] expected: Option<u32>) {
        assert_eq!(claimer_pid(name), expected);
    }

    #[test]
    fn layout_is_rooted_at_the_task_id() {
        let task_id = TaskId::from_ulid(Ulid::new());
        let dir = TaskDir::new(Path::new("/w"), task_id);
        assert_eq!(dir.root(), Path::new(&format!("/w/tasks/{task_id}")));
        assert_eq!(dir.state_path(), dir.root().join("state.json"));
        assert_eq!(
            dir.recovering_path(7),
            dir.root().join("state.recovering-7.json")
        );
        assert_eq!(claimer_pid("state.recovering-7.json"), Some(7));
    }

    #[test]
    fn deferred_functions_survive_a_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut state = TaskStateRecord::new(
            99,
            TaskId::from_ulid(Ulid::new()),
            "sortJob",
            dir.path().join("tmp"),
            Utc::now(),
        );
        state.deferred.push(
            DeferredFunction::create(&DeferredAction::DeleteGlobalFile {
                key: "k".to_string(),
            })
            .unwrap(),
        );
        record::write(&path, &state).unwrap();

        let back: TaskStateRecord = record::load(&path).unwrap();
        assert_eq!(back.pid, 99);
        assert_eq!(back.deferred_names(), vec!["delete_global_file"]);
        assert_eq!(
            back.deferred[0].action().unwrap(),
            DeferredAction::DeleteGlobalFile {
                key: "k".to_string()
            }
        );
    }
}
