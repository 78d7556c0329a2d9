//! In-memory `TaskController` that records every commit.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{LogRecord, TaskCompletion, TaskId};
use crate::ports::TaskController;

#[derive(Debug, Clone)]
pub struct CommittedTask {
    pub completion: TaskCompletion,
    pub logs: Vec<LogRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryController {
    commits: Arc<Mutex<Vec<CommittedTask>>>,
}

impl InMemoryController {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn commits(&self) -> Vec<CommittedTask> {
        self.commits.lock().await.clone()
    }

    pub async fn commit_for(&self, task_id: TaskId) -> Option<CommittedTask> {
        self.commits
            .lock()
            .await
            .iter()
            .find(|c| c.completion.task_id == task_id)
            .cloned()
    }
}

#[async_trait]
impl TaskController for InMemoryController {
    async fn commit(
        &self,
        completion: TaskCompletion,
        logs: Vec<LogRecord>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.commits
            .lock()
            .await
            .push(CommittedTask { completion, logs });
        Ok(())
    }
}
