//! TaskController port - where finalization reports to.

use async_trait::async_trait;

use crate::domain::{LogRecord, TaskCompletion};

/// Receives a task's completion status and buffered log messages.
///
/// This crate only buffers and forwards; transport is the implementor's
/// business. A returned error fails the task's finalization.
#[async_trait]
pub trait TaskController: Send + Sync {
    async fn commit(
        &self,
        completion: TaskCompletion,
        logs: Vec<LogRecord>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}
