//! Log records buffered for the controller.

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// One message a task sent to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub text: String,
    pub level: LogLevel,
}

impl LogRecord {
    pub fn new(text: impl Into<String>, level: LogLevel) -> Self {
        Self {
            text: text.into(),
            level,
        }
    }

    /// Emit through `tracing` at the record's level.
    pub(crate) fn emit(&self, job_name: &str) {
        let text = self.text.as_str();
        match self.level {
            LogLevel::Trace => tracing::trace!(job = job_name, "LOG-TO-MASTER: {text}"),
            LogLevel::Debug => tracing::debug!(job = job_name, "LOG-TO-MASTER: {text}"),
            LogLevel::Info => tracing::info!(job = job_name, "LOG-TO-MASTER: {text}"),
            LogLevel::Warn => tracing::warn!(job = job_name, "LOG-TO-MASTER: {text}"),
            LogLevel::Error => tracing::error!(job = job_name, "LOG-TO-MASTER: {text}"),
        }
    }
}
