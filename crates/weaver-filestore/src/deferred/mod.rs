//! Deferred functions: cleanup that must run even if the task's process dies.
//!
//! An action is captured as plain data when it is registered and persisted
//! in the task's state record. It is decoded only when it is invoked, either
//! at normal task end or by whichever process runs the recovery sweep.

pub mod registry;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use ulid::Ulid;

use crate::domain::DeferredError;
use crate::ports::BackingStore;
use crate::state::cache_state;

pub use self::registry::{
    DeferredHandler, DeferredRegistry, DeferredTask, DynDeferredHandler, HandlerError,
};

/// The fixed set of cleanup operations, plus `Invoke` for registered
/// handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DeferredAction {
    /// Remove a file or a whole directory tree. Already gone is fine.
    RemovePath { path: PathBuf },

    /// Delete an object from the backing store.
    DeleteGlobalFile { key: String },

    /// Hand back node-cache space reserved under `token` for a download
    /// that never committed.
    ReleaseCacheReservation { key: String, token: Ulid },

    /// Run the handler registered under `handler` with `args`.
    Invoke {
        handler: String,
        args: serde_json::Value,
    },
}

impl DeferredAction {
    /// Build an `Invoke` action from a typed payload.
    pub fn invoke_task<T: DeferredTask>(task: &T) -> Result<Self, DeferredError> {
        Ok(DeferredAction::Invoke {
            handler: T::TYPE.to_string(),
            args: serde_json::to_value(task)?,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            DeferredAction::RemovePath { .. } => "remove_path",
            DeferredAction::DeleteGlobalFile { .. } => "delete_global_file",
            DeferredAction::ReleaseCacheReservation { .. } => "release_cache_reservation",
            DeferredAction::Invoke { handler, .. } => handler,
        }
    }

    async fn run(self, env: &DeferredEnv) -> Result<(), DeferredError> {
        match self {
            DeferredAction::RemovePath { path } => remove_path(path).await,
            DeferredAction::DeleteGlobalFile { key } => Ok(env.store.delete(&key).await?),
            DeferredAction::ReleaseCacheReservation { key, token } => {
                let cache_dir = env.cache_dir.clone();
                tokio::task::spawn_blocking(move || {
                    cache_state::release_reservation(&cache_dir, &key, token)
                })
                .await
                .map_err(|e| DeferredError::Handler {
                    handler: "release_cache_reservation".to_string(),
                    message: e.to_string(),
                })??;
                Ok(())
            }
            DeferredAction::Invoke { handler, args } => {
                let target = env
                    .registry
                    .get(&handler)
                    .ok_or_else(|| DeferredError::HandlerNotFound(handler.clone()))?;
                target.run_dyn(args).await
            }
        }
    }
}

async fn remove_path(path: PathBuf) -> Result<(), DeferredError> {
    let io_err = |source| DeferredError::Io {
        path: path.clone(),
        source,
    };
    let metadata = match tokio::fs::symlink_metadata(&path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_err(e)),
    };
    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(&path).await
    } else {
        tokio::fs::remove_file(&path).await
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(e)),
    }
}

/// What a deferred action may touch when it runs.
#[derive(Clone)]
pub struct DeferredEnv {
    pub store: Arc<dyn BackingStore>,
    pub registry: Arc<DeferredRegistry>,
    /// Node cache directory. Set whether or not this process caches: the
    /// reservation it releases may come from a caching task.
    pub cache_dir: PathBuf,
}

/// A deferred action captured for later, possibly in another process.
///
/// Serialized eagerly by `create`, decoded lazily by `invoke`. Invoking twice
/// runs the action twice; callers make sure that does not happen.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeferredFunction {
    name: String,
    action: Box<RawValue>,
}

impl DeferredFunction {
    pub fn create(action: &DeferredAction) -> Result<Self, DeferredError> {
        Ok(Self {
            name: action.name().to_string(),
            action: serde_json::value::to_raw_value(action)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decode the captured action. Mostly useful for inspection.
    pub fn action(&self) -> Result<DeferredAction, DeferredError> {
        Ok(serde_json::from_str(self.action.get())?)
    }

    /// Whether this process can run the function: the action decodes and,
    /// for `Invoke`, its handler is registered here.
    pub fn can_run(&self, registry: &DeferredRegistry) -> bool {
        match self.action() {
            Ok(DeferredAction::Invoke { handler, .. }) => registry.get(&handler).is_some(),
            Ok(_) => true,
            Err(_) => false,
        }
    }

    pub async fn invoke(&self, env: &DeferredEnv) -> Result<(), DeferredError> {
        tracing::debug!(function = %self, "running deferred function");
        self.action()?.run(env).await
    }
}

impl fmt::Display for DeferredFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeferredFunction({}, ...)", self.name)
    }
}

impl fmt::Debug for DeferredFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Invoke each function in order and return the names of the ones that
/// failed. A failure is logged and never stops the batch.
pub async fn run_deferred_functions(
    functions: &[DeferredFunction],
    env: &DeferredEnv,
) -> Vec<String> {
    let mut failures = Vec::new();
    for function in functions {
        if let Err(e) = function.invoke(env).await {
            tracing::error!(function = %function, error = %e, "deferred function failed");
            failures.push(function.name().to_string());
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::LocalBackingStore;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;

    #[derive(Debug, Serialize, Deserialize)]
    struct Step {
        id: u32,
        fail: bool,
    }

    impl DeferredTask for Step {
        const TYPE: &'static str = "test.step.v1";
    }

    #[derive(Default)]
    struct StepHandler {
        ran: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait::async_trait]
    impl DeferredHandler<Step> for StepHandler {
        async fn run(&self, task: Step) -> Result<(), HandlerError> {
            self.ran.lock().unwrap().push(task.id);
            if task.fail {
                return Err(format!("step {} exploded", task.id).into());
            }
            Ok(())
        }
    }

    fn env_with(dir: &std::path::Path, ran: Arc<Mutex<Vec<u32>>>) -> DeferredEnv {
        let mut registry = DeferredRegistry::new();
        registry.register::<Step, _>(StepHandler { ran }).unwrap();
        DeferredEnv {
            store: Arc::new(LocalBackingStore::new(dir)),
            registry: Arc::new(registry),
            cache_dir: dir.join("cache"),
        }
    }

    fn step(id: u32, fail: bool) -> DeferredFunction {
        DeferredFunction::create(&DeferredAction::invoke_task(&Step { id, fail }).unwrap()).unwrap()
    }

    #[test]
    fn action_json_is_tagged() {
        let action = DeferredAction::DeleteGlobalFile {
            key: "k".to_string(),
        };
        let v = serde_json::to_value(&action).unwrap();
        assert_eq!(v["action"], "delete_global_file");
        assert_eq!(v["key"], "k");
    }

    #[test]
    fn function_is_named_after_its_action() {
        assert_eq!(step(1, false).name(), Step::TYPE);
        let remove = DeferredFunction::create(&DeferredAction::RemovePath {
            path: PathBuf::from("/tmp/x"),
        })
        .unwrap();
        assert_eq!(remove.name(), "remove_path");
        assert_eq!(remove.to_string(), "DeferredFunction(remove_path, ...)");
    }

    #[test]
    fn undecodable_action_survives_until_invoked() {
        // Scanning records must not require decoding every action.
        let raw = r#"{"name":"future","action":{"action":"not_yet_invented","x":1}}"#;
        let function: DeferredFunction = serde_json::from_str(raw).unwrap();
        assert_eq!(function.name(), "future");
        assert!(function.action().is_err());
    }

    #[tokio::test]
    async fn batch_keeps_going_after_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ran = Arc::new(Mutex::new(Vec::new()));
        let env = env_with(dir.path(), Arc::clone(&ran));

        let batch: Vec<_> = (1..=5).map(|id| step(id, id == 3)).collect();
        let failures = run_deferred_functions(&batch, &env).await;

        assert_eq!(failures, vec![Step::TYPE.to_string()]);
        assert_eq!(*ran.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn can_run_needs_a_registered_handler() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_with(dir.path(), Arc::default());
        let orphan = DeferredFunction::create(&DeferredAction::Invoke {
            handler: "gone.v1".to_string(),
            args: serde_json::Value::Null,
        })
        .unwrap();
        let builtin = DeferredFunction::create(&DeferredAction::DeleteGlobalFile {
            key: "k".to_string(),
        })
        .unwrap();
        let future: DeferredFunction =
            serde_json::from_str(r#"{"name":"f","action":{"action":"later"}}"#).unwrap();

        assert!(step(1, false).can_run(&env.registry));
        assert!(builtin.can_run(&env.registry));
        assert!(!orphan.can_run(&env.registry));
        assert!(!future.can_run(&env.registry));
        assert!(!step(1, false).can_run(&DeferredRegistry::new()));
    }

    #[tokio::test]
    async fn unknown_handler_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_with(dir.path(), Arc::default());
        let orphan = DeferredFunction::create(&DeferredAction::Invoke {
            handler: "gone.v1".to_string(),
            args: serde_json::Value::Null,
        })
        .unwrap();

        let err = orphan.invoke(&env).await.unwrap_err();
        assert!(matches!(err, DeferredError::HandlerNotFound(h) if h == "gone.v1"));
    }

    #[tokio::test]
    async fn remove_path_handles_files_dirs_and_absence() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_with(dir.path(), Arc::default());
        let tree = dir.path().join("scratch/a/b");
        tokio::fs::create_dir_all(&tree).await.unwrap();
        tokio::fs::write(tree.join("f"), b"x").await.unwrap();
        let file = dir.path().join("lone");
        tokio::fs::write(&file, b"x").await.unwrap();

        for path in [dir.path().join("scratch"), file.clone(), dir.path().join("never")] {
            let f = DeferredFunction::create(&DeferredAction::RemovePath { path }).unwrap();
            f.invoke(&env).await.unwrap();
        }
        assert!(!dir.path().join("scratch").exists());
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn delete_global_file_removes_the_object() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_with(dir.path(), Arc::default());
        let (mut writer, key) = env.store.put_stream(None).await.unwrap();
        writer.write_all(b"bye").await.unwrap();
        writer.shutdown().await.unwrap();

        let f = DeferredFunction::create(&DeferredAction::DeleteGlobalFile { key: key.clone() })
            .unwrap();
        f.invoke(&env).await.unwrap();
        assert!(!env.store.exists(&key).await.unwrap());
    }
}
