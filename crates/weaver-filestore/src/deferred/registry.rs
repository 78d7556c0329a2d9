//! Deferred handler registry.
//!
//! Custom cleanup code is registered under a stable name at process start.
//! A deferred `invoke` action only stores that name plus JSON arguments, so
//! any process that registered the same handlers can replay it.
//!
//! Two layers, like the typed task API:
//! - typed surface: `DeferredTask` + `DeferredHandler<T>`
//! - erased storage: `DynDeferredHandler` behind `Arc`

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{DeferredError, RegistryError};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Arguments of a custom deferred action.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct DropScratchTable { table: String }
///
/// impl DeferredTask for DropScratchTable {
///     const TYPE: &'static str = "acme.db.drop_scratch.v1";
/// }
/// ```
pub trait DeferredTask: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;
}

#[async_trait]
pub trait DeferredHandler<T: DeferredTask>: Send + Sync {
    async fn run(&self, task: T) -> Result<(), HandlerError>;
}

/// Object-safe form stored in the registry.
#[async_trait]
pub trait DynDeferredHandler: Send + Sync {
    async fn run_dyn(&self, args: serde_json::Value) -> Result<(), DeferredError>;
    fn task_type(&self) -> &str;
}

struct TypedDeferredHandler<T: DeferredTask, H: DeferredHandler<T>> {
    handler: H,
    _marker: PhantomData<T>,
}

#[async_trait]
impl<T: DeferredTask, H: DeferredHandler<T>> DynDeferredHandler for TypedDeferredHandler<T, H> {
    async fn run_dyn(&self, args: serde_json::Value) -> Result<(), DeferredError> {
        let task: T = serde_json::from_value(args)?;
        self.handler
            .run(task)
            .await
            .map_err(|e| DeferredError::Handler {
                handler: T::TYPE.to_string(),
                message: e.to_string(),
            })
    }

    fn task_type(&self) -> &str {
        T::TYPE
    }
}

#[derive(Default)]
pub struct DeferredRegistry {
    handlers: HashMap<String, Arc<dyn DynDeferredHandler>>,
}

impl DeferredRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: DeferredTask, H: DeferredHandler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        let task_type = T::TYPE.to_string();
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        let typed = TypedDeferredHandler {
            handler,
            _marker: PhantomData,
        };
        self.handlers.insert(task_type, Arc::new(typed));
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn DynDeferredHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for DeferredRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredRegistry")
            .field("handlers", &self.registered_types())
            .finish()
    }
}
