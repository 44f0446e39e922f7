//! Errors surfaced to the application.
//!
//! Run failures (HandlerError, BudgetExceeded, ...) are never returned from
//! here; they are recorded on the run and read back through the store.

use crate::config::ConfigError;
use crate::domain::{DefinitionError, TaskName};
use crate::ports::{SchedulerRejection, StoreError};
use crate::typed::RegistryError;

/// BridgeError は登録・照会 API のエラー
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid task definition: {0}")]
    InvalidDefinition(#[from] DefinitionError),

    #[error("host scheduler rejected task '{task}': {source}")]
    SchedulerRejected {
        task: TaskName,
        #[source]
        source: SchedulerRejection,
    },

    #[error("task '{0}' is not registered")]
    NotFound(TaskName),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}

/// BuildError は Bridge 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing handlers: {0:?}. These handler keys were expected but not registered.")]
    MissingHandlers(Vec<String>),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}
