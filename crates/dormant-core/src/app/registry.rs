//! TaskRegistry - 登録済み TaskDefinition の表
//!
//! # 登録の意味
//! - 同じ名前・同じ内容の再登録は何もしない（Unchanged → 再 arm しない）
//! - 内容が違えば置き換える（Replaced → 再 arm）
//! - arm に失敗したら `restore` で元に戻す

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::error::BridgeError;
use crate::domain::{DefinitionLimits, TaskDefinition, TaskName};

/// Result of `TaskRegistry::register`.
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    Created,
    Unchanged,
    /// Holds the definition that was replaced.
    Replaced(TaskDefinition),
}

impl Registration {
    /// Whether the host scheduler has to be (re-)armed.
    pub fn needs_arm(&self) -> bool {
        !matches!(self, Registration::Unchanged)
    }

    pub fn previous(&self) -> Option<&TaskDefinition> {
        match self {
            Registration::Replaced(previous) => Some(previous),
            _ => None,
        }
    }
}

pub struct TaskRegistry {
    limits: DefinitionLimits,
    definitions: RwLock<HashMap<TaskName, TaskDefinition>>,
}

impl TaskRegistry {
    pub fn new(limits: DefinitionLimits) -> Self {
        Self {
            limits,
            definitions: RwLock::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> &DefinitionLimits {
        &self.limits
    }

    pub async fn register(
        &self,
        definition: TaskDefinition,
        now: DateTime<Utc>,
    ) -> Result<Registration, BridgeError> {
        definition.validate(&self.limits, now)?;

        let mut definitions = self.definitions.write().await;
        if let Some(existing) = definitions.get(&definition.name)
            && *existing == definition
        {
            return Ok(Registration::Unchanged);
        }
        match definitions.insert(definition.name.clone(), definition) {
            Some(previous) => Ok(Registration::Replaced(previous)),
            None => Ok(Registration::Created),
        }
    }

    pub async fn lookup(&self, name: &TaskName) -> Result<TaskDefinition, BridgeError> {
        self.get(name)
            .await
            .ok_or_else(|| BridgeError::NotFound(name.clone()))
    }

    pub async fn get(&self, name: &TaskName) -> Option<TaskDefinition> {
        self.definitions.read().await.get(name).cloned()
    }

    pub async fn remove(&self, name: &TaskName) -> Option<TaskDefinition> {
        self.definitions.write().await.remove(name)
    }

    /// Put back what was there before a failed registration.
    pub async fn restore(&self, name: &TaskName, previous: Option<TaskDefinition>) {
        let mut definitions = self.definitions.write().await;
        match previous {
            Some(definition) => {
                definitions.insert(name.clone(), definition);
            }
            None => {
                definitions.remove(name);
            }
        }
    }

    /// Registered names, sorted.
    pub async fn names(&self) -> Vec<TaskName> {
        let mut names: Vec<TaskName> = self.definitions.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}
