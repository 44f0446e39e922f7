//! HandlerTable - handler key から handler を引く表
//!
//! グローバルな登録先は持たない。BridgeBuilder が組み立てて Bridge に渡し、
//! shutdown で破棄する。
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object の管理
//! - Generic methods での登録と型安全性
//! - Arc による共有所有権

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::task::Task;
use crate::domain::{HandlerKey, NameError};

/// RegistryError は HandlerTable の操作エラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("handler '{0}' is already registered")]
    AlreadyRegistered(HandlerKey),

    #[error("invalid handler key: {0}")]
    InvalidKey(#[from] NameError),
}

/// # 使用例
/// ```ignore
/// let mut handlers = HandlerTable::new();
/// handlers.register::<RefreshFeed, _>(RefreshFeedHandler)?;
///
/// let handler = handlers.get(&HandlerKey::new("feed.refresh.v1")?);
/// ```
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<HandlerKey, Arc<dyn DynHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register_dyn(Arc::new(TypedHandler::new(handler)))
    }

    /// Register an already type-erased handler under its own key.
    pub fn register_dyn(&mut self, handler: Arc<dyn DynHandler>) -> Result<(), RegistryError> {
        let key = HandlerKey::new(handler.handler_key())?;
        if self.handlers.contains_key(&key) {
            return Err(RegistryError::AlreadyRegistered(key));
        }
        self.handlers.insert(key, handler);
        Ok(())
    }

    pub fn get(&self, key: &HandlerKey) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(key).cloned()
    }

    pub fn contains(&self, key: &HandlerKey) -> bool {
        self.handlers.contains_key(key)
    }

    /// Registered keys, sorted.
    pub fn registered_keys(&self) -> Vec<HandlerKey> {
        let mut keys: Vec<HandlerKey> = self.handlers.keys().cloned().collect();
        keys.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        keys
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
