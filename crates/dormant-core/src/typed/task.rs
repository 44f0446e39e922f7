//! Task trait - 型付き入力と handler key の対応付け
//!
//! # 学習ポイント
//! - Associated Constants (`const HANDLER`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{DefinitionError, HandlerKey, TaskDefinition, TaskDefinitionBuilder, TaskName, Trigger};

/// Task は handler key と入力型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct RefreshFeed {
///     feed_url: String,
/// }
///
/// impl Task for RefreshFeed {
///     const HANDLER: &'static str = "feed.refresh.v1";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: 定義の `input` に JSON として埋め込むため
/// - `DeserializeOwned`: wake のたびに `input` から復元するため
/// - `Send + Sync + 'static`: spawn された handler に渡すため
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Handler key.
    ///
    /// # 命名規約
    /// - `{domain}.{action}.v{major}`
    /// - 例: `feed.refresh.v1`
    const HANDLER: &'static str;
}

impl TaskDefinition {
    /// Start a definition whose handler and input come from a typed task.
    ///
    /// ```ignore
    /// let def = TaskDefinition::for_task(name, &RefreshFeed { .. }, Trigger::periodic(interval))?
    ///     .requires_network()
    ///     .build();
    /// ```
    pub fn for_task<T: Task>(
        name: TaskName,
        input: &T,
        trigger: Trigger,
    ) -> Result<TaskDefinitionBuilder, DefinitionError> {
        let handler = HandlerKey::new(T::HANDLER).map_err(DefinitionError::HandlerKey)?;
        let input = serde_json::to_value(input).map_err(|e| DefinitionError::Input(e.to_string()))?;
        Ok(TaskDefinition::builder(name, handler, trigger).input(input))
    }
}
