//! TaskName / HandlerKey - 識別子の命名規約
//!
//! Host schedulers (BGTaskScheduler, WorkManager など) は識別子に使える文字を制限するため、
//! 登録時点で検証しておく。
//!
//! # 命名規約
//! - 1〜128 文字
//! - ASCII 英数字と `.` `-` `_` のみ
//! - 例: `com.example.feed.refresh`

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum identifier length accepted by the bridge.
pub const MAX_NAME_LEN: usize = 128;

/// NameError は命名規約違反
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("identifier must not be empty")]
    Empty,

    #[error("identifier is {0} characters long (max {max})", max = MAX_NAME_LEN)]
    TooLong(usize),

    #[error("identifier '{name}' contains invalid character {ch:?}")]
    InvalidChar { name: String, ch: char },
}

fn validate(value: &str) -> Result<(), NameError> {
    if value.is_empty() {
        return Err(NameError::Empty);
    }
    if value.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong(value.len()));
    }
    if let Some(ch) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
    {
        return Err(NameError::InvalidChar {
            name: value.to_string(),
            ch,
        });
    }
    Ok(())
}

/// Unique identifier of a task definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskName(String);

impl TaskName {
    pub fn new(value: impl Into<String>) -> Result<Self, NameError> {
        let value = value.into();
        validate(&value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TaskName {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TaskName> for String {
    fn from(name: TaskName) -> Self {
        name.0
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque reference to a handler, resolved against the handler table at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HandlerKey(String);

impl HandlerKey {
    pub fn new(value: impl Into<String>) -> Result<Self, NameError> {
        let value = value.into();
        validate(&value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for HandlerKey {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<HandlerKey> for String {
    fn from(key: HandlerKey) -> Self {
        key.0
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
