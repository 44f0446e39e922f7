//! Errors - 実行エラーの分類
//!
//! 登録時のエラー（InvalidDefinition, SchedulerRejected）は呼び出し側へ同期的に返す。
//! ここで定義するのは TaskRun に記録される実行時の失敗分類。

use std::fmt;

use serde::{Deserialize, Serialize};

/// FailureKind は TaskRun が Failed になった理由
///
/// | kind           | 原因                               | retry        |
/// |----------------|------------------------------------|--------------|
/// | HandlerUnbound | handler table に key がない        | しない       |
/// | BudgetExceeded | soft deadline 超過                 | policy 次第  |
/// | HandlerError   | handler が失敗を返した / panic     | policy 次第  |
/// | Interrupted    | プロセスが実行中に終了した         | policy 次第  |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    HandlerUnbound,
    BudgetExceeded,
    HandlerError,
    Interrupted,
}

impl FailureKind {
    /// Configuration errors never consume retries.
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureKind::HandlerUnbound)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::HandlerUnbound => "HANDLER_UNBOUND",
            FailureKind::BudgetExceeded => "BUDGET_EXCEEDED",
            FailureKind::HandlerError => "HANDLER_ERROR",
            FailureKind::Interrupted => "INTERRUPTED",
        };
        f.write_str(s)
    }
}

/// Last-error summary persisted with a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: FailureKind,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl RunError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}
