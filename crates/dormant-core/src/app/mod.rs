//! App - アプリケーション層
//!
//! ports を組み合わせてブリッジ本体を組み立てる。
//!
//! # 主要コンポーネント
//! - **BridgeBuilder**: handler table の構築、起動時検証と回復
//! - **Bridge**: 登録・wake・照会の窓口
//! - **TaskRegistry**: 登録済み TaskDefinition
//! - **SchedulerAdapter**: arm / disarm / on_wake
//! - **Dispatcher**: wake 1 回分の実行とリトライ判定の適用
//! - **reaper**: 起動時の Interrupted 回復と保持期間切れの削除

pub mod adapter;
pub mod bridge;
pub mod builder;
pub mod dispatch;
pub mod error;
pub mod locks;
pub mod reaper;
pub mod registry;
pub mod status;

#[cfg(test)]
mod scenarios;

pub use self::adapter::SchedulerAdapter;
pub use self::bridge::Bridge;
pub use self::builder::BridgeBuilder;
pub use self::dispatch::{CancelReason, DispatchTiming, Dispatcher, WakeReport};
pub use self::error::{BridgeError, BuildError};
pub use self::registry::{Registration, TaskRegistry};
pub use self::status::RunCounts;
