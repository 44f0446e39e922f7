//! dormant-core
//!
//! Background task scheduling bridge: the application registers task
//! definitions once, the host OS scheduler wakes the process whenever it sees
//! fit, and the bridge runs the right handler within the granted budget,
//! records the outcome durably and decides whether to arm the task again.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（names, definition, run, errors, outcome, retry, decision）
//! - **ports**: 抽象化レイヤー（StateStore, HostScheduler, Clock, IdGenerator）
//! - **app**: ブリッジ本体（BridgeBuilder, Bridge, Dispatcher, SchedulerAdapter, TaskRegistry）
//! - **typed**: 型付き handler API（Task trait, Handler trait, HandlerTable, WakeContext）
//! - **impls**: ports の実装（InMemoryStateStore, JsonFileStateStore, InMemoryHostScheduler）
//! - **config**: TOML 設定（BridgeConfig）

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;

pub use app::{Bridge, BridgeBuilder, BridgeError, BuildError, Registration, RunCounts};
pub use config::{BridgeConfig, ConfigError};
pub use domain::{
    Constraints, FailureKind, HandlerFailure, HandlerKey, OsVersion, RunId, RunState,
    TaskDefinition, TaskName, TaskRun, Trigger, WakeOutcome,
};
pub use typed::{DynHandler, FnHandler, Handler, Task, WakeContext};
