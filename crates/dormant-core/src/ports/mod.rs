//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（OS スケジューラ、永続ストレージ、時計）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - StateStore が source of truth（正本）
//! - HostScheduler は「いつ起こすか」だけを知っている（状態は持たない）

pub mod clock;
pub mod host_scheduler;
pub mod id_generator;
pub mod state_store;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::host_scheduler::{
    HostCapabilities, HostScheduler, RequestKind, SchedulerRejection, SchedulerRequest,
};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::state_store::{StateStore, StoreError};
