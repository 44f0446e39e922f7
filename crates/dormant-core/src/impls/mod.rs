//! Port implementations.
//!
//! - `InMemoryStateStore`: テスト・揮発ホスト用
//! - `JsonFileStateStore`: バージョン付き JSON ファイル
//! - `InMemoryHostScheduler`: OS スケジューラのシミュレータ

pub mod file_store;
pub mod inmem_host;
pub mod inmem_store;

pub use file_store::{JsonFileStateStore, STORE_VERSION};
pub use inmem_host::InMemoryHostScheduler;
pub use inmem_store::InMemoryStateStore;
