//! Typed - 型付き handler API
//!
//! handler key の typo を型で排除し、入力型と handler の対応を静的に保証する。
//!
//! # 二層構造
//! - **表層（Typed）**: `Task` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, type erasure

pub mod context;
pub mod handler;
pub mod registry;
pub mod task;

pub use self::context::WakeContext;
pub use self::handler::{DynHandler, FnHandler, Handler, TypedHandler};
pub use self::registry::{HandlerTable, RegistryError};
pub use self::task::Task;
