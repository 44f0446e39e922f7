//! Handler trait - wake 時に実行される処理
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> → DynHandler)

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::context::WakeContext;
use super::task::Task;
use crate::domain::HandlerFailure;

/// Handler は Task の入力を受け取って処理する
///
/// # 使用例
/// ```ignore
/// struct RefreshFeedHandler;
///
/// #[async_trait]
/// impl Handler<RefreshFeed> for RefreshFeedHandler {
///     async fn handle(&self, task: RefreshFeed, ctx: WakeContext) -> Result<(), HandlerFailure> {
///         tokio::select! {
///             r = fetch(&task.feed_url) => r.map_err(|e| HandlerFailure::new(e.to_string())),
///             _ = ctx.cancelled() => Err(HandlerFailure::cancelled()),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T, ctx: WakeContext) -> Result<(), HandlerFailure>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// handler table は `HashMap<HandlerKey, Arc<dyn DynHandler>>` なので、
/// 型付き handler は TypedHandler で包んでからここに入る。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        input: serde_json::Value,
        ctx: WakeContext,
    ) -> Result<(), HandlerFailure>;

    fn handler_key(&self) -> &str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(
        &self,
        input: serde_json::Value,
        ctx: WakeContext,
    ) -> Result<(), HandlerFailure> {
        let task: T = serde_json::from_value(input)
            .map_err(|e| HandlerFailure::new(format!("input decode: {e}")))?;
        self.handler.handle(task, ctx).await
    }

    fn handler_key(&self) -> &str {
        T::HANDLER
    }
}

/// Untyped handler built from a closure; the input stays raw JSON.
pub struct FnHandler<F> {
    key: String,
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(serde_json::Value, WakeContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerFailure>> + Send + 'static,
{
    pub fn new(key: impl Into<String>, f: F) -> Self {
        Self { key: key.into(), f }
    }
}

#[async_trait]
impl<F, Fut> DynHandler for FnHandler<F>
where
    F: Fn(serde_json::Value, WakeContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerFailure>> + Send + 'static,
{
    async fn handle_dyn(
        &self,
        input: serde_json::Value,
        ctx: WakeContext,
    ) -> Result<(), HandlerFailure> {
        (self.f)(input, ctx).await
    }

    fn handler_key(&self) -> &str {
        &self.key
    }
}
