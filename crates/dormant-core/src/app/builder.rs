//! BridgeBuilder - Bridge の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 起動時回復（Running → Interrupted）を wake より先に済ませる

use std::sync::Arc;

use tracing::info;

use super::adapter::SchedulerAdapter;
use super::bridge::Bridge;
use super::dispatch::{DispatchTiming, Dispatcher};
use super::error::BuildError;
use super::reaper;
use super::registry::TaskRegistry;
use crate::config::BridgeConfig;
use crate::domain::{Decider, DefaultDecider, DefinitionLimits};
use crate::impls::{InMemoryStateStore, JsonFileStateStore};
use crate::ports::{Clock, HostScheduler, StateStore, SystemClock, UlidGenerator};
use crate::typed::{DynHandler, Handler, HandlerTable, RegistryError, Task};

/// BridgeBuilder は Bridge を構築
///
/// # 使用例
/// ```ignore
/// let bridge = BridgeBuilder::new(host)
///     .register::<RefreshFeed, _>(RefreshFeedHandler)?
///     .expect_handlers(&["feed.refresh.v1"])
///     .config(BridgeConfig::load("dormant.toml")?)
///     .build()
///     .await?;
/// ```
///
/// # Fail-fast 設計
/// - expect_handlers() で期待される handler key を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す（wake 時の HandlerUnbound を起動時に潰す）
pub struct BridgeBuilder {
    host: Arc<dyn HostScheduler>,
    handlers: HandlerTable,
    expected_handlers: Option<Vec<String>>,
    config: BridgeConfig,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn StateStore>>,
    decider: Option<Arc<dyn Decider>>,
}

impl BridgeBuilder {
    pub fn new(host: Arc<dyn HostScheduler>) -> Self {
        Self {
            host,
            handlers: HandlerTable::new(),
            expected_handlers: None,
            config: BridgeConfig::default(),
            clock: None,
            store: None,
            decider: None,
        }
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.handlers.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn register_dyn(mut self, handler: Arc<dyn DynHandler>) -> Result<Self, RegistryError> {
        self.handlers.register_dyn(handler)?;
        Ok(self)
    }

    /// 期待される handler key のリストを設定
    pub fn expect_handlers(mut self, keys: &[&str]) -> Self {
        self.expected_handlers = Some(keys.iter().map(|k| k.to_string()).collect());
        self
    }

    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to a JSON file store when `store.path` is configured, in-memory otherwise.
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to `DefaultDecider` with the configured retry policy.
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    /// Validate, recover the store and wire everything together.
    ///
    /// Runs left `Running` by a previous process are reclassified before the
    /// bridge is returned, so no wake can observe them as running.
    pub async fn build(self) -> Result<Bridge, BuildError> {
        if let Some(expected) = &self.expected_handlers {
            let registered: Vec<String> = self
                .handlers
                .registered_keys()
                .into_iter()
                .map(String::from)
                .collect();
            let missing: Vec<String> = expected
                .iter()
                .filter(|k| !registered.contains(k))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingHandlers(missing));
            }
        }
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store: Arc<dyn StateStore> = match (self.store, &self.config.store.path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(JsonFileStateStore::open(path, Arc::clone(&clock)).await?),
            (None, None) => Arc::new(InMemoryStateStore::new()),
        };
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(self.config.retry_policy())));

        let now = clock.now();
        let interrupted = reaper::reclassify_interrupted(&*store, now).await?;
        let purged = reaper::purge_expired(&*store, now, self.config.retention()).await?;

        let registry = Arc::new(TaskRegistry::new(DefinitionLimits {
            min_periodic_interval: self.host.capabilities().min_periodic_interval,
        }));
        let handler_count = self.handlers.len();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&clock),
            Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            decider,
            self.handlers,
            DispatchTiming {
                soft_deadline_margin: self.config.soft_deadline_margin(),
                cancel_grace: self.config.cancel_grace(),
            },
        ));
        let adapter = SchedulerAdapter::new(
            self.host,
            Arc::clone(&dispatcher),
            Arc::clone(&registry),
            Arc::clone(&clock),
        );

        info!(
            handlers = handler_count,
            interrupted,
            purged,
            "bridge ready"
        );

        Ok(Bridge {
            registry,
            dispatcher,
            adapter,
            store,
            clock,
            config: self.config,
        })
    }
}
