//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（Clock の時刻を timestamp 部に使う）

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use ulid::{Generator, Ulid};

use crate::domain::ids::RunId;
use crate::ports::Clock;

/// IdGenerator は TaskRun の ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数の wake から同時に使われる）
pub trait IdGenerator: Send + Sync {
    fn generate_run_id(&self) -> RunId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock を使って現在時刻ベースの ULID を生成します。
/// 同じミリ秒内では単調増加するので、FixedClock の下でも生成順 = ID 順になります。
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
    generator: Mutex<Generator>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            generator: Mutex::new(Generator::new()),
        }
    }
}

impl IdGenerator for UlidGenerator {
    fn generate_run_id(&self) -> RunId {
        let now = self.clock.now();
        let mut generator = self.generator.lock().unwrap_or_else(|e| e.into_inner());
        let ulid = generator
            .generate_from_datetime(SystemTime::from(now))
            // 同一ミリ秒で乱数部が溢れた場合だけ
            .unwrap_or_else(|_| Ulid::from_parts(now.timestamp_millis().max(0) as u64, rand::random()));
        RunId::from(ulid)
    }
}
