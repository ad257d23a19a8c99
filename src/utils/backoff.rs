//! Exponential backoff with jitter
//! 带抖动的指数退避

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for spawning instances / 实例创建重试策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt / 首次尝试之后的重试次数
    pub max_retries: u32,
    /// Delay before the first retry / 第一次重试前的延迟
    pub initial_delay_ms: u64,
    /// Upper bound for a single delay / 单次延迟上限
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Total attempts including the first one / 包括首次在内的总尝试次数
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `attempt` (0-based), capped and jittered by up to 25%
    /// 第 `attempt` 次重试前的延迟（从0开始），有上限并带最多25%的抖动
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self
            .initial_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.min(32)));
        let capped = base.min(self.max_delay_ms);
        let jitter = rand::thread_rng().gen_range(0.0..=0.25);
        let jittered = ((capped as f64) * (1.0 + jitter)) as u64;
        Duration::from_millis(jittered.min(self.max_delay_ms))
    }
}
