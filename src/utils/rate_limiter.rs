//! Token-bucket rate limiter
//! 令牌桶限流器
//!
//! The bucket refills continuously at `requests_per_interval / interval`
//! tokens per unit of time and never holds more than `requests_per_interval`
//! tokens. Callers either take a token immediately or ask how long until the
//! next token exists.
//! 令牌桶以 `requests_per_interval / interval` 的速率持续补充，容量上限为 `requests_per_interval`。

use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket / 令牌桶
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    /// Tokens added per millisecond / 每毫秒补充的令牌数
    refill_per_ms: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket / 创建满令牌桶
    pub fn new(requests_per_interval: u32, interval: Duration) -> Self {
        let capacity = requests_per_interval.max(1) as f64;
        let interval_ms = (interval.as_secs_f64() * 1000.0).max(1.0);
        Self {
            capacity,
            refill_per_ms: capacity / interval_ms,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed_ms = now.duration_since(state.last_refill).as_secs_f64() * 1000.0;
        if elapsed_ms > 0.0 {
            state.tokens = (state.tokens + elapsed_ms * self.refill_per_ms).min(self.capacity);
            state.last_refill = now;
        }
    }

    /// Take one token if available / 尝试获取一个令牌
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Delay until the next whole token exists; zero when one is available now
    /// 距离下一个完整令牌可用的等待时间；当前可用时为零
    pub fn wait_time(&self) -> Duration {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        if state.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let missing = 1.0 - state.tokens;
        Duration::from_secs_f64(missing / self.refill_per_ms / 1000.0)
    }

    /// Tokens currently in the bucket / 当前令牌数
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}
