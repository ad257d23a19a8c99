//! Per-instance circuit breaker
//! 实例级熔断器
//!
//! Consecutive-failure breaker: every failure increments the counter, every
//! success resets it. Reaching the threshold opens the circuit; the owner
//! starts a cooldown timer and calls [`CircuitBreaker::cooldown_elapsed`]
//! when it fires. The first result in half-open decides: success closes,
//! failure re-opens.
//! 连续失败熔断器：失败累加、成功清零，达到阈值即打开；冷却结束后进入半开状态。

use super::types::CircuitState;
use std::time::{Duration, Instant};

/// State change produced by recording an outcome / 记录结果产生的状态变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitTransition {
    pub from: CircuitState,
    pub to: CircuitState,
}

impl CircuitTransition {
    /// The owner must (re)start the cooldown timer / 需要（重新）启动冷却计时器
    pub fn opened(&self) -> bool {
        self.to == CircuitState::Open
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    threshold: u32,
    cooldown: Duration,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            threshold: threshold.max(1),
            cooldown,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    /// Time since the circuit last opened / 自上次打开以来的时间
    pub fn open_for(&self) -> Option<Duration> {
        self.opened_at.map(|at| at.elapsed())
    }

    /// Apply new parameters; the current state is kept / 应用新参数，保持当前状态
    pub fn reconfigure(&mut self, threshold: u32, cooldown: Duration) {
        self.threshold = threshold.max(1);
        self.cooldown = cooldown;
    }

    pub fn record_success(&mut self) -> Option<CircuitTransition> {
        self.consecutive_failures = 0;
        match self.state {
            CircuitState::HalfOpen => self.move_to(CircuitState::Closed),
            _ => None,
        }
    }

    pub fn record_failure(&mut self) -> Option<CircuitTransition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::HalfOpen => self.move_to(CircuitState::Open),
            CircuitState::Closed if self.consecutive_failures >= self.threshold => {
                self.move_to(CircuitState::Open)
            }
            _ => None,
        }
    }

    /// Cooldown fired: `open -> half_open` / 冷却结束：打开 -> 半开
    pub fn cooldown_elapsed(&mut self) -> Option<CircuitTransition> {
        match self.state {
            CircuitState::Open => self.move_to(CircuitState::HalfOpen),
            _ => None,
        }
    }

    /// Force `closed` with a cleared counter (after a successful spawn) / 强制关闭并清零计数
    pub fn reset(&mut self) -> Option<CircuitTransition> {
        self.consecutive_failures = 0;
        self.move_to(CircuitState::Closed)
    }

    fn move_to(&mut self, to: CircuitState) -> Option<CircuitTransition> {
        let from = self.state;
        if from == to {
            if to == CircuitState::Open {
                self.opened_at = Some(Instant::now());
            }
            return None;
        }
        self.state = to;
        self.opened_at = match to {
            CircuitState::Open => Some(Instant::now()),
            _ => None,
        };
        Some(CircuitTransition { from, to })
    }
}
