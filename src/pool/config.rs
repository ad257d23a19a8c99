//! Pool configuration
//! 池配置
//!
//! Every field has a default so partial TOML / environment overrides work.
//! The whole struct can be swapped at runtime through
//! `PoolManager::update_config`.
//! 所有字段都有默认值；整个结构可以在运行时通过 `update_config` 热更新。

use super::scheduler::LoadBalancingStrategy;
use crate::utils::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Circuit breaker parameters / 熔断器参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit / 打开熔断的连续失败次数
    pub max_consecutive_failures: u32,
    /// Time spent open before probing again / 打开状态持续时间
    pub cooldown_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            cooldown_ms: 30_000,
        }
    }
}

/// Adaptive scale-up threshold / 自适应扩容阈值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveScalingConfig {
    pub enabled: bool,
    /// Sustained-pressure multiplier / 持续压力倍数
    pub scale_factor: f64,
    /// Queue-length samples kept for the rolling average / 滚动平均保留的样本数
    pub sample_capacity: usize,
}

impl Default for AdaptiveScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scale_factor: 1.5,
            sample_capacity: 60,
        }
    }
}

/// Token-bucket admission control / 令牌桶准入控制
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_interval: u32,
    pub interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_interval: 60,
            interval_ms: 60_000,
        }
    }
}

impl RateLimitConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Pool configuration / 池配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Minimum alive instances / 最小存活实例数
    pub min_instances: usize,
    /// Maximum alive instances / 最大存活实例数
    pub max_instances: usize,
    /// Load-balancing strategy / 负载均衡策略
    pub strategy: LoadBalancingStrategy,
    /// Acquire queue capacity / 获取队列容量
    pub max_queue_size: usize,
    pub acquire_timeout_ms: u64,
    /// Default per-task execution timeout / 默认任务执行超时
    pub task_timeout_ms: u64,
    pub zombie_timeout_ms: u64,
    pub spawn_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub zombie_check_interval_ms: u64,
    pub scale_up_check_interval_ms: u64,
    pub scale_down_check_interval_ms: u64,
    /// Idle time before an instance may be scaled down / 实例可被缩容前的空闲时间
    pub idle_timeout_ms: u64,
    /// Queue length that triggers a scale-up when every instance is busy
    /// 所有实例忙碌时触发扩容的队列长度
    pub scale_up_threshold: usize,
    /// Upper bound on waiting for busy instances during shutdown / 关闭时等待忙碌实例的上限
    pub shutdown_timeout_ms: u64,
    pub hedging_enabled: bool,
    /// Model used when a task names none / 任务未指定模型时使用的模型
    pub default_model: String,
    /// Logical model aliases / 逻辑模型别名
    pub model_aliases: HashMap<String, String>,
    pub circuit: CircuitConfig,
    pub spawn_retry: RetryPolicy,
    pub adaptive: AdaptiveScalingConfig,
    pub rate_limit: RateLimitConfig,
    /// Acquire-wait samples kept for statistics / 统计保留的获取等待样本数
    pub wait_sample_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_instances: 1,
            max_instances: 5,
            strategy: LoadBalancingStrategy::default(),
            max_queue_size: 100,
            acquire_timeout_ms: 60_000,          // 1 minute
            task_timeout_ms: 300_000,            // 5 minutes
            zombie_timeout_ms: 600_000,          // 10 minutes
            spawn_timeout_ms: 30_000,
            health_check_interval_ms: 30_000,
            zombie_check_interval_ms: 30_000,
            scale_up_check_interval_ms: 5_000,
            scale_down_check_interval_ms: 60_000,
            idle_timeout_ms: 300_000,
            scale_up_threshold: 2,
            shutdown_timeout_ms: 30_000,
            hedging_enabled: false,
            default_model: "default".to_string(),
            model_aliases: HashMap::new(),
            circuit: CircuitConfig::default(),
            spawn_retry: RetryPolicy::default(),
            adaptive: AdaptiveScalingConfig::default(),
            rate_limit: RateLimitConfig::default(),
            wait_sample_capacity: 100,
        }
    }
}

impl PoolConfig {
    /// Check bounds and timeouts; returns a description of the first problem
    /// 检查边界与超时，返回第一个问题的描述
    pub fn validate(&self) -> Result<(), String> {
        if self.max_instances == 0 {
            return Err("max_instances must be greater than 0".to_string());
        }
        if self.min_instances > self.max_instances {
            return Err(format!(
                "min_instances ({}) must not exceed max_instances ({})",
                self.min_instances, self.max_instances
            ));
        }

        let timeouts = [
            ("acquire_timeout_ms", self.acquire_timeout_ms),
            ("task_timeout_ms", self.task_timeout_ms),
            ("zombie_timeout_ms", self.zombie_timeout_ms),
            ("spawn_timeout_ms", self.spawn_timeout_ms),
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("zombie_check_interval_ms", self.zombie_check_interval_ms),
            ("scale_up_check_interval_ms", self.scale_up_check_interval_ms),
            ("scale_down_check_interval_ms", self.scale_down_check_interval_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("shutdown_timeout_ms", self.shutdown_timeout_ms),
            ("circuit.cooldown_ms", self.circuit.cooldown_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, v)| *v == 0) {
            return Err(format!("{} must be greater than 0", name));
        }

        if self.circuit.max_consecutive_failures == 0 {
            return Err("circuit.max_consecutive_failures must be greater than 0".to_string());
        }
        if self.rate_limit.requests_per_interval == 0 || self.rate_limit.interval_ms == 0 {
            return Err("rate_limit requires a non-zero capacity and interval".to_string());
        }
        if self.adaptive.scale_factor.is_nan() || self.adaptive.scale_factor <= 0.0 {
            return Err("adaptive.scale_factor must be positive".to_string());
        }
        if self.default_model.trim().is_empty() {
            return Err("default_model must not be empty".to_string());
        }
        Ok(())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn zombie_timeout(&self) -> Duration {
        Duration::from_millis(self.zombie_timeout_ms)
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn zombie_check_interval(&self) -> Duration {
        Duration::from_millis(self.zombie_check_interval_ms)
    }

    pub fn scale_up_check_interval(&self) -> Duration {
        Duration::from_millis(self.scale_up_check_interval_ms)
    }

    pub fn scale_down_check_interval(&self) -> Duration {
        Duration::from_millis(self.scale_down_check_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit.cooldown_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PoolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_instances, 1);
        assert_eq!(config.max_instances, 5);
        assert_eq!(config.strategy, LoadBalancingStrategy::LeastLoaded);
        assert_eq!(config.circuit.max_consecutive_failures, 3);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let config = PoolConfig {
            min_instances: 4,
            max_instances: 2,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("min_instances"));

        let config = PoolConfig {
            min_instances: 0,
            max_instances: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let config = PoolConfig {
            zombie_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err(),
            "zombie_timeout_ms must be greater than 0"
        );

        let mut config = PoolConfig::default();
        config.circuit.max_consecutive_failures = 0;
        assert!(config.validate().is_err());

        let mut config = PoolConfig::default();
        config.rate_limit.interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: PoolConfig = toml::from_str(
            r#"
            max_instances = 8
            strategy = "round_robin"

            [circuit]
            cooldown_ms = 1000
            "#,
        )
        .unwrap();

        assert_eq!(config.max_instances, 8);
        assert_eq!(config.min_instances, 1);
        assert_eq!(config.strategy, LoadBalancingStrategy::RoundRobin);
        assert_eq!(config.circuit.cooldown_ms, 1000);
        assert_eq!(config.circuit.max_consecutive_failures, 3);
        assert_eq!(config.spawn_retry.max_retries, 3);
    }
}
