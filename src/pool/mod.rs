//! Instance Pool - Hydra Architecture
//! 实例池 - Hydra 架构
//!
//! A pool of execution slots ("instances") in front of an external,
//! per-task-spawned AI backend.
//! 位于外部 AI 后端之前的执行槽（实例）池。
//!
//! ## Architecture Overview / 架构概览
//!
//! ```text
//!  caller ──► PoolManager ──┬── rate limiter ── acquire queue
//!                           ├── Instance (1) ── circuit ── watchdog ──► backend
//!                           ├── Instance (2)
//!                           └── Instance (N)
//!                 ▲                 │
//!                 └──── mpsc events ┘ ──► broadcast subscribers
//! ```
//!
//! ## Features / 特性
//!
//! - **Lifecycle**: strict per-instance state machine / 严格的实例状态机
//! - **Failure isolation**: per-instance circuit breaker and zombie watchdog / 熔断与僵尸检测
//! - **Scheduling**: least-loaded, round-robin and agent affinity / 多种负载均衡策略
//! - **Elasticity**: threshold and pre-warm scale-up, idle scale-down / 自动扩缩容
//! - **Admission**: token bucket, bounded priority queue, drain mode / 准入控制

pub mod backend;
pub mod circuit;
pub mod command_backend;
pub mod config;
pub mod events;
pub mod instance;
pub mod manager;
pub mod queue;
pub mod scaling;
pub mod scheduler;
pub mod stats;
pub mod types;

// Re-export commonly used types / 重新导出常用类型
pub use backend::{
    BackendError, BackendRequest, Diagnosis, ErrorDiagnoser, ExecutionBackend, ModelResolver,
    PatternDiagnoser, RawResult, ResultMessage, StaticModelResolver,
};
pub use circuit::{CircuitBreaker, CircuitTransition};
pub use command_backend::{CommandBackend, CommandBackendConfig};
pub use config::{AdaptiveScalingConfig, CircuitConfig, PoolConfig, RateLimitConfig};
pub use events::{EventBus, PoolEvent};
pub use instance::{Instance, InstanceSettings};
pub use manager::{ParallelTask, PoolManager, ScaleOutcome};
pub use scaling::{ScalingAction, ScalingDecision};
pub use scheduler::{LoadBalancer, LoadBalancingStrategy, SchedulingMetrics};
pub use stats::{AgentCost, InstanceSnapshot, PoolStats, PoolStatus};
pub use types::{
    AcquireOptions, CircuitState, FailureKind, InstanceId, LifecycleState, Priority, TaskOptions,
    TaskResult,
};

/// Pool result type / 池结果类型
pub type PoolResult<T> = Result<T, PoolError>;

/// Pool errors / 池错误
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Rate limit exceeded, next token in {wait_ms}ms")]
    RateLimited { wait_ms: u64 },

    #[error("Acquire queue full ({queue_len}/{max_queue_size}), pool size {pool_size}, busy {busy}")]
    QueueFull {
        queue_len: usize,
        max_queue_size: usize,
        pool_size: usize,
        busy: usize,
    },

    #[error("Acquire timed out after {waited_ms}ms (queue {queue_len}, pool size {pool_size}, busy {busy})")]
    AcquireTimeout {
        waited_ms: u64,
        queue_len: usize,
        pool_size: usize,
        busy: usize,
    },

    #[error("Pool is draining")]
    Draining,

    #[error("Pool is shutting down")]
    ShuttingDown,

    #[error("Circuit open for instance {instance_id}")]
    CircuitOpen { instance_id: String },

    #[error("Instance {instance_id} cannot {operation} while {state}")]
    InvalidState {
        instance_id: String,
        state: LifecycleState,
        operation: String,
    },

    #[error("No backend bound to instance {instance_id}")]
    BackendNotBound { instance_id: String },

    #[error("Spawn failed for instance {instance_id} after {attempts} attempt(s): {message}")]
    SpawnFailed {
        instance_id: String,
        attempts: u32,
        message: String,
    },

    #[error("Spawn probe failed for instance {instance_id}: {message}")]
    ProbeFailed { instance_id: String, message: String },

    #[error("Health check failed for instance {instance_id}: {reason}")]
    HealthCheckFailed { instance_id: String, reason: String },

    #[error("Execution on instance {instance_id} rejected (pool size {pool_size}, busy {busy}): {source}")]
    ExecutionRejected {
        instance_id: String,
        pool_size: usize,
        busy: usize,
        #[source]
        source: Box<PoolError>,
    },

    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PoolError {
    /// Transient acquisition pressure the caller may retry / 调用方可重试的暂时性获取失败
    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::RateLimited { .. } | PoolError::QueueFull { .. } | PoolError::AcquireTimeout { .. } => true,
            PoolError::ExecutionRejected { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Instance the failure is local to, if any / 失败所属的实例
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            PoolError::CircuitOpen { instance_id }
            | PoolError::InvalidState { instance_id, .. }
            | PoolError::BackendNotBound { instance_id }
            | PoolError::SpawnFailed { instance_id, .. }
            | PoolError::ProbeFailed { instance_id, .. }
            | PoolError::HealthCheckFailed { instance_id, .. }
            | PoolError::ExecutionRejected { instance_id, .. } => Some(instance_id),
            _ => None,
        }
    }

    /// Innermost error, unwrapping execution rejections / 最内层错误
    pub fn root(&self) -> &PoolError {
        match self {
            PoolError::ExecutionRejected { source, .. } => source.root(),
            other => other,
        }
    }
}
