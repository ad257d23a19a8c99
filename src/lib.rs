//! Hydra Pool: elastic pool of AI backend execution instances
//! Hydra Pool：弹性 AI 后端执行实例池

// Shared modules / 共享模块
pub mod config;
pub mod utils;

// Pool core / 池核心
pub mod pool;

// Re-exports / 重新导出
pub use config::{init_tracing, AppConfig, HydraConfig};
pub use pool::{
    AcquireOptions, CommandBackend, CommandBackendConfig, ExecutionBackend, Instance, LoadBalancingStrategy,
    PoolConfig, PoolError, PoolEvent, PoolManager, PoolResult, Priority, TaskOptions, TaskResult,
};
pub use utils::*;
