//! Core pool types
//! 池核心类型
//!
//! Lifecycle and circuit enums, per-task options and the structured task
//! result returned by every execution.
//! 生命周期与熔断状态枚举、任务选项以及每次执行返回的结构化结果。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Unique identifier for a pool instance / 池实例唯一标识符
pub type InstanceId = String;

/// Instance lifecycle state / 实例生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Created, never spawned / 已创建，尚未启动
    Cold,
    /// Spawn in progress / 启动中
    Spawning,
    /// Idle and able to take a task / 空闲，可接受任务
    Ready,
    /// Running exactly one task / 正在执行一个任务
    Busy,
    /// Faulted; may be respawned or terminated / 故障，可重新启动或终止
    Crashed,
    /// Absorbing end state / 终止（吸收态）
    Terminated,
}

impl LifecycleState {
    /// Whether `self -> to` is a legal transition / 判断 `self -> to` 是否为合法转换
    ///
    /// `Terminated` is reachable from every state through a forced
    /// termination, which bypasses this table.
    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (Cold, Spawning)
                | (Spawning, Ready)
                | (Spawning, Crashed)
                | (Ready, Busy)
                | (Busy, Ready)
                | (Busy, Crashed)
                | (Crashed, Spawning)
                | (Crashed, Terminated)
        )
    }

    /// Counted toward the pool size / 计入池大小
    pub fn is_alive(self) -> bool {
        !matches!(self, LifecycleState::Crashed | LifecycleState::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Cold => "cold",
            LifecycleState::Spawning => "spawning",
            LifecycleState::Ready => "ready",
            LifecycleState::Busy => "busy",
            LifecycleState::Crashed => "crashed",
            LifecycleState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker state / 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Acquisition priority / 获取优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Options for a single task / 单个任务的选项
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Agent tag used for cost accounting and affinity / 用于成本统计与亲和调度的代理标签
    pub agent: Option<String>,
    /// Logical model name, resolved before the backend call / 逻辑模型名
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub max_turns: Option<u32>,
    /// Overrides the instance task timeout / 覆盖实例任务超时
    pub timeout: Option<Duration>,
    /// Eligible for hedged execution / 可参与对冲执行
    pub critical: bool,
    pub priority: Priority,
    /// External cancellation; cancelling it cancels the task, never the reverse
    /// 外部取消信号；取消它会取消任务，反之不会
    pub cancel: Option<CancellationToken>,
}

impl TaskOptions {
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Options relevant to acquiring an instance / 与获取实例相关的选项
    pub fn acquire_options(&self) -> AcquireOptions {
        AcquireOptions {
            agent: self.agent.clone(),
            priority: self.priority,
        }
    }
}

/// Options for `acquire_instance` / `acquire_instance` 的选项
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquireOptions {
    pub agent: Option<String>,
    pub priority: Priority,
}

impl AcquireOptions {
    pub fn high() -> Self {
        Self {
            agent: None,
            priority: Priority::High,
        }
    }
}

/// Classification of a failed execution / 执行失败分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Backend call returned an error / 后端调用抛出错误
    Backend,
    /// Backend answered with a business-level error / 后端返回业务错误
    BusinessError,
    Timeout,
    Cancelled,
    ZombieTimeout,
}

impl FailureKind {
    /// Whether this failure counts against the circuit breaker / 是否计入熔断失败
    pub fn trips_circuit(self) -> bool {
        matches!(
            self,
            FailureKind::Backend | FailureKind::Timeout | FailureKind::ZombieTimeout
        )
    }
}

/// Structured result of one execution / 单次执行的结构化结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Diagnosed error type (e.g. `rate_limit`, `timeout`) / 诊断出的错误类型
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    pub model: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    pub instance_id: InstanceId,
    pub correlation_id: String,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use LifecycleState::*;
        assert!(Cold.can_transition_to(Spawning));
        assert!(Spawning.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Busy));
        assert!(Busy.can_transition_to(Ready));
        assert!(Busy.can_transition_to(Crashed));
        assert!(Crashed.can_transition_to(Spawning));
        assert!(Crashed.can_transition_to(Terminated));
    }

    #[test]
    fn test_illegal_transitions() {
        use LifecycleState::*;
        assert!(!Busy.can_transition_to(Spawning));
        assert!(!Cold.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Spawning));
        assert!(!Terminated.can_transition_to(Spawning));
        assert!(!Terminated.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Ready));
    }

    #[test]
    fn test_alive_states() {
        assert!(LifecycleState::Cold.is_alive());
        assert!(LifecycleState::Busy.is_alive());
        assert!(!LifecycleState::Crashed.is_alive());
        assert!(!LifecycleState::Terminated.is_alive());
    }

    #[test]
    fn test_failure_kind_circuit_policy() {
        assert!(FailureKind::Backend.trips_circuit());
        assert!(FailureKind::Timeout.trips_circuit());
        assert!(FailureKind::ZombieTimeout.trips_circuit());
        assert!(!FailureKind::BusinessError.trips_circuit());
        assert!(!FailureKind::Cancelled.trips_circuit());
    }

    #[test]
    fn test_task_result_serialization_skips_empty_fields() {
        let result = TaskResult {
            success: true,
            content: Some("done".to_string()),
            error: None,
            error_type: None,
            failure: None,
            suggestions: vec![],
            model: "default".to_string(),
            duration_ms: 12,
            cost_usd: Some(0.01),
            instance_id: "inst-1".to_string(),
            correlation_id: "corr-1".to_string(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["content"], "done");
        assert!(json.get("error").is_none());
        assert!(json.get("suggestions").is_none());
        assert_eq!(json["cost_usd"], 0.01);
    }
}
