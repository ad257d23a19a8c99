//! Status and statistics snapshots
//! 状态与统计快照
//!
//! Read-only views handed out by the pool; producing one never mutates pool
//! state.
//! 池对外提供的只读视图，生成快照不会修改池状态。

use super::scheduler::{LoadBalancingStrategy, SchedulingMetrics};
use super::types::{CircuitState, InstanceId, LifecycleState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Per-agent cost ledger entry / 单个代理的成本账目
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentCost {
    pub task_count: u64,
    pub total_duration_ms: u64,
    pub total_cost_usd: f64,
}

impl AgentCost {
    pub fn record(&mut self, duration_ms: u64, cost_usd: Option<f64>) {
        self.task_count += 1;
        self.total_duration_ms += duration_ms;
        self.total_cost_usd += cost_usd.unwrap_or(0.0);
    }

    pub fn merge(&mut self, other: &AgentCost) {
        self.task_count += other.task_count;
        self.total_duration_ms += other.total_duration_ms;
        self.total_cost_usd += other.total_cost_usd;
    }
}

/// Merge `from` into `into`, keyed by agent / 按代理合并账目
pub fn merge_ledgers(into: &mut HashMap<String, AgentCost>, from: &HashMap<String, AgentCost>) {
    for (agent, cost) in from {
        into.entry(agent.clone()).or_default().merge(cost);
    }
}

/// Task currently running on an instance / 实例上正在运行的任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentTaskSnapshot {
    pub correlation_id: String,
    pub agent: Option<String>,
    pub prompt_preview: String,
    pub started_at: DateTime<Utc>,
    pub running_ms: u64,
}

/// Point-in-time view of one instance / 单个实例的快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub lifecycle: LifecycleState,
    pub circuit: CircuitState,
    pub available: bool,
    pub reserved: bool,
    pub task_count: u64,
    pub failed_count: u64,
    pub consecutive_failures: u32,
    pub total_busy_ms: u64,
    pub avg_duration_ms: f64,
    pub idle_ms: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub current_task: Option<CurrentTaskSnapshot>,
    pub costs: HashMap<String, AgentCost>,
}

/// Pool status / 池状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub initialized: bool,
    pub draining: bool,
    pub shutting_down: bool,
    pub strategy: LoadBalancingStrategy,
    pub min_instances: usize,
    pub max_instances: usize,
    /// Instances in the index, any state / 索引中的实例总数
    pub total_instances: usize,
    pub alive: usize,
    pub available: usize,
    pub busy: usize,
    pub crashed: usize,
    pub queue_length: usize,
    pub instances: Vec<InstanceSnapshot>,
}

/// Pool statistics / 池统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_executed: u64,
    pub total_failed: u64,
    pub success_rate: f64,
    pub current_concurrent: usize,
    pub peak_concurrent: usize,
    pub avg_wait_ms: f64,
    pub max_wait_ms: f64,
    pub avg_queue_length: f64,
    pub rate_limited: u64,
    pub queue_overflows: u64,
    pub acquire_timeouts: u64,
    pub hedged_executions: u64,
    pub hedge_wins: u64,
    pub zombies_detected: u64,
    pub scale_up_events: u64,
    pub scale_down_events: u64,
    pub total_cost_usd: f64,
    pub agent_costs: HashMap<String, AgentCost>,
    pub scheduling: SchedulingMetrics,
}

/// Lock-free counters behind [`PoolStats`] / 统计用的无锁计数器
#[derive(Debug, Default)]
pub struct PoolCounters {
    pub executed: AtomicU64,
    pub failed: AtomicU64,
    pub rate_limited: AtomicU64,
    pub queue_overflows: AtomicU64,
    pub acquire_timeouts: AtomicU64,
    pub hedged_executions: AtomicU64,
    pub hedge_wins: AtomicU64,
    pub zombies_detected: AtomicU64,
    pub scale_up_events: AtomicU64,
    pub scale_down_events: AtomicU64,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl PoolCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::Relaxed)
    }

    /// Count one in-flight task until the guard drops / 计数一个进行中的任务直到守卫释放
    pub fn track_active(&self) -> ActiveTaskGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_active.fetch_max(now, Ordering::AcqRel);
        ActiveTaskGuard { counters: self }
    }

    pub fn success_rate(&self) -> f64 {
        let executed = Self::load(&self.executed);
        if executed == 0 {
            return 1.0;
        }
        let failed = Self::load(&self.failed).min(executed);
        (executed - failed) as f64 / executed as f64
    }
}

pub struct ActiveTaskGuard<'a> {
    counters: &'a PoolCounters,
}

impl Drop for ActiveTaskGuard<'_> {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::AcqRel);
    }
}
