//! Instance Scheduler
//! 实例调度器
//!
//! Picks one instance out of the currently available set. The caller passes
//! the candidates (already filtered to available instances, in stable
//! creation order); the balancer only decides among them.
//! 从当前可用实例集合中选出一个实例。调用方传入已过滤的候选实例，调度器只负责选择。

use super::instance::Instance;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

/// Load-balancing strategy / 负载均衡策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Fewest completed tasks, ties broken by lower mean duration / 完成任务最少者优先
    #[default]
    LeastLoaded,
    /// Cyclic index over the available set / 在可用集合上轮询
    RoundRobin,
    /// Stable hash of the agent tag / 按代理标签哈希
    AgentAffinity,
}

/// Scheduling metrics / 调度指标
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulingMetrics {
    /// Total scheduling decisions / 总调度决策数
    pub total_decisions: u64,
    /// Decisions that produced an instance / 成功决策数
    pub successful_decisions: u64,
    /// Decisions with no candidate / 无候选实例的决策数
    pub empty_decisions: u64,
    /// Average decision time / 平均决策时间
    pub average_decision_time_us: f64,
    total_decision_time_us: u64,
}

/// Strategy dispatcher / 策略分发器
///
/// The round-robin index is never reset. After the available set grows or
/// shrinks the index keeps counting, so the cycle restarts at an arbitrary
/// position; selection stays in bounds through the modulo.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    round_robin_index: AtomicU64,
    metrics: RwLock<SchedulingMetrics>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select best instance among `candidates` / 在候选实例中选择最佳实例
    pub fn select(
        &self,
        strategy: LoadBalancingStrategy,
        candidates: &[Arc<Instance>],
        agent: Option<&str>,
    ) -> Option<Arc<Instance>> {
        let start_time = Instant::now();

        let selected = if candidates.is_empty() {
            None
        } else {
            match strategy {
                LoadBalancingStrategy::LeastLoaded => Self::select_least_loaded(candidates),
                LoadBalancingStrategy::RoundRobin => self.select_round_robin(candidates),
                LoadBalancingStrategy::AgentAffinity => match agent {
                    Some(agent) => Self::select_by_affinity(candidates, agent),
                    None => Self::select_least_loaded(candidates),
                },
            }
        };

        let elapsed_us = start_time.elapsed().as_micros() as u64;
        {
            let mut metrics = self.metrics.write();
            metrics.total_decisions += 1;
            metrics.total_decision_time_us += elapsed_us;
            metrics.average_decision_time_us =
                metrics.total_decision_time_us as f64 / metrics.total_decisions as f64;
            if selected.is_some() {
                metrics.successful_decisions += 1;
            } else {
                metrics.empty_decisions += 1;
            }
        }

        trace!(
            strategy = ?strategy,
            candidates = candidates.len(),
            selected = selected.as_ref().map(|i| i.id()).unwrap_or("none"),
            "Scheduling decision"
        );

        selected
    }

    /// Least loaded selection / 最小负载选择
    fn select_least_loaded(candidates: &[Arc<Instance>]) -> Option<Arc<Instance>> {
        candidates
            .iter()
            .map(|instance| (instance, instance.task_count(), instance.avg_duration_ms()))
            .min_by(|(_, count_a, avg_a), (_, count_b, avg_b)| {
                count_a
                    .cmp(count_b)
                    .then_with(|| avg_a.partial_cmp(avg_b).unwrap_or(CmpOrdering::Equal))
            })
            .map(|(instance, _, _)| instance.clone())
    }

    /// Round robin selection / 轮询选择
    fn select_round_robin(&self, candidates: &[Arc<Instance>]) -> Option<Arc<Instance>> {
        let index = self.round_robin_index.fetch_add(1, Ordering::SeqCst) as usize;
        candidates.get(index % candidates.len()).cloned()
    }

    /// Agent affinity selection / 代理亲和选择
    fn select_by_affinity(candidates: &[Arc<Instance>], agent: &str) -> Option<Arc<Instance>> {
        let index = (affinity_hash(agent) % candidates.len() as u64) as usize;
        candidates.get(index).cloned()
    }

    pub fn get_metrics(&self) -> SchedulingMetrics {
        self.metrics.read().clone()
    }
}

/// Deterministic 64-bit hash of an agent tag / 代理标签的确定性64位哈希
pub fn affinity_hash(agent: &str) -> u64 {
    let digest = Sha256::digest(agent.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}
