//! Scaling decisions
//! 扩缩容决策
//!
//! Pure decision logic for the automatic scaler plus the bounded history of
//! every scaling action the pool has taken.
//! 自动扩缩容的纯决策逻辑，以及池执行过的扩缩容动作的有界历史。

use super::config::AdaptiveScalingConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Maximum number of retained scaling decisions / 保留的扩缩容决策上限
pub const SCALING_HISTORY_CAPACITY: usize = 100;

/// Scaling action / 扩缩容动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    /// Scale up / 扩容
    ScaleUp,
    /// Scale down / 缩容
    ScaleDown,
}

/// One recorded scaling decision / 一条扩缩容决策记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    /// Scaling action / 扩缩容动作
    pub action: ScalingAction,
    /// Decision reason / 决策原因
    pub reason: String,
    /// Alive instances before the action / 动作前的存活实例数
    pub before_count: usize,
    /// Alive instances after the action / 动作后的存活实例数
    pub after_count: usize,
    /// Queue length at decision time / 决策时的队列长度
    pub queue_length: usize,
    /// Busy instances at decision time / 决策时的忙碌实例数
    pub busy_count: usize,
    /// Decision timestamp / 决策时间戳
    pub timestamp: DateTime<Utc>,
}

/// Append-only log capped at [`SCALING_HISTORY_CAPACITY`], oldest evicted
/// 追加式日志，超出容量时淘汰最旧记录
#[derive(Debug, Clone)]
pub struct ScalingHistory {
    entries: VecDeque<ScalingDecision>,
    capacity: usize,
}

impl Default for ScalingHistory {
    fn default() -> Self {
        Self::with_capacity(SCALING_HISTORY_CAPACITY)
    }
}

impl ScalingHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, decision: ScalingDecision) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(decision);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, action: ScalingAction) -> usize {
        self.entries.iter().filter(|d| d.action == action).count()
    }

    /// Oldest first / 从旧到新
    pub fn to_vec(&self) -> Vec<ScalingDecision> {
        self.entries.iter().cloned().collect()
    }
}

/// Pool snapshot consumed by [`evaluate_scale_up`] / 扩容决策的输入快照
#[derive(Debug, Clone, Copy)]
pub struct ScaleUpInputs {
    pub alive: usize,
    pub available: usize,
    pub busy: usize,
    pub queue_length: usize,
    pub max_instances: usize,
    pub threshold: usize,
    /// Rolling average of sampled queue lengths / 队列长度采样的滚动平均
    pub avg_queue_length: f64,
}

/// Why the scaler wants one more instance / 扩容原因
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleUpTrigger {
    /// Work is waiting and nothing can take it / 有等待的请求且无可用实例
    PreWarm,
    /// Everyone is busy and the queue reached the effective threshold
    /// 全部忙碌且队列达到有效阈值
    Threshold { effective: f64 },
}

impl ScaleUpTrigger {
    pub fn reason(&self) -> String {
        match self {
            ScaleUpTrigger::PreWarm => "pre-warm: queued requests with no available instance".to_string(),
            ScaleUpTrigger::Threshold { effective } => {
                format!("queue length reached threshold {:.2}", effective)
            }
        }
    }
}

/// Threshold after adaptive adjustment: lowered by 25% while the rolling
/// average queue length exceeds `threshold * scale_factor`.
/// 自适应调整后的阈值：滚动平均队列长度超过 `threshold * scale_factor` 时降低25%。
pub fn effective_threshold(threshold: usize, adaptive: &AdaptiveScalingConfig, avg_queue_length: f64) -> f64 {
    let base = threshold as f64;
    if adaptive.enabled && avg_queue_length > base * adaptive.scale_factor {
        base * 0.75
    } else {
        base
    }
}

pub fn evaluate_scale_up(inputs: &ScaleUpInputs, adaptive: &AdaptiveScalingConfig) -> Option<ScaleUpTrigger> {
    if inputs.alive >= inputs.max_instances {
        return None;
    }

    if inputs.queue_length > 0 && inputs.available == 0 {
        return Some(ScaleUpTrigger::PreWarm);
    }

    let effective = effective_threshold(inputs.threshold, adaptive, inputs.avg_queue_length);
    let all_busy = inputs.alive > 0 && inputs.busy >= inputs.alive;
    if all_busy && inputs.queue_length as f64 >= effective {
        return Some(ScaleUpTrigger::Threshold { effective });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> ScaleUpInputs {
        ScaleUpInputs {
            alive: 2,
            available: 0,
            busy: 2,
            queue_length: 0,
            max_instances: 4,
            threshold: 4,
            avg_queue_length: 0.0,
        }
    }

    fn decision(action: ScalingAction, n: usize) -> ScalingDecision {
        ScalingDecision {
            action,
            reason: format!("test-{}", n),
            before_count: n,
            after_count: n + 1,
            queue_length: 0,
            busy_count: 0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut history = ScalingHistory::with_capacity(3);
        for i in 0..5 {
            history.record(decision(ScalingAction::ScaleUp, i));
        }
        let entries = history.to_vec();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].reason, "test-2");
        assert_eq!(entries[2].reason, "test-4");
    }

    #[test]
    fn test_history_default_capacity() {
        let mut history = ScalingHistory::default();
        for i in 0..150 {
            let action = if i % 2 == 0 { ScalingAction::ScaleUp } else { ScalingAction::ScaleDown };
            history.record(decision(action, i));
        }
        assert_eq!(history.len(), SCALING_HISTORY_CAPACITY);
        assert_eq!(history.count(ScalingAction::ScaleUp), 50);
    }

    #[test]
    fn test_pre_warm_ignores_threshold() {
        let adaptive = AdaptiveScalingConfig::default();
        let mut i = inputs();
        i.queue_length = 1;
        assert_eq!(evaluate_scale_up(&i, &adaptive), Some(ScaleUpTrigger::PreWarm));
    }

    #[test]
    fn test_threshold_requires_all_busy() {
        let adaptive = AdaptiveScalingConfig {
            enabled: false,
            ..Default::default()
        };
        let mut i = inputs();
        i.queue_length = 4;
        i.available = 1;
        i.busy = 1;
        assert_eq!(evaluate_scale_up(&i, &adaptive), None);

        i.available = 0;
        i.busy = 2;
        assert!(matches!(
            evaluate_scale_up(&i, &adaptive),
            Some(ScaleUpTrigger::PreWarm)
        ));
    }

    #[test]
    fn test_threshold_path_on_empty_queue() {
        let adaptive = AdaptiveScalingConfig::default();
        let mut i = inputs();
        assert_eq!(evaluate_scale_up(&i, &adaptive), None);

        i.threshold = 0;
        assert_eq!(
            evaluate_scale_up(&i, &adaptive),
            Some(ScaleUpTrigger::Threshold { effective: 0.0 })
        );
    }

    #[test]
    fn test_adaptive_lowers_threshold() {
        let adaptive = AdaptiveScalingConfig {
            enabled: true,
            scale_factor: 1.5,
            ..Default::default()
        };
        assert_eq!(effective_threshold(4, &adaptive, 2.0), 4.0);
        assert_eq!(effective_threshold(4, &adaptive, 6.5), 3.0);

        let disabled = AdaptiveScalingConfig {
            enabled: false,
            ..adaptive
        };
        assert_eq!(effective_threshold(4, &disabled, 100.0), 4.0);
    }

    #[test]
    fn test_never_beyond_max() {
        let adaptive = AdaptiveScalingConfig::default();
        let mut i = inputs();
        i.alive = 4;
        i.busy = 4;
        i.queue_length = 10;
        assert_eq!(evaluate_scale_up(&i, &adaptive), None);
    }
}
