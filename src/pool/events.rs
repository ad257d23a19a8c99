//! Pool events
//! 池事件
//!
//! Instances report to their pool over a reliable `mpsc` channel
//! ([`EventSink`]). The pool reacts to those events and republishes every
//! event on an [`EventBus`], a lossy `broadcast` channel for dashboards and
//! log shippers. Subscribers are advisory: a lagging receiver drops events
//! and the pool never waits for it.
//! 实例通过可靠的 mpsc 通道向池报告事件；池处理后再通过有损的 broadcast 通道
//! 转发给外部订阅者。订阅者仅用于观测，池从不依赖它们。

use super::scaling::ScalingDecision;
use super::scheduler::LoadBalancingStrategy;
use super::types::{CircuitState, FailureKind, InstanceId, LifecycleState};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

/// Default broadcast capacity / 默认广播容量
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Reliable instance → pool channel / 实例到池的可靠通道
pub type EventSink = mpsc::UnboundedSender<PoolEvent>;

/// Discrete pool event / 池事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    InstanceStateChanged {
        instance_id: InstanceId,
        from: LifecycleState,
        to: LifecycleState,
    },
    InstanceCrashed {
        instance_id: InstanceId,
        reason: String,
    },
    InstanceTerminated {
        instance_id: InstanceId,
        reason: String,
    },
    TaskCompleted {
        instance_id: InstanceId,
        correlation_id: String,
        agent: Option<String>,
        success: bool,
        failure: Option<FailureKind>,
        duration_ms: u64,
    },
    ZombieDetected {
        instance_id: InstanceId,
        correlation_id: String,
        running_ms: u64,
    },
    CircuitStateChanged {
        instance_id: InstanceId,
        from: CircuitState,
        to: CircuitState,
    },
    Scaling(ScalingDecision),
    ConfigUpdated {
        min_instances: usize,
        max_instances: usize,
        strategy: LoadBalancingStrategy,
    },
    DrainChanged {
        draining: bool,
    },
}

impl PoolEvent {
    /// Instance the event concerns, if any / 事件相关的实例
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            PoolEvent::InstanceStateChanged { instance_id, .. }
            | PoolEvent::InstanceCrashed { instance_id, .. }
            | PoolEvent::InstanceTerminated { instance_id, .. }
            | PoolEvent::TaskCompleted { instance_id, .. }
            | PoolEvent::ZombieDetected { instance_id, .. }
            | PoolEvent::CircuitStateChanged { instance_id, .. } => Some(instance_id),
            PoolEvent::Scaling(_) | PoolEvent::ConfigUpdated { .. } | PoolEvent::DrainChanged { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PoolEvent::InstanceStateChanged { .. } => "instance_state_changed",
            PoolEvent::InstanceCrashed { .. } => "instance_crashed",
            PoolEvent::InstanceTerminated { .. } => "instance_terminated",
            PoolEvent::TaskCompleted { .. } => "task_completed",
            PoolEvent::ZombieDetected { .. } => "zombie_detected",
            PoolEvent::CircuitStateChanged { .. } => "circuit_state_changed",
            PoolEvent::Scaling(_) => "scaling",
            PoolEvent::ConfigUpdated { .. } => "config_updated",
            PoolEvent::DrainChanged { .. } => "drain_changed",
        }
    }
}

/// Lossy fan-out to external subscribers / 面向外部订阅者的有损广播
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PoolEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers; having none is not an error
    /// 发布给当前订阅者，没有订阅者不算错误
    pub fn publish(&self, event: PoolEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`; lag surfaces as `Err(Lagged)` items
    /// 以 Stream 方式订阅，滞后以 `Err(Lagged)` 项出现
    pub fn stream(&self) -> BroadcastStream<PoolEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
