//! Shared stub backends for integration tests
//! 集成测试共用的桩后端

#![allow(dead_code)]

use async_trait::async_trait;
use hydra_pool::pool::{
    BackendError, BackendRequest, ExecutionBackend, PoolConfig, PoolEvent, RawResult, ResultMessage,
};
use hydra_pool::utils::RetryPolicy;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

/// Succeeds after a fixed latency; observes cancellation / 固定延迟后成功，响应取消
pub struct LatencyBackend {
    latency: Duration,
    cost_usd: Option<f64>,
    calls: AtomicUsize,
    cancelled: AtomicUsize,
}

impl LatencyBackend {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            cost_usd: None,
            calls: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        }
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionBackend for LatencyBackend {
    fn name(&self) -> &str {
        "latency"
    }

    async fn execute(&self, request: BackendRequest) -> Result<RawResult, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = tokio::time::sleep(self.latency) => {}
            _ = request.cancel.cancelled() => {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                return Err(BackendError::new("cancelled"));
            }
        }
        let mut message = ResultMessage::success(format!("echo: {}", request.prompt));
        if let Some(cost) = self.cost_usd {
            message = message.with_cost(cost);
        }
        Ok(RawResult::completed(message))
    }
}

/// Always throws / 总是抛出错误
#[derive(Default)]
pub struct FailingBackend {
    calls: AtomicUsize,
}

impl FailingBackend {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionBackend for FailingBackend {
    async fn execute(&self, _request: BackendRequest) -> Result<RawResult, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(BackendError::new("connection refused").with_stderr("network unreachable"))
    }
}

/// Never resolves and ignores cancellation / 永不返回且忽略取消
#[derive(Default)]
pub struct HangingBackend {
    calls: AtomicUsize,
}

impl HangingBackend {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionBackend for HangingBackend {
    async fn execute(&self, _request: BackendRequest) -> Result<RawResult, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
        Ok(RawResult::error("unreachable"))
    }
}

/// Answers with a business-level error / 返回业务错误
#[derive(Default)]
pub struct BusinessErrorBackend {
    calls: AtomicUsize,
}

impl BusinessErrorBackend {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionBackend for BusinessErrorBackend {
    async fn execute(&self, _request: BackendRequest) -> Result<RawResult, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RawResult::Error {
            message: "rate limit exceeded (429)".to_string(),
            stderr_output: None,
        })
    }
}

/// Probe always fails / 就绪探测总是失败
#[derive(Default)]
pub struct UnprobeableBackend {
    probes: AtomicUsize,
}

impl UnprobeableBackend {
    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionBackend for UnprobeableBackend {
    async fn probe(&self) -> Result<(), BackendError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Err(BackendError::new("binary not found"))
    }

    async fn execute(&self, _request: BackendRequest) -> Result<RawResult, BackendError> {
        Err(BackendError::new("never spawned"))
    }
}

/// Config with background loops effectively disabled / 后台循环基本关闭的配置
pub fn quiet_config(min: usize, max: usize) -> PoolConfig {
    PoolConfig {
        min_instances: min,
        max_instances: max,
        scale_up_check_interval_ms: 3_600_000,
        scale_down_check_interval_ms: 3_600_000,
        health_check_interval_ms: 3_600_000,
        zombie_check_interval_ms: 3_600_000,
        acquire_timeout_ms: 2_000,
        shutdown_timeout_ms: 1_000,
        spawn_retry: RetryPolicy {
            max_retries: 1,
            initial_delay_ms: 10,
            max_delay_ms: 20,
        },
        ..Default::default()
    }
}

/// Wait until an event matching `pred` arrives / 等待满足条件的事件
pub async fn wait_for_event<F>(rx: &mut broadcast::Receiver<PoolEvent>, timeout: Duration, mut pred: F) -> Option<PoolEvent>
where
    F: FnMut(&PoolEvent) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Poll `cond` until it holds / 轮询直到条件成立
pub async fn wait_until<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
