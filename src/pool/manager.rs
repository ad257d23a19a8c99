//! Pool Manager
//! 池管理器
//!
//! Owns the instance index, the acquire queue, the scaling lock and the
//! background control loops (scale-up check, idle scale-down, health sweep,
//! zombie sweep). Every public operation takes `&self`; shared state sits
//! behind `DashMap` / `parking_lot` locks that are never held across an
//! `.await`.
//! 拥有实例索引、获取队列、扩缩容锁以及后台控制循环。
//!
//! Instances report lifecycle changes over an `mpsc` channel. A single
//! dispatcher task reacts to them (serving the queue when an instance becomes
//! ready, respawning crashed instances, replacing terminated ones) and then
//! republishes each event to external subscribers.

use super::backend::{ErrorDiagnoser, ExecutionBackend, ModelResolver, PatternDiagnoser, StaticModelResolver};
use super::config::{PoolConfig, RateLimitConfig};
use super::events::{EventBus, EventSink, PoolEvent};
use super::instance::{Instance, InstanceSettings};
use super::queue::{AcquireQueue, Waiter};
use super::scaling::{evaluate_scale_up, ScaleUpInputs, ScalingAction, ScalingDecision, ScalingHistory};
use super::scheduler::LoadBalancer;
use super::stats::{merge_ledgers, AgentCost, InstanceSnapshot, PoolCounters, PoolStats, PoolStatus};
use super::types::{AcquireOptions, CircuitState, InstanceId, LifecycleState, TaskOptions, TaskResult};
use super::{PoolError, PoolResult};
use crate::utils::{RingBuffer, TokenBucket};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::{join_all, try_join_all};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, OnceCell, Semaphore};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const BACKGROUND_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a scaling request / 扩缩容请求结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScaleOutcome {
    /// Alive instance count before and after / 动作前后的存活实例数
    Applied { before: usize, after: usize },
    /// Another scaling operation held the lock / 另一个扩缩容操作持有锁
    Skipped,
}

/// One entry for [`PoolManager::execute_parallel`] / 并行执行的单个任务
#[derive(Debug, Clone)]
pub struct ParallelTask {
    pub prompt: String,
    pub options: TaskOptions,
}

impl ParallelTask {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            options: TaskOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }
}

/// Pool manager / 池管理器
pub struct PoolManager {
    config: RwLock<PoolConfig>,
    backend: Arc<dyn ExecutionBackend>,
    resolver: RwLock<Arc<dyn ModelResolver>>,
    diagnoser: RwLock<Arc<dyn ErrorDiagnoser>>,
    /// Instance index / 实例索引
    instances: DashMap<InstanceId, Arc<Instance>>,
    /// Instances whose spawn is being driven by the pool / 正在由池驱动启动的实例
    recovering: Mutex<HashSet<InstanceId>>,
    queue: Mutex<AcquireQueue>,
    balancer: LoadBalancer,
    rate_limiter: RwLock<Option<Arc<TokenBucket>>>,
    /// Single scaling permit shared by manual and automatic scaling / 手动与自动扩缩容共享的唯一许可
    scaling_lock: Semaphore,
    history: Mutex<ScalingHistory>,
    wait_samples: Mutex<RingBuffer<f64>>,
    queue_samples: Mutex<RingBuffer<f64>>,
    counters: PoolCounters,
    /// Ledgers of instances that left the index / 已移出索引的实例账目
    retired_costs: Mutex<HashMap<String, AgentCost>>,
    draining: AtomicBool,
    shutting_down: AtomicBool,
    initialized: OnceCell<()>,
    events: EventBus,
    event_tx: EventSink,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<PoolEvent>>>,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
    this: Weak<PoolManager>,
}

impl PoolManager {
    /// Create a pool over `backend`; call [`initialize`](Self::initialize) to start it
    /// 基于后端创建池，调用 initialize 启动
    pub fn new(config: PoolConfig, backend: Arc<dyn ExecutionBackend>) -> PoolResult<Arc<Self>> {
        config
            .validate()
            .map_err(|message| PoolError::InvalidConfiguration { message })?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let resolver: Arc<dyn ModelResolver> = Arc::new(StaticModelResolver::new(config.model_aliases.clone()));

        Ok(Arc::new_cyclic(|this| Self {
            rate_limiter: RwLock::new(Self::build_rate_limiter(&config.rate_limit)),
            wait_samples: Mutex::new(RingBuffer::new(config.wait_sample_capacity)),
            queue_samples: Mutex::new(RingBuffer::new(config.adaptive.sample_capacity)),
            config: RwLock::new(config),
            backend,
            resolver: RwLock::new(resolver),
            diagnoser: RwLock::new(Arc::new(PatternDiagnoser)),
            instances: DashMap::new(),
            recovering: Mutex::new(HashSet::new()),
            queue: Mutex::new(AcquireQueue::new()),
            balancer: LoadBalancer::new(),
            scaling_lock: Semaphore::new(1),
            history: Mutex::new(ScalingHistory::default()),
            counters: PoolCounters::default(),
            retired_costs: Mutex::new(HashMap::new()),
            draining: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            initialized: OnceCell::new(),
            events: EventBus::default(),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
            this: this.clone(),
        }))
    }

    fn build_rate_limiter(config: &RateLimitConfig) -> Option<Arc<TokenBucket>> {
        config
            .enabled
            .then(|| Arc::new(TokenBucket::new(config.requests_per_interval, config.interval())))
    }

    fn arc(&self) -> PoolResult<Arc<Self>> {
        self.this.upgrade().ok_or(PoolError::ShuttingDown)
    }

    /// Replace the model resolver for current and future instances / 替换模型解析器
    pub fn set_model_resolver(&self, resolver: Arc<dyn ModelResolver>) {
        *self.resolver.write() = resolver.clone();
        for instance in self.sorted_instances() {
            instance.set_model_resolver(resolver.clone());
        }
    }

    /// Replace the error diagnoser for current and future instances / 替换错误诊断器
    pub fn set_error_diagnoser(&self, diagnoser: Arc<dyn ErrorDiagnoser>) {
        *self.diagnoser.write() = diagnoser.clone();
        for instance in self.sorted_instances() {
            instance.set_error_diagnoser(diagnoser.clone());
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle / 生命周期
    // ------------------------------------------------------------------

    /// Spawn `min_instances` and start the control loops. Idempotent; a
    /// concurrent second call waits for the first.
    /// 启动最小实例数并开启控制循环。幂等，并发调用会等待第一次完成。
    pub async fn initialize(&self) -> PoolResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }
        self.initialized
            .get_or_try_init(|| async { self.do_initialize().await })
            .await
            .map(|_| ())
    }

    async fn do_initialize(&self) -> PoolResult<()> {
        if let Some(rx) = self.event_rx.lock().take() {
            let handle = tokio::spawn(Self::run_event_dispatcher(self.this.clone(), self.shutdown.clone(), rx));
            self.background.lock().push(handle);
        }

        let min_instances = self.config.read().min_instances;
        let created: Vec<Arc<Instance>> = (0..min_instances).map(|_| self.create_instance()).collect();
        let results = join_all(created.into_iter().map(|i| self.finish_new_instance(i))).await;

        let mut first_error = None;
        let mut spawned = 0usize;
        for result in results {
            match result {
                Ok(_) => spawned += 1,
                Err(e) => {
                    warn!(error = %e, "Initial instance failed to spawn");
                    first_error.get_or_insert(e);
                }
            }
        }
        if spawned == 0 {
            if let Some(error) = first_error {
                return Err(error);
            }
        }

        // loops hold a weak handle so dropping the last `Arc` stops them
        let handles = vec![
            tokio::spawn(Self::run_scale_up_loop(self.this.clone(), self.shutdown.clone())),
            tokio::spawn(Self::run_scale_down_loop(self.this.clone(), self.shutdown.clone())),
            tokio::spawn(Self::run_health_check_loop(self.this.clone(), self.shutdown.clone())),
            tokio::spawn(Self::run_zombie_check_loop(self.this.clone(), self.shutdown.clone())),
        ];
        self.background.lock().extend(handles);

        info!(instances = spawned, min_instances, "Pool initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    /// Stop admitting new acquisitions / 停止接受新的获取请求
    pub fn start_drain(&self) {
        if !self.draining.swap(true, Ordering::SeqCst) {
            info!("Pool draining");
            self.events.publish(PoolEvent::DrainChanged { draining: true });
        }
    }

    pub fn stop_drain(&self) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if self.draining.swap(false, Ordering::SeqCst) {
            info!("Pool drain stopped");
            self.events.publish(PoolEvent::DrainChanged { draining: false });
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Drain, wait (bounded) for busy instances, terminate everything and reject queued callers
    /// 排空、等待忙碌实例（有上限）、终止所有实例并拒绝排队请求
    pub async fn shutdown(&self) -> PoolResult<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.start_drain();
        info!("Pool shutting down");

        let waiters = self.queue.lock().drain();
        let rejected = waiters.len();
        for waiter in waiters {
            let _ = waiter.resolve(Err(PoolError::ShuttingDown));
        }
        if rejected > 0 {
            debug!(rejected, "Rejected queued acquisitions");
        }

        let shutdown_timeout = self.config.read().shutdown_timeout();
        let wait_for_idle = async {
            while self.busy_count() > 0 {
                tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
            }
        };
        if tokio::time::timeout(shutdown_timeout, wait_for_idle).await.is_err() {
            warn!(
                busy = self.busy_count(),
                timeout_ms = shutdown_timeout.as_millis() as u64,
                "Shutdown timeout elapsed with busy instances"
            );
        }

        for instance in self.sorted_instances() {
            self.retire(instance.id());
            instance.terminate("pool shutdown");
        }

        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.background.lock());
        if tokio::time::timeout(BACKGROUND_JOIN_TIMEOUT, join_all(handles))
            .await
            .is_err()
        {
            warn!("Background tasks did not stop in time");
        }

        info!("Pool shut down");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Acquisition / 获取
    // ------------------------------------------------------------------

    fn ensure_accepting(&self) -> PoolResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }
        if self.draining.load(Ordering::SeqCst) {
            return Err(PoolError::Draining);
        }
        Ok(())
    }

    /// Return an available instance, reserved for the caller, or wait in the queue
    /// 返回一个为调用方预留的可用实例，或在队列中等待
    ///
    /// The caller must either execute on the instance or hand it back with
    /// [`release_instance`](Self::release_instance).
    pub async fn acquire_instance(&self, options: AcquireOptions) -> PoolResult<Arc<Instance>> {
        self.ensure_accepting()?;
        self.initialize().await?;
        self.admit().await?;

        let started = Instant::now();
        if let Some(instance) = self.try_acquire_available(&options) {
            self.record_wait(started.elapsed());
            return Ok(instance);
        }

        let max_instances = self.config.read().max_instances;
        if self.alive_count() < max_instances {
            match self.scaling_lock.try_acquire() {
                Ok(_permit) => {
                    self.do_scale_up(1, "on-demand: no available instance").await;
                }
                Err(_) => debug!("Scaling in progress, skipping on-demand scale-up"),
            }
            if let Some(instance) = self.try_acquire_available(&options) {
                self.record_wait(started.elapsed());
                return Ok(instance);
            }
        }

        self.ensure_accepting()?;
        self.enqueue(options, started).await
    }

    /// Hand back an acquired instance that was not used / 归还未使用的实例
    pub fn release_instance(&self, instance: &Arc<Instance>) {
        if instance.release_reservation() {
            self.service_queue();
        }
    }

    /// Token-bucket admission with one bounded retry / 令牌桶准入，最多重试一次
    async fn admit(&self) -> PoolResult<()> {
        let Some(limiter) = self.rate_limiter.read().clone() else {
            return Ok(());
        };
        if limiter.try_acquire() {
            return Ok(());
        }

        let wait = limiter.wait_time().min(self.config.read().acquire_timeout());
        debug!(wait_ms = wait.as_millis() as u64, "Rate limited, waiting for refill");
        tokio::time::sleep(wait).await;
        if limiter.try_acquire() {
            return Ok(());
        }

        PoolCounters::incr(&self.counters.rate_limited);
        let wait_ms = limiter.wait_time().as_millis() as u64;
        warn!(wait_ms, "Rate limit exceeded");
        Err(PoolError::RateLimited { wait_ms })
    }

    fn try_acquire_available(&self, options: &AcquireOptions) -> Option<Arc<Instance>> {
        let strategy = self.config.read().strategy;
        let candidates = self.available_instances();
        if candidates.is_empty() {
            return None;
        }
        if let Some(chosen) = self.balancer.select(strategy, &candidates, options.agent.as_deref()) {
            if chosen.try_reserve() {
                return Some(chosen);
            }
        }
        candidates.into_iter().find(|instance| instance.try_reserve())
    }

    async fn enqueue(&self, options: AcquireOptions, started: Instant) -> PoolResult<Arc<Instance>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.queue.lock();
            queue.prune_abandoned();
            let (max_queue_size, acquire_timeout) = {
                let config = self.config.read();
                (config.max_queue_size, config.acquire_timeout())
            };
            if queue.len() >= max_queue_size {
                PoolCounters::incr(&self.counters.queue_overflows);
                let err = PoolError::QueueFull {
                    queue_len: queue.len(),
                    max_queue_size,
                    pool_size: self.alive_count(),
                    busy: self.busy_count(),
                };
                warn!(error = %err, "Acquire rejected");
                return Err(err);
            }

            let id = queue.next_id();
            let mut waiter = Waiter::new(id, options, tx);
            waiter.set_timer(self.spawn_acquire_timer(id, acquire_timeout));
            queue.push(waiter);
            debug!(waiter_id = id, queue_len = queue.len(), "Acquisition queued");
        }

        self.service_queue();

        match rx.await {
            Ok(Ok(instance)) => {
                self.record_wait(started.elapsed());
                Ok(instance)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PoolError::ShuttingDown),
        }
    }

    fn spawn_acquire_timer(&self, waiter_id: u64, timeout: Duration) -> JoinHandle<()> {
        let this = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(pool) = this.upgrade() {
                pool.expire_waiter(waiter_id);
            }
        })
    }

    fn expire_waiter(&self, waiter_id: u64) {
        let (waiter, queue_len) = {
            let mut queue = self.queue.lock();
            let waiter = queue.remove(waiter_id);
            (waiter, queue.len())
        };
        let Some(waiter) = waiter else {
            return;
        };

        PoolCounters::incr(&self.counters.acquire_timeouts);
        let err = PoolError::AcquireTimeout {
            waited_ms: waiter.waited().as_millis() as u64,
            queue_len,
            pool_size: self.alive_count(),
            busy: self.busy_count(),
        };
        warn!(error = %err, "Queued acquisition timed out");
        let _ = waiter.resolve(Err(err));
    }

    /// Hand available instances to queued waiters, head first / 按队首顺序将可用实例交给等待者
    fn service_queue(&self) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        loop {
            let mut queue = self.queue.lock();
            queue.prune_abandoned();
            let Some(options) = queue.front().map(|w| w.options.clone()) else {
                return;
            };
            let Some(instance) = self.try_acquire_available(&options) else {
                return;
            };
            let Some(waiter) = queue.pop_front() else {
                instance.release_reservation();
                return;
            };
            drop(queue);

            let waited_ms = waiter.waited().as_millis() as u64;
            let waiter_id = waiter.id;
            match waiter.resolve(Ok(instance)) {
                Ok(()) => debug!(waiter_id, waited_ms, "Queued acquisition served"),
                Err(Ok(instance)) => {
                    instance.release_reservation();
                }
                Err(Err(_)) => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Execution / 执行
    // ------------------------------------------------------------------

    /// Acquire an instance and run one task on it / 获取实例并执行一个任务
    pub async fn execute_task(&self, prompt: &str, options: TaskOptions) -> PoolResult<TaskResult> {
        let instance = self.acquire_instance(options.acquire_options()).await?;
        let _active = self.counters.track_active();

        PoolCounters::incr(&self.counters.executed);
        match instance.execute(prompt, options).await {
            Ok(result) => {
                if !result.success {
                    PoolCounters::incr(&self.counters.failed);
                }
                Ok(result)
            }
            Err(source) => {
                PoolCounters::incr(&self.counters.failed);
                instance.release_reservation();
                self.service_queue();
                Err(PoolError::ExecutionRejected {
                    instance_id: instance.id().to_string(),
                    pool_size: self.alive_count(),
                    busy: self.busy_count(),
                    source: Box::new(source),
                })
            }
        }
    }

    /// Run the task on two instances and keep the first success / 在两个实例上执行并取最先成功的结果
    ///
    /// Falls back to [`execute_task`](Self::execute_task) unless hedging is
    /// enabled, the task is marked critical and at least two instances are
    /// available. The losing leg is cancelled and finishes its own bookkeeping
    /// in the background. When both legs fail the first failure observed is
    /// returned.
    pub async fn execute_hedged(&self, prompt: &str, options: TaskOptions) -> PoolResult<TaskResult> {
        let hedging_enabled = self.config.read().hedging_enabled;
        if !hedging_enabled || !options.critical || self.available_count() < 2 {
            return self.execute_task(prompt, options).await;
        }

        let pool = self.arc()?;
        let parent = options.cancel.clone().unwrap_or_default();
        let primary_token = parent.child_token();
        let hedge_token = parent.child_token();

        let leg = |token: CancellationToken| {
            let pool = pool.clone();
            let prompt = prompt.to_string();
            let options = options.clone().with_cancel(token);
            tokio::spawn(async move { pool.execute_task(&prompt, options).await })
        };
        let mut primary = leg(primary_token.clone());
        let mut hedge = leg(hedge_token.clone());
        PoolCounters::incr(&self.counters.hedged_executions);

        let (first, first_is_primary) = tokio::select! {
            result = &mut primary => (Self::flatten_join(result), true),
            result = &mut hedge => (Self::flatten_join(result), false),
        };

        if matches!(&first, Ok(r) if r.success) {
            if first_is_primary {
                hedge_token.cancel();
            } else {
                primary_token.cancel();
                PoolCounters::incr(&self.counters.hedge_wins);
            }
            debug!(primary_won = first_is_primary, "Hedged execution settled");
            return first;
        }

        let second = if first_is_primary {
            Self::flatten_join(hedge.await)
        } else {
            Self::flatten_join(primary.await)
        };
        if matches!(&second, Ok(r) if r.success) {
            if first_is_primary {
                PoolCounters::incr(&self.counters.hedge_wins);
            }
            return second;
        }
        first
    }

    fn flatten_join(result: Result<PoolResult<TaskResult>, tokio::task::JoinError>) -> PoolResult<TaskResult> {
        result.unwrap_or_else(|e| {
            Err(PoolError::Internal {
                message: format!("hedged leg failed: {}", e),
            })
        })
    }

    /// Run independent tasks concurrently; the first error rejects the whole call
    /// 并发执行独立任务，任一错误即整体失败
    pub async fn execute_parallel(&self, tasks: Vec<ParallelTask>) -> PoolResult<Vec<TaskResult>> {
        try_join_all(
            tasks
                .into_iter()
                .map(|task| async move { self.execute_task(&task.prompt, task.options).await }),
        )
        .await
    }

    // ------------------------------------------------------------------
    // Scaling / 扩缩容
    // ------------------------------------------------------------------

    /// Add up to `count` instances (capped at `max_instances`) / 增加实例（不超过最大值）
    pub async fn scale_up(&self, count: usize) -> PoolResult<ScaleOutcome> {
        self.ensure_not_shutting_down()?;
        let Ok(_permit) = self.scaling_lock.try_acquire() else {
            info!(count, "Scaling in progress, dropping manual scale-up");
            return Ok(ScaleOutcome::Skipped);
        };
        Ok(self.do_scale_up(count, "manual scale-up").await)
    }

    /// Remove up to `count` available instances (never below `min_instances`) / 移除可用实例（不低于最小值）
    pub async fn scale_down(&self, count: usize) -> PoolResult<ScaleOutcome> {
        self.ensure_not_shutting_down()?;
        let Ok(_permit) = self.scaling_lock.try_acquire() else {
            info!(count, "Scaling in progress, dropping manual scale-down");
            return Ok(ScaleOutcome::Skipped);
        };
        Ok(self.do_scale_down(count, "manual scale-down", None))
    }

    /// Move toward `target` alive instances, clamped to `[min, max]` / 调整到目标实例数
    pub async fn scale_to(&self, target: usize) -> PoolResult<ScaleOutcome> {
        self.ensure_not_shutting_down()?;
        let Ok(_permit) = self.scaling_lock.try_acquire() else {
            info!(target, "Scaling in progress, dropping scale-to request");
            return Ok(ScaleOutcome::Skipped);
        };
        let (min, max) = {
            let config = self.config.read();
            (config.min_instances, config.max_instances)
        };
        let target = target.clamp(min, max);
        let alive = self.alive_count();
        let reason = format!("scale to {}", target);
        Ok(if target > alive {
            self.do_scale_up(target - alive, &reason).await
        } else {
            self.do_scale_down(alive - target, &reason, None)
        })
    }

    fn ensure_not_shutting_down(&self) -> PoolResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            Err(PoolError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Caller holds the scaling lock (or is a replacement spawn) / 调用方持有扩缩容锁（或为替换启动）
    async fn do_scale_up(&self, count: usize, reason: &str) -> ScaleOutcome {
        let max_instances = self.config.read().max_instances;
        let before = self.alive_count();
        let to_create = count.min(max_instances.saturating_sub(before));
        if to_create == 0 || self.shutting_down.load(Ordering::SeqCst) {
            return ScaleOutcome::Applied {
                before,
                after: before,
            };
        }

        let created: Vec<Arc<Instance>> = (0..to_create).map(|_| self.create_instance()).collect();
        let results = join_all(created.into_iter().map(|i| self.finish_new_instance(i))).await;
        let spawned = results.iter().filter(|r| r.is_ok()).count();

        let after = self.alive_count();
        if spawned > 0 {
            self.record_scaling(ScalingAction::ScaleUp, reason, before, after);
        } else {
            warn!(reason, requested = to_create, "Scale-up spawned no instances");
        }
        ScaleOutcome::Applied { before, after }
    }

    fn do_scale_down(&self, count: usize, reason: &str, min_idle: Option<Duration>) -> ScaleOutcome {
        let min_instances = self.config.read().min_instances;
        let before = self.alive_count();
        let removable = before.saturating_sub(min_instances).min(count);
        if removable == 0 {
            return ScaleOutcome::Applied {
                before,
                after: before,
            };
        }

        let mut candidates: Vec<(Arc<Instance>, Duration)> = self
            .available_instances()
            .into_iter()
            .map(|instance| {
                let idle = instance.idle_for();
                (instance, idle)
            })
            .filter(|(_, idle)| min_idle.map(|threshold| *idle >= threshold).unwrap_or(true))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        let mut removed = 0usize;
        for (instance, idle) in candidates {
            if removed == removable {
                break;
            }
            if !instance.try_reserve() {
                continue;
            }
            self.retire(instance.id());
            instance.terminate(reason);
            debug!(instance_id = instance.id(), idle_ms = idle.as_millis() as u64, "Instance scaled down");
            removed += 1;
        }

        let after = self.alive_count();
        if removed > 0 {
            self.record_scaling(ScalingAction::ScaleDown, reason, before, after);
        }
        ScaleOutcome::Applied { before, after }
    }

    fn record_scaling(&self, action: ScalingAction, reason: &str, before: usize, after: usize) {
        let decision = ScalingDecision {
            action,
            reason: reason.to_string(),
            before_count: before,
            after_count: after,
            queue_length: self.queue_len(),
            busy_count: self.busy_count(),
            timestamp: Utc::now(),
        };
        match action {
            ScalingAction::ScaleUp => PoolCounters::incr(&self.counters.scale_up_events),
            ScalingAction::ScaleDown => PoolCounters::incr(&self.counters.scale_down_events),
        }
        info!(
            action = ?action,
            reason,
            before,
            after,
            queue_length = decision.queue_length,
            busy = decision.busy_count,
            "Scaling decision"
        );
        self.history.lock().record(decision.clone());
        self.events.publish(PoolEvent::Scaling(decision));
    }

    /// Create, bind and index a cold instance / 创建、绑定并登记一个冷实例
    fn create_instance(&self) -> Arc<Instance> {
        let settings = InstanceSettings::from(&*self.config.read());
        let instance = Instance::new(settings);
        instance.bind_backend(self.backend.clone());
        instance.set_model_resolver(self.resolver.read().clone());
        instance.set_error_diagnoser(self.diagnoser.read().clone());
        instance.attach_observer(self.event_tx.clone());

        let id = instance.id().to_string();
        self.recovering.lock().insert(id.clone());
        self.instances.insert(id.clone(), instance.clone());
        debug!(instance_id = %id, "Instance created");
        instance
    }

    async fn finish_new_instance(&self, instance: Arc<Instance>) -> PoolResult<Arc<Instance>> {
        let id = instance.id().to_string();
        let outcome = match self.spawn_with_retry(&instance).await {
            Ok(()) if self.shutting_down.load(Ordering::SeqCst) => {
                self.retire(&id);
                instance.terminate("pool shutting down");
                Err(PoolError::ShuttingDown)
            }
            Ok(()) => Ok(instance),
            Err(e) => {
                warn!(instance_id = %id, error = %e, "Giving up on instance");
                self.retire(&id);
                instance.terminate("spawn retries exhausted");
                Err(e)
            }
        };
        self.recovering.lock().remove(&id);
        outcome
    }

    /// Spawn with exponential backoff / 指数退避重试启动
    async fn spawn_with_retry(&self, instance: &Arc<Instance>) -> PoolResult<()> {
        let (policy, spawn_timeout) = {
            let config = self.config.read();
            (config.spawn_retry.clone(), config.spawn_timeout())
        };
        let attempts = policy.max_attempts();
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(PoolError::ShuttingDown);
            }
            match tokio::time::timeout(spawn_timeout, instance.spawn()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("spawn timed out after {}ms", spawn_timeout.as_millis());
                    instance.fail_spawn(&last_error);
                }
            }
            debug!(instance_id = instance.id(), attempt = attempt + 1, error = %last_error, "Spawn attempt failed");

            if instance.lifecycle() == LifecycleState::Terminated {
                return Err(PoolError::SpawnFailed {
                    instance_id: instance.id().to_string(),
                    attempts: attempt + 1,
                    message: last_error,
                });
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
        }

        Err(PoolError::SpawnFailed {
            instance_id: instance.id().to_string(),
            attempts,
            message: last_error,
        })
    }

    /// Remove from the index, keeping its cost ledger / 从索引移除并保留其成本账目
    fn retire(&self, instance_id: &str) -> Option<Arc<Instance>> {
        let (_, instance) = self.instances.remove(instance_id)?;
        merge_ledgers(&mut self.retired_costs.lock(), &instance.cost_ledger());
        Some(instance)
    }

    /// Respawn a crashed instance in place / 原地重启崩溃的实例
    fn recover_crashed(&self, instance_id: &str) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let Some(instance) = self.get_instance(instance_id) else {
            return;
        };
        if !self.recovering.lock().insert(instance_id.to_string()) {
            return;
        }
        let Ok(pool) = self.arc() else {
            self.recovering.lock().remove(instance_id);
            return;
        };

        tokio::spawn(async move {
            let id = instance.id().to_string();
            match pool.spawn_with_retry(&instance).await {
                Ok(()) => info!(instance_id = %id, "Crashed instance respawned"),
                Err(e) => {
                    warn!(instance_id = %id, error = %e, "Crashed instance could not be respawned");
                    pool.retire(&id);
                    instance.terminate("respawn retries exhausted");
                    pool.recovering.lock().remove(&id);
                    pool.ensure_min_instances("replacement for unrecoverable instance");
                    return;
                }
            }
            pool.recovering.lock().remove(&id);
        });
    }

    fn handle_terminated(&self, instance_id: &str) {
        if self.retire(instance_id).is_none() {
            return;
        }
        if self.recovering.lock().contains(instance_id) {
            return;
        }
        self.ensure_min_instances("replacement for terminated instance");
    }

    /// Spawn replacements when the alive count fell below `min_instances`
    /// 存活实例数低于最小值时启动替换实例
    fn ensure_min_instances(&self, reason: &str) {
        if self.shutting_down.load(Ordering::SeqCst) || self.draining.load(Ordering::SeqCst) {
            return;
        }
        let min_instances = self.config.read().min_instances;
        if self.alive_count() >= min_instances {
            return;
        }
        let Ok(pool) = self.arc() else {
            return;
        };
        let reason = reason.to_string();
        tokio::spawn(async move {
            let Ok(_permit) = pool.scaling_lock.acquire().await else {
                return;
            };
            if pool.shutting_down.load(Ordering::SeqCst) || pool.draining.load(Ordering::SeqCst) {
                return;
            }
            // recount under the permit, another scaler may have filled the gap
            let deficit = pool.config.read().min_instances.saturating_sub(pool.alive_count());
            if deficit > 0 {
                pool.do_scale_up(deficit, &reason).await;
            }
        });
    }

    // ------------------------------------------------------------------
    // Events and background loops / 事件与后台循环
    // ------------------------------------------------------------------

    async fn run_event_dispatcher(
        this: Weak<Self>,
        shutdown: CancellationToken,
        mut rx: mpsc::UnboundedReceiver<PoolEvent>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    if let Some(pool) = this.upgrade() {
                        while let Ok(event) = rx.try_recv() {
                            pool.events.publish(event);
                        }
                    }
                    break;
                }
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let Some(pool) = this.upgrade() else { break };
                    pool.handle_event(event);
                }
            }
        }
        debug!("Event dispatcher stopped");
    }

    fn handle_event(&self, event: PoolEvent) {
        match &event {
            PoolEvent::InstanceStateChanged {
                to: LifecycleState::Ready,
                ..
            } => self.service_queue(),
            PoolEvent::CircuitStateChanged { to, .. } if *to != CircuitState::Open => self.service_queue(),
            PoolEvent::InstanceCrashed { instance_id, .. } => self.recover_crashed(instance_id),
            PoolEvent::InstanceTerminated { instance_id, .. } => self.handle_terminated(instance_id),
            PoolEvent::ZombieDetected { .. } => PoolCounters::incr(&self.counters.zombies_detected),
            _ => {}
        }
        self.events.publish(event);
    }

    async fn run_scale_up_loop(this: Weak<Self>, shutdown: CancellationToken) {
        loop {
            let Some(period) = this.upgrade().map(|pool| pool.config.read().scale_up_check_interval()) else {
                break;
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
            let Some(pool) = this.upgrade() else {
                break;
            };
            pool.check_scale_up().await;
        }
        debug!("Scale-up loop stopped");
    }

    async fn check_scale_up(&self) {
        if self.shutting_down.load(Ordering::SeqCst) || self.draining.load(Ordering::SeqCst) {
            return;
        }
        let config = self.config.read().clone();
        let queue_length = self.queue_len();
        let avg_queue_length = {
            let mut samples = self.queue_samples.lock();
            samples.push(queue_length as f64);
            samples.average()
        };

        if self.alive_count() < config.min_instances {
            if let Ok(_permit) = self.scaling_lock.try_acquire() {
                let deficit = config.min_instances.saturating_sub(self.alive_count());
                if deficit > 0 {
                    self.do_scale_up(deficit, "below minimum instances").await;
                }
            }
            return;
        }
        let alive = self.alive_count();

        let inputs = ScaleUpInputs {
            alive,
            available: self.available_count(),
            busy: self.busy_count(),
            queue_length,
            max_instances: config.max_instances,
            threshold: config.scale_up_threshold,
            avg_queue_length,
        };
        if let Some(trigger) = evaluate_scale_up(&inputs, &config.adaptive) {
            match self.scaling_lock.try_acquire() {
                Ok(_permit) => {
                    self.do_scale_up(1, &trigger.reason()).await;
                }
                Err(_) => debug!("Scaling in progress, skipping automatic scale-up"),
            }
        }
    }

    async fn run_scale_down_loop(this: Weak<Self>, shutdown: CancellationToken) {
        loop {
            let Some(period) = this.upgrade().map(|pool| pool.config.read().scale_down_check_interval()) else {
                break;
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
            let Some(pool) = this.upgrade() else {
                break;
            };
            pool.check_scale_down();
        }
        debug!("Scale-down loop stopped");
    }

    fn check_scale_down(&self) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if self.queue_len() > 0 {
            debug!("Queue not empty, skipping scale-down");
            return;
        }
        let Ok(_permit) = self.scaling_lock.try_acquire() else {
            debug!("Scaling in progress, skipping automatic scale-down");
            return;
        };

        let (max_instances, idle_timeout) = {
            let config = self.config.read();
            (config.max_instances, config.idle_timeout())
        };
        let alive = self.alive_count();
        if alive > max_instances {
            self.do_scale_down(alive - max_instances, "above maximum instances", None);
        }
        self.do_scale_down(usize::MAX, "idle timeout", Some(idle_timeout));
    }

    async fn run_health_check_loop(this: Weak<Self>, shutdown: CancellationToken) {
        loop {
            let Some(period) = this.upgrade().map(|pool| pool.config.read().health_check_interval()) else {
                break;
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
            let Some(pool) = this.upgrade() else {
                break;
            };
            pool.run_health_checks();
        }
        debug!("Health check loop stopped");
    }

    fn run_health_checks(&self) {
        for instance in self.sorted_instances() {
            match instance.lifecycle() {
                LifecycleState::Cold | LifecycleState::Spawning => continue,
                LifecycleState::Crashed => {
                    self.recover_crashed(instance.id());
                    continue;
                }
                LifecycleState::Terminated => {
                    self.handle_terminated(instance.id());
                    continue;
                }
                LifecycleState::Ready | LifecycleState::Busy => {}
            }
            match instance.health_check() {
                Ok(latency) => debug!(
                    instance_id = instance.id(),
                    latency_us = latency.as_micros() as u64,
                    "Health check passed"
                ),
                Err(e) if instance.circuit_state() == CircuitState::Open => {
                    debug!(instance_id = instance.id(), error = %e, "Health check skipped, circuit open")
                }
                Err(e) => warn!(instance_id = instance.id(), error = %e, "Health check failed"),
            }
        }
    }

    async fn run_zombie_check_loop(this: Weak<Self>, shutdown: CancellationToken) {
        loop {
            let Some(period) = this.upgrade().map(|pool| pool.config.read().zombie_check_interval()) else {
                break;
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
            let Some(pool) = this.upgrade() else {
                break;
            };
            pool.check_zombies();
        }
        debug!("Zombie check loop stopped");
    }

    fn check_zombies(&self) {
        let reaped = self
            .sorted_instances()
            .into_iter()
            .filter(|instance| instance.check_zombie())
            .count();
        if reaped > 0 {
            warn!(reaped, "Zombie sweep reaped overdue tasks");
        }
    }

    // ------------------------------------------------------------------
    // Queries / 查询
    // ------------------------------------------------------------------

    /// Instances in creation order / 按创建顺序排列的实例
    pub fn instances(&self) -> Vec<Arc<Instance>> {
        self.sorted_instances()
    }

    fn sorted_instances(&self) -> Vec<Arc<Instance>> {
        let mut instances: Vec<Arc<Instance>> = self.instances.iter().map(|e| e.value().clone()).collect();
        instances.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        instances
    }

    fn available_instances(&self) -> Vec<Arc<Instance>> {
        self.sorted_instances()
            .into_iter()
            .filter(|instance| instance.is_available())
            .collect()
    }

    pub fn get_instance(&self, instance_id: &str) -> Option<Arc<Instance>> {
        self.instances.get(instance_id).map(|e| e.value().clone())
    }

    pub fn alive_count(&self) -> usize {
        self.instances.iter().filter(|e| e.value().is_alive()).count()
    }

    pub fn busy_count(&self) -> usize {
        self.instances.iter().filter(|e| e.value().is_busy()).count()
    }

    pub fn available_count(&self) -> usize {
        self.instances.iter().filter(|e| e.value().is_available()).count()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    fn record_wait(&self, waited: Duration) {
        self.wait_samples.lock().push(waited.as_secs_f64() * 1000.0);
    }

    pub fn config(&self) -> PoolConfig {
        self.config.read().clone()
    }

    pub fn scaling_history(&self) -> Vec<ScalingDecision> {
        self.history.lock().to_vec()
    }

    /// Subscribe to pool events / 订阅池事件
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn event_stream(&self) -> BroadcastStream<PoolEvent> {
        self.events.stream()
    }

    pub fn get_status(&self) -> PoolStatus {
        let (strategy, min_instances, max_instances) = {
            let config = self.config.read();
            (config.strategy, config.min_instances, config.max_instances)
        };
        let snapshots: Vec<InstanceSnapshot> = self.sorted_instances().iter().map(|i| i.snapshot()).collect();

        PoolStatus {
            initialized: self.is_initialized(),
            draining: self.is_draining(),
            shutting_down: self.is_shutting_down(),
            strategy,
            min_instances,
            max_instances,
            total_instances: snapshots.len(),
            alive: snapshots.iter().filter(|s| s.lifecycle.is_alive()).count(),
            available: snapshots.iter().filter(|s| s.available).count(),
            busy: snapshots
                .iter()
                .filter(|s| s.lifecycle == LifecycleState::Busy)
                .count(),
            crashed: snapshots
                .iter()
                .filter(|s| s.lifecycle == LifecycleState::Crashed)
                .count(),
            queue_length: self.queue_len(),
            instances: snapshots,
        }
    }

    pub fn get_stats(&self) -> PoolStats {
        let mut agent_costs = self.retired_costs.lock().clone();
        for instance in self.sorted_instances() {
            merge_ledgers(&mut agent_costs, &instance.cost_ledger());
        }
        let total_cost_usd = agent_costs.values().map(|c| c.total_cost_usd).sum();

        let (avg_wait_ms, max_wait_ms) = {
            let samples = self.wait_samples.lock();
            (samples.average(), samples.max().unwrap_or(0.0))
        };
        let avg_queue_length = self.queue_samples.lock().average();
        let c = &self.counters;

        PoolStats {
            total_executed: PoolCounters::load(&c.executed),
            total_failed: PoolCounters::load(&c.failed),
            success_rate: c.success_rate(),
            current_concurrent: c.active(),
            peak_concurrent: c.peak_active(),
            avg_wait_ms,
            max_wait_ms,
            avg_queue_length,
            rate_limited: PoolCounters::load(&c.rate_limited),
            queue_overflows: PoolCounters::load(&c.queue_overflows),
            acquire_timeouts: PoolCounters::load(&c.acquire_timeouts),
            hedged_executions: PoolCounters::load(&c.hedged_executions),
            hedge_wins: PoolCounters::load(&c.hedge_wins),
            zombies_detected: PoolCounters::load(&c.zombies_detected),
            scale_up_events: PoolCounters::load(&c.scale_up_events),
            scale_down_events: PoolCounters::load(&c.scale_down_events),
            total_cost_usd,
            agent_costs,
            scheduling: self.balancer.get_metrics(),
        }
    }

    /// `{status, stats, config, scaling_history}` / 完整状态 JSON
    pub fn get_full_status_json(&self) -> PoolResult<serde_json::Value> {
        Ok(serde_json::json!({
            "status": serde_json::to_value(self.get_status())?,
            "stats": serde_json::to_value(self.get_stats())?,
            "config": serde_json::to_value(self.config())?,
            "scaling_history": serde_json::to_value(self.scaling_history())?,
        }))
    }

    // ------------------------------------------------------------------
    // Configuration / 配置
    // ------------------------------------------------------------------

    /// Swap the configuration at runtime and rescale into `[min, max]`
    /// 运行时替换配置，并将实例数调整到 `[min, max]` 范围内
    pub async fn update_config(&self, new_config: PoolConfig) -> PoolResult<()> {
        new_config
            .validate()
            .map_err(|message| PoolError::InvalidConfiguration { message })?;

        let previous = std::mem::replace(&mut *self.config.write(), new_config.clone());

        if previous.rate_limit != new_config.rate_limit {
            *self.rate_limiter.write() = Self::build_rate_limiter(&new_config.rate_limit);
        }
        if previous.model_aliases != new_config.model_aliases {
            self.set_model_resolver(Arc::new(StaticModelResolver::new(new_config.model_aliases.clone())));
        }
        if previous.wait_sample_capacity != new_config.wait_sample_capacity {
            *self.wait_samples.lock() = RingBuffer::new(new_config.wait_sample_capacity);
        }
        if previous.adaptive.sample_capacity != new_config.adaptive.sample_capacity {
            *self.queue_samples.lock() = RingBuffer::new(new_config.adaptive.sample_capacity);
        }

        let settings = InstanceSettings::from(&new_config);
        for instance in self.sorted_instances() {
            instance.apply_settings(settings.clone());
        }

        info!(
            min_instances = new_config.min_instances,
            max_instances = new_config.max_instances,
            strategy = ?new_config.strategy,
            "Pool configuration updated"
        );
        self.events.publish(PoolEvent::ConfigUpdated {
            min_instances: new_config.min_instances,
            max_instances: new_config.max_instances,
            strategy: new_config.strategy,
        });

        if self.is_initialized() && !self.is_shutting_down() {
            let alive = self.alive_count();
            if alive < new_config.min_instances || alive > new_config.max_instances {
                match self.scaling_lock.try_acquire() {
                    Ok(_permit) => {
                        if alive < new_config.min_instances {
                            self.do_scale_up(new_config.min_instances - alive, "config update: below minimum")
                                .await;
                        } else {
                            self.do_scale_down(
                                alive - new_config.max_instances,
                                "config update: above maximum",
                                None,
                            );
                        }
                    }
                    Err(_) => debug!("Scaling in progress, bounds will be enforced by the control loops"),
                }
            }
        }
        self.service_queue();
        Ok(())
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for entry in self.instances.iter() {
            entry.value().terminate("pool dropped");
        }
    }
}
