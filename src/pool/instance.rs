//! Pool Instance Implementation
//! 池实例实现
//!
//! An [`Instance`] is one execution slot. It runs at most one task at a time
//! and owns:
//! - a strict lifecycle state machine (`cold → spawning → ready ⇄ busy`,
//!   `crashed → spawning | terminated`)
//! - a circuit breaker with a cooldown timer
//! - a zombie watchdog armed for the duration of each task
//! - a per-agent cost ledger
//!
//! 实例是一个执行槽，同一时间最多运行一个任务，拥有生命周期状态机、熔断器、
//! 僵尸任务看门狗以及按代理统计的成本账目。
//!
//! State lives behind a single `parking_lot::Mutex` that is never held across
//! an `.await`. Events are collected under the lock and sent to the owning
//! pool after it is released.

use super::backend::{
    BackendError, BackendRequest, ErrorDiagnoser, ExecutionBackend, ModelResolver, PatternDiagnoser,
    RawResult, StaticModelResolver,
};
use super::circuit::{CircuitBreaker, CircuitTransition};
use super::config::PoolConfig;
use super::events::{EventSink, PoolEvent};
use super::stats::{AgentCost, CurrentTaskSnapshot, InstanceSnapshot};
use super::types::{
    CircuitState, FailureKind, InstanceId, LifecycleState, TaskOptions, TaskResult,
};
use super::{PoolError, PoolResult};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Ledger key for tasks without an agent tag / 无代理标签任务的账目键
pub const UNASSIGNED_AGENT: &str = "unassigned";

const PROMPT_PREVIEW_CHARS: usize = 100;

/// Per-instance parameters derived from the pool configuration / 由池配置派生的实例参数
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSettings {
    pub task_timeout: Duration,
    pub zombie_timeout: Duration,
    pub max_consecutive_failures: u32,
    pub circuit_cooldown: Duration,
    pub default_model: String,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

impl From<&PoolConfig> for InstanceSettings {
    fn from(config: &PoolConfig) -> Self {
        Self {
            task_timeout: config.task_timeout(),
            zombie_timeout: config.zombie_timeout(),
            max_consecutive_failures: config.circuit.max_consecutive_failures,
            circuit_cooldown: config.circuit_cooldown(),
            default_model: config.default_model.clone(),
        }
    }
}

struct ActiveTask {
    correlation_id: String,
    agent: Option<String>,
    prompt_preview: String,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
    cancel: CancellationToken,
    watchdog: Option<JoinHandle<()>>,
}

impl ActiveTask {
    fn stop(self) {
        if let Some(watchdog) = self.watchdog {
            watchdog.abort();
        }
    }
}

struct InstanceState {
    lifecycle: LifecycleState,
    circuit: CircuitBreaker,
    settings: InstanceSettings,
    reserved: bool,
    task_count: u64,
    failed_count: u64,
    total_busy: Duration,
    created: Instant,
    last_used: Option<Instant>,
    last_used_at: Option<DateTime<Utc>>,
    last_health_check_at: Option<DateTime<Utc>>,
    current_task: Option<ActiveTask>,
    costs: HashMap<String, AgentCost>,
    cooldown_timer: Option<JoinHandle<()>>,
}

impl InstanceState {
    fn owns(&self, correlation_id: &str) -> bool {
        self.current_task
            .as_ref()
            .map(|t| t.correlation_id == correlation_id)
            .unwrap_or(false)
    }

    fn touch(&mut self) {
        self.last_used = Some(Instant::now());
        self.last_used_at = Some(Utc::now());
    }
}

enum Outcome {
    Backend(Result<RawResult, BackendError>),
    TimedOut(Duration),
    Cancelled,
}

struct Classified {
    success: bool,
    content: Option<String>,
    error: Option<String>,
    stderr: Option<String>,
    failure: Option<FailureKind>,
    cost_usd: Option<f64>,
}

impl Classified {
    fn failed(failure: FailureKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: None,
            error: Some(error.into()),
            stderr: None,
            failure: Some(failure),
            cost_usd: None,
        }
    }

    fn from_outcome(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Backend(Ok(RawResult::Completed { result_message, .. })) => {
                if result_message.is_error() {
                    let error = result_message
                        .result
                        .clone()
                        .or_else(|| result_message.subtype.clone())
                        .unwrap_or_else(|| "backend reported an error".to_string());
                    Self {
                        cost_usd: result_message.cost_usd,
                        ..Self::failed(FailureKind::BusinessError, error)
                    }
                } else {
                    Self {
                        success: true,
                        content: Some(result_message.result.unwrap_or_default()),
                        error: None,
                        stderr: None,
                        failure: None,
                        cost_usd: result_message.cost_usd,
                    }
                }
            }
            Outcome::Backend(Ok(RawResult::Error {
                message,
                stderr_output,
            })) => Self {
                stderr: stderr_output,
                ..Self::failed(FailureKind::BusinessError, message)
            },
            Outcome::Backend(Err(e)) => Self {
                stderr: e.stderr,
                ..Self::failed(FailureKind::Backend, e.message)
            },
            Outcome::TimedOut(after) => Self::failed(
                FailureKind::Timeout,
                format!("task timed out after {}ms", after.as_millis()),
            ),
            Outcome::Cancelled => Self::failed(FailureKind::Cancelled, "task cancelled"),
        }
    }
}

/// Returns the instance to `ready` when an in-flight `execute` future is dropped
/// 执行中的 future 被丢弃时将实例恢复为就绪
struct InFlightGuard<'a> {
    instance: &'a Instance,
    correlation_id: &'a str,
    cancel: CancellationToken,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cancel.cancel();
            self.instance.abandon_task(self.correlation_id);
        }
    }
}

/// One pool slot / 一个池槽位
pub struct Instance {
    id: InstanceId,
    created_at: DateTime<Utc>,
    state: Mutex<InstanceState>,
    backend: RwLock<Option<Arc<dyn ExecutionBackend>>>,
    resolver: RwLock<Arc<dyn ModelResolver>>,
    diagnoser: RwLock<Arc<dyn ErrorDiagnoser>>,
    observer: RwLock<Option<EventSink>>,
    this: Weak<Instance>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("lifecycle", &state.lifecycle)
            .field("circuit", &state.circuit.state())
            .field("task_count", &state.task_count)
            .finish()
    }
}

impl Instance {
    /// Create a cold instance / 创建冷实例
    pub fn new(settings: InstanceSettings) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: format!("inst-{}", Uuid::new_v4()),
            created_at: Utc::now(),
            state: Mutex::new(InstanceState {
                lifecycle: LifecycleState::Cold,
                circuit: CircuitBreaker::new(settings.max_consecutive_failures, settings.circuit_cooldown),
                settings,
                reserved: false,
                task_count: 0,
                failed_count: 0,
                total_busy: Duration::ZERO,
                created: Instant::now(),
                last_used: None,
                last_used_at: None,
                last_health_check_at: None,
                current_task: None,
                costs: HashMap::new(),
                cooldown_timer: None,
            }),
            backend: RwLock::new(None),
            resolver: RwLock::new(Arc::new(StaticModelResolver::default())),
            diagnoser: RwLock::new(Arc::new(PatternDiagnoser)),
            observer: RwLock::new(None),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Wire the backend; must happen before `spawn` / 绑定后端，必须在启动前完成
    pub fn bind_backend(&self, backend: Arc<dyn ExecutionBackend>) {
        *self.backend.write() = Some(backend);
    }

    pub fn set_model_resolver(&self, resolver: Arc<dyn ModelResolver>) {
        *self.resolver.write() = resolver;
    }

    pub fn set_error_diagnoser(&self, diagnoser: Arc<dyn ErrorDiagnoser>) {
        *self.diagnoser.write() = diagnoser;
    }

    /// Route events to the owning pool / 将事件发送给所属池
    pub fn attach_observer(&self, sink: EventSink) {
        *self.observer.write() = Some(sink);
    }

    /// Push new timeouts and circuit parameters / 推送新的超时与熔断参数
    pub fn apply_settings(&self, settings: InstanceSettings) {
        let mut state = self.state.lock();
        state
            .circuit
            .reconfigure(settings.max_consecutive_failures, settings.circuit_cooldown);
        state.settings = settings;
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.state.lock().lifecycle
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.state.lock().circuit.state()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().circuit.consecutive_failures()
    }

    pub fn is_alive(&self) -> bool {
        self.lifecycle().is_alive()
    }

    pub fn is_busy(&self) -> bool {
        self.lifecycle() == LifecycleState::Busy
    }

    /// `ready`, circuit not `open`, and not reserved by an acquirer
    /// 就绪、熔断未打开且未被预留
    pub fn is_available(&self) -> bool {
        let state = self.state.lock();
        Self::available_locked(&state)
    }

    fn available_locked(state: &InstanceState) -> bool {
        state.lifecycle == LifecycleState::Ready && !state.circuit.is_open() && !state.reserved
    }

    pub fn is_reserved(&self) -> bool {
        self.state.lock().reserved
    }

    /// Claim an available instance for one acquirer / 为一个获取者预留可用实例
    pub fn try_reserve(&self) -> bool {
        let mut state = self.state.lock();
        if Self::available_locked(&state) {
            state.reserved = true;
            true
        } else {
            false
        }
    }

    /// Drop a reservation without executing; returns whether one was held
    /// 释放预留，返回之前是否持有预留
    pub fn release_reservation(&self) -> bool {
        let mut state = self.state.lock();
        std::mem::replace(&mut state.reserved, false)
    }

    pub fn task_count(&self) -> u64 {
        self.state.lock().task_count
    }

    pub fn failed_count(&self) -> u64 {
        self.state.lock().failed_count
    }

    /// Mean task duration in milliseconds / 平均任务耗时（毫秒）
    pub fn avg_duration_ms(&self) -> f64 {
        let state = self.state.lock();
        Self::avg_duration_locked(&state)
    }

    fn avg_duration_locked(state: &InstanceState) -> f64 {
        if state.task_count == 0 {
            0.0
        } else {
            state.total_busy.as_secs_f64() * 1000.0 / state.task_count as f64
        }
    }

    /// Time since the last task ended (or since creation) / 距上次任务结束（或创建）的时间
    pub fn idle_for(&self) -> Duration {
        let state = self.state.lock();
        state.last_used.unwrap_or(state.created).elapsed()
    }

    pub fn current_correlation_id(&self) -> Option<String> {
        self.state
            .lock()
            .current_task
            .as_ref()
            .map(|t| t.correlation_id.clone())
    }

    pub fn cost_ledger(&self) -> HashMap<String, AgentCost> {
        self.state.lock().costs.clone()
    }

    /// Request a lifecycle transition; illegal requests are logged and ignored
    /// 请求生命周期转换；非法请求会被记录并忽略
    pub fn transition(&self, to: LifecycleState) -> bool {
        let mut events = Vec::new();
        let applied = {
            let mut state = self.state.lock();
            self.transition_locked(&mut state, to, &mut events)
        };
        self.emit_all(events);
        applied
    }

    fn transition_locked(&self, state: &mut InstanceState, to: LifecycleState, events: &mut Vec<PoolEvent>) -> bool {
        let from = state.lifecycle;
        if !from.can_transition_to(to) {
            warn!(
                instance_id = %self.id,
                from = %from,
                to = %to,
                "Ignoring illegal lifecycle transition"
            );
            return false;
        }
        state.lifecycle = to;
        debug!(instance_id = %self.id, from = %from, to = %to, "Lifecycle transition");
        events.push(PoolEvent::InstanceStateChanged {
            instance_id: self.id.clone(),
            from,
            to,
        });
        true
    }

    /// Record a circuit transition; arms the cooldown when the circuit opened
    /// 记录熔断状态变化，打开时启动冷却计时器
    fn circuit_changed(&self, state: &mut InstanceState, transition: Option<CircuitTransition>, events: &mut Vec<PoolEvent>) {
        let Some(transition) = transition else {
            return;
        };
        info!(
            instance_id = %self.id,
            from = %transition.from,
            to = %transition.to,
            consecutive_failures = state.circuit.consecutive_failures(),
            "Circuit state changed"
        );
        events.push(PoolEvent::CircuitStateChanged {
            instance_id: self.id.clone(),
            from: transition.from,
            to: transition.to,
        });
        if transition.opened() {
            self.arm_cooldown(state);
        } else if let Some(timer) = state.cooldown_timer.take() {
            timer.abort();
        }
    }

    fn arm_cooldown(&self, state: &mut InstanceState) {
        let cooldown = state.circuit.cooldown();
        let this = self.this.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            if let Some(instance) = this.upgrade() {
                instance.on_cooldown_elapsed();
            }
        });
        if let Some(previous) = state.cooldown_timer.replace(timer) {
            previous.abort();
        }
    }

    fn on_cooldown_elapsed(&self) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            state.cooldown_timer = None;
            if !state.lifecycle.is_alive() {
                return;
            }
            let transition = state.circuit.cooldown_elapsed();
            self.circuit_changed(&mut state, transition, &mut events);
        }
        self.emit_all(events);
    }

    fn emit_all(&self, events: Vec<PoolEvent>) {
        let observer = self.observer.read();
        if let Some(sink) = observer.as_ref() {
            for event in events {
                if sink.send(event).is_err() {
                    debug!(instance_id = %self.id, "Pool event channel closed");
                    break;
                }
            }
        }
    }

    /// Bring the instance up from `cold` or `crashed` / 从冷启动或崩溃状态启动实例
    ///
    /// Runs the backend readiness probe, then moves to `ready` with a closed
    /// circuit. A failure records a circuit failure and moves to `crashed`;
    /// if that opens the circuit the instance is terminated.
    pub async fn spawn(&self) -> PoolResult<()> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if !matches!(state.lifecycle, LifecycleState::Cold | LifecycleState::Crashed) {
                return Err(PoolError::InvalidState {
                    instance_id: self.id.clone(),
                    state: state.lifecycle,
                    operation: "spawn".to_string(),
                });
            }
            self.transition_locked(&mut state, LifecycleState::Spawning, &mut events);
        }
        self.emit_all(events);

        let backend = self.backend.read().clone();
        let probe = match backend {
            None => Err(PoolError::BackendNotBound {
                instance_id: self.id.clone(),
            }),
            Some(backend) => backend.probe().await.map_err(|e| PoolError::ProbeFailed {
                instance_id: self.id.clone(),
                message: e.message,
            }),
        };

        match probe {
            Ok(()) => self.complete_spawn(),
            Err(err) => {
                self.fail_spawn(&err.to_string());
                Err(err)
            }
        }
    }

    fn complete_spawn(&self) -> PoolResult<()> {
        let mut events = Vec::new();
        let result = {
            let mut state = self.state.lock();
            if state.lifecycle != LifecycleState::Spawning {
                Err(PoolError::InvalidState {
                    instance_id: self.id.clone(),
                    state: state.lifecycle,
                    operation: "complete spawn".to_string(),
                })
            } else {
                self.transition_locked(&mut state, LifecycleState::Ready, &mut events);
                let transition = state.circuit.reset();
                self.circuit_changed(&mut state, transition, &mut events);
                if let Some(timer) = state.cooldown_timer.take() {
                    timer.abort();
                }
                state.touch();
                Ok(())
            }
        };
        self.emit_all(events);
        if result.is_ok() {
            info!(instance_id = %self.id, "Instance ready");
        }
        result
    }

    /// Abort an in-progress spawn: `spawning → crashed`, terminated if the circuit opens
    /// 中止启动：进入崩溃状态，若熔断打开则终止
    pub fn fail_spawn(&self, reason: &str) {
        let mut events = Vec::new();
        let opened = {
            let mut state = self.state.lock();
            if state.lifecycle != LifecycleState::Spawning {
                return;
            }
            let transition = state.circuit.record_failure();
            let opened = transition.map(|t| t.opened()).unwrap_or(false);
            self.circuit_changed(&mut state, transition, &mut events);
            self.transition_locked(&mut state, LifecycleState::Crashed, &mut events);
            events.push(PoolEvent::InstanceCrashed {
                instance_id: self.id.clone(),
                reason: reason.to_string(),
            });
            opened
        };
        warn!(instance_id = %self.id, reason, "Instance spawn failed");
        self.emit_all(events);

        if opened {
            self.terminate("circuit opened during spawn");
        }
    }

    /// Run one prompt / 执行一个提示词
    ///
    /// Races the backend call against the task timeout and cancellation.
    /// Failures are reported in the returned [`TaskResult`]; `Err` means the
    /// task never started (circuit open, wrong state, no backend).
    pub async fn execute(&self, prompt: &str, options: TaskOptions) -> PoolResult<TaskResult> {
        let correlation_id = Uuid::new_v4().to_string();
        let cancel = options
            .cancel
            .as_ref()
            .map(|external| external.child_token())
            .unwrap_or_default();

        let mut events = Vec::new();
        let (backend, timeout, model) = {
            let mut state = self.state.lock();
            if state.circuit.is_open() {
                return Err(PoolError::CircuitOpen {
                    instance_id: self.id.clone(),
                });
            }
            if state.lifecycle != LifecycleState::Ready {
                return Err(PoolError::InvalidState {
                    instance_id: self.id.clone(),
                    state: state.lifecycle,
                    operation: "execute".to_string(),
                });
            }
            let Some(backend) = self.backend.read().clone() else {
                return Err(PoolError::BackendNotBound {
                    instance_id: self.id.clone(),
                });
            };

            let logical = options
                .model
                .clone()
                .unwrap_or_else(|| state.settings.default_model.clone());
            let model = self.resolver.read().resolve(&logical);
            let timeout = options.timeout.unwrap_or(state.settings.task_timeout);

            state.reserved = false;
            self.transition_locked(&mut state, LifecycleState::Busy, &mut events);
            let watchdog = self.arm_watchdog(correlation_id.clone(), state.settings.zombie_timeout);
            state.current_task = Some(ActiveTask {
                correlation_id: correlation_id.clone(),
                agent: options.agent.clone(),
                prompt_preview: prompt.chars().take(PROMPT_PREVIEW_CHARS).collect(),
                started_at: Instant::now(),
                started_at_utc: Utc::now(),
                cancel: cancel.clone(),
                watchdog: Some(watchdog),
            });
            (backend, timeout, model)
        };
        self.emit_all(events);

        debug!(
            instance_id = %self.id,
            correlation_id = %correlation_id,
            model = %model,
            backend = backend.name(),
            "Task started"
        );

        let mut guard = InFlightGuard {
            instance: self,
            correlation_id: &correlation_id,
            cancel: cancel.clone(),
            armed: true,
        };

        let request = BackendRequest {
            prompt: prompt.to_string(),
            model: model.clone(),
            system_prompt: options.system_prompt.clone(),
            max_turns: options.max_turns,
            agent: options.agent.clone(),
            correlation_id: correlation_id.clone(),
            cancel: cancel.clone(),
        };

        let started = Instant::now();
        // cancelled while queued: never reach the backend
        let outcome = if cancel.is_cancelled() {
            Outcome::Cancelled
        } else {
            tokio::select! {
                biased;
                result = backend.execute(request) => Outcome::Backend(result),
                _ = tokio::time::sleep(timeout) => Outcome::TimedOut(timeout),
                _ = cancel.cancelled() => Outcome::Cancelled,
            }
        };
        guard.armed = false;
        drop(guard);

        let outcome = match outcome {
            // a backend that observes the token fails with its own error
            Outcome::Backend(Err(_)) if cancel.is_cancelled() => Outcome::Cancelled,
            Outcome::TimedOut(after) => {
                cancel.cancel();
                Outcome::TimedOut(after)
            }
            other => other,
        };

        Ok(self.complete_task(&correlation_id, options.agent, model, outcome, started.elapsed()))
    }

    fn arm_watchdog(&self, correlation_id: String, zombie_timeout: Duration) -> JoinHandle<()> {
        let this = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep(zombie_timeout).await;
            if let Some(instance) = this.upgrade() {
                instance.reap_zombie(&correlation_id);
            }
        })
    }

    fn complete_task(
        &self,
        correlation_id: &str,
        agent: Option<String>,
        model: String,
        outcome: Outcome,
        duration: Duration,
    ) -> TaskResult {
        let mut classified = Classified::from_outcome(outcome);
        let duration_ms = duration.as_millis() as u64;
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if state.owns(correlation_id) {
                if let Some(task) = state.current_task.take() {
                    task.stop();
                }
                state.task_count += 1;
                state.total_busy += duration;
                state.touch();
                if !classified.success {
                    state.failed_count += 1;
                }
                let ledger_key = agent.clone().unwrap_or_else(|| UNASSIGNED_AGENT.to_string());
                state
                    .costs
                    .entry(ledger_key)
                    .or_default()
                    .record(duration_ms, classified.cost_usd);

                let transition = if classified.success {
                    state.circuit.record_success()
                } else if classified.failure.map(|f| f.trips_circuit()).unwrap_or(false) {
                    state.circuit.record_failure()
                } else {
                    None
                };
                self.circuit_changed(&mut state, transition, &mut events);
                self.transition_locked(&mut state, LifecycleState::Ready, &mut events);
            } else if state.lifecycle == LifecycleState::Terminated {
                classified = Classified::failed(FailureKind::Cancelled, "instance terminated while the task was running");
            } else {
                classified = Classified::failed(FailureKind::ZombieTimeout, "task exceeded the zombie timeout and was reaped");
            }
        }

        events.push(PoolEvent::TaskCompleted {
            instance_id: self.id.clone(),
            correlation_id: correlation_id.to_string(),
            agent,
            success: classified.success,
            failure: classified.failure,
            duration_ms,
        });
        self.emit_all(events);

        let (error_type, suggestions) = match classified.error.as_deref() {
            Some(message) if !classified.success => {
                let diagnosis = self.diagnoser.read().diagnose(message, classified.stderr.as_deref());
                (Some(diagnosis.error_type), diagnosis.suggestions)
            }
            _ => (None, Vec::new()),
        };

        if classified.success {
            debug!(instance_id = %self.id, correlation_id, duration_ms, "Task completed");
        } else {
            info!(
                instance_id = %self.id,
                correlation_id,
                duration_ms,
                failure = ?classified.failure,
                error = classified.error.as_deref().unwrap_or_default(),
                "Task failed"
            );
        }

        TaskResult {
            success: classified.success,
            content: classified.content,
            error: classified.error,
            error_type,
            failure: classified.failure,
            suggestions,
            model,
            duration_ms,
            cost_usd: classified.cost_usd,
            instance_id: self.id.clone(),
            correlation_id: correlation_id.to_string(),
        }
    }

    /// The caller dropped `execute` mid-flight / 调用方在执行中丢弃了 future
    fn abandon_task(&self, correlation_id: &str) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if !state.owns(correlation_id) {
                return;
            }
            if let Some(task) = state.current_task.take() {
                task.stop();
            }
            state.touch();
            self.transition_locked(&mut state, LifecycleState::Ready, &mut events);
        }
        debug!(instance_id = %self.id, correlation_id, "Task abandoned by caller");
        self.emit_all(events);
    }

    /// Cancel the running task, if any / 取消当前任务
    pub fn cancel_current_task(&self, reason: &str) -> bool {
        let cancel = {
            let state = self.state.lock();
            match state.current_task.as_ref() {
                Some(task) => task.cancel.clone(),
                None => return false,
            }
        };
        info!(instance_id = %self.id, reason, "Cancelling current task");
        cancel.cancel();
        true
    }

    /// Reap the task with `correlation_id` as a zombie: cancel it and force `crashed`
    /// 将指定任务作为僵尸回收：取消任务并强制进入崩溃状态
    pub fn reap_zombie(&self, correlation_id: &str) -> bool {
        let mut events = Vec::new();
        let task = {
            let mut state = self.state.lock();
            if !state.owns(correlation_id) {
                return false;
            }
            let Some(task) = state.current_task.take() else {
                return false;
            };
            let running_ms = task.started_at.elapsed().as_millis() as u64;
            events.push(PoolEvent::ZombieDetected {
                instance_id: self.id.clone(),
                correlation_id: correlation_id.to_string(),
                running_ms,
            });
            state.failed_count += 1;
            state.touch();
            let transition = state.circuit.record_failure();
            self.circuit_changed(&mut state, transition, &mut events);
            self.transition_locked(&mut state, LifecycleState::Crashed, &mut events);
            events.push(PoolEvent::InstanceCrashed {
                instance_id: self.id.clone(),
                reason: format!("zombie task {} after {}ms", correlation_id, running_ms),
            });
            task
        };

        warn!(instance_id = %self.id, correlation_id, "Zombie task detected, instance crashed");
        task.cancel.cancel();
        task.stop();
        self.emit_all(events);
        true
    }

    /// Reap the current task if it outlived the zombie timeout / 如果当前任务超过僵尸超时则回收
    pub fn check_zombie(&self) -> bool {
        let overdue = {
            let state = self.state.lock();
            state
                .current_task
                .as_ref()
                .filter(|t| t.started_at.elapsed() > state.settings.zombie_timeout)
                .map(|t| t.correlation_id.clone())
        };
        match overdue {
            Some(correlation_id) => self.reap_zombie(&correlation_id),
            None => false,
        }
    }

    /// Lightweight probe that never calls the backend / 不调用后端的轻量探测
    pub fn health_check(&self) -> PoolResult<Duration> {
        let started = Instant::now();
        let has_backend = self.backend.read().is_some();
        let mut state = self.state.lock();
        let failure = if !state.lifecycle.is_alive() {
            Some(format!("lifecycle is {}", state.lifecycle))
        } else if state.circuit.is_open() {
            Some("circuit is open".to_string())
        } else if !has_backend {
            Some("no backend bound".to_string())
        } else {
            None
        };
        state.last_health_check_at = Some(Utc::now());
        drop(state);

        match failure {
            Some(reason) => Err(PoolError::HealthCheckFailed {
                instance_id: self.id.clone(),
                reason,
            }),
            None => Ok(started.elapsed()),
        }
    }

    /// Idempotent forced shutdown / 幂等的强制终止
    pub fn terminate(&self, reason: &str) {
        let mut events = Vec::new();
        let task = {
            let mut state = self.state.lock();
            if state.lifecycle == LifecycleState::Terminated {
                return;
            }
            let from = state.lifecycle;
            state.lifecycle = LifecycleState::Terminated;
            state.reserved = false;
            if let Some(timer) = state.cooldown_timer.take() {
                timer.abort();
            }
            events.push(PoolEvent::InstanceStateChanged {
                instance_id: self.id.clone(),
                from,
                to: LifecycleState::Terminated,
            });
            events.push(PoolEvent::InstanceTerminated {
                instance_id: self.id.clone(),
                reason: reason.to_string(),
            });
            state.current_task.take()
        };

        if let Some(task) = task {
            task.cancel.cancel();
            task.stop();
        }
        info!(instance_id = %self.id, reason, "Instance terminated");
        self.emit_all(events);
        *self.observer.write() = None;
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let state = self.state.lock();
        InstanceSnapshot {
            id: self.id.clone(),
            lifecycle: state.lifecycle,
            circuit: state.circuit.state(),
            available: Self::available_locked(&state),
            reserved: state.reserved,
            task_count: state.task_count,
            failed_count: state.failed_count,
            consecutive_failures: state.circuit.consecutive_failures(),
            total_busy_ms: state.total_busy.as_millis() as u64,
            avg_duration_ms: Self::avg_duration_locked(&state),
            idle_ms: state.last_used.unwrap_or(state.created).elapsed().as_millis() as u64,
            created_at: self.created_at,
            last_used_at: state.last_used_at,
            last_health_check_at: state.last_health_check_at,
            current_task: state.current_task.as_ref().map(|t| CurrentTaskSnapshot {
                correlation_id: t.correlation_id.clone(),
                agent: t.agent.clone(),
                prompt_preview: t.prompt_preview.clone(),
                started_at: t.started_at_utc,
                running_ms: t.started_at.elapsed().as_millis() as u64,
            }),
            costs: state.costs.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::backend::ResultMessage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Clone, Copy)]
    enum Mode {
        Succeed,
        Throw,
        Business,
        Hang,
    }

    struct StubBackend {
        mode: Mutex<Mode>,
        calls: AtomicUsize,
        saw_cancel: Arc<AtomicBool>,
    }

    impl StubBackend {
        fn new(mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                mode: Mutex::new(mode),
                calls: AtomicUsize::new(0),
                saw_cancel: Arc::new(AtomicBool::new(false)),
            })
        }

        fn set_mode(&self, mode: Mode) {
            *self.mode.lock() = mode;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExecutionBackend for StubBackend {
        async fn execute(&self, request: BackendRequest) -> Result<RawResult, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mode = *self.mode.lock();
            match mode {
                Mode::Succeed => Ok(RawResult::completed(
                    ResultMessage::success(format!("echo: {}", request.prompt)).with_cost(0.25),
                )),
                Mode::Throw => Err(BackendError::new("connection refused")),
                Mode::Business => Ok(RawResult::Error {
                    message: "model not found".to_string(),
                    stderr_output: None,
                }),
                Mode::Hang => {
                    request.cancel.cancelled().await;
                    self.saw_cancel.store(true, Ordering::SeqCst);
                    std::future::pending().await
                }
            }
        }
    }

    fn settings(threshold: u32) -> InstanceSettings {
        InstanceSettings {
            task_timeout: Duration::from_secs(5),
            zombie_timeout: Duration::from_secs(10),
            max_consecutive_failures: threshold,
            circuit_cooldown: Duration::from_millis(50),
            default_model: "default".to_string(),
        }
    }

    async fn ready_instance(mode: Mode, settings: InstanceSettings) -> (Arc<Instance>, Arc<StubBackend>) {
        let instance = Instance::new(settings);
        let backend = StubBackend::new(mode);
        instance.bind_backend(backend.clone());
        instance.spawn().await.unwrap();
        (instance, backend)
    }

    #[tokio::test]
    async fn test_spawn_without_backend_crashes() {
        let instance = Instance::new(settings(3));
        let err = instance.spawn().await.unwrap_err();
        assert!(matches!(err, PoolError::BackendNotBound { .. }));
        assert_eq!(instance.lifecycle(), LifecycleState::Crashed);
        assert_eq!(instance.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_opening_circuit_terminates() {
        let instance = Instance::new(settings(1));
        assert!(instance.spawn().await.is_err());
        assert_eq!(instance.lifecycle(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn test_spawn_only_from_cold_or_crashed() {
        let (instance, _) = ready_instance(Mode::Succeed, settings(3)).await;
        assert_eq!(instance.lifecycle(), LifecycleState::Ready);
        assert_eq!(instance.circuit_state(), CircuitState::Closed);

        let err = instance.spawn().await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidState { .. }));
        assert_eq!(instance.lifecycle(), LifecycleState::Ready);
    }

    #[tokio::test]
    async fn test_illegal_transition_is_ignored() {
        let (instance, _) = ready_instance(Mode::Succeed, settings(3)).await;
        assert!(!instance.transition(LifecycleState::Spawning));
        assert!(!instance.transition(LifecycleState::Crashed));
        assert_eq!(instance.lifecycle(), LifecycleState::Ready);
    }

    #[tokio::test]
    async fn test_execute_success_updates_ledger() {
        let (instance, _) = ready_instance(Mode::Succeed, settings(3)).await;
        let result = instance
            .execute("hello", TaskOptions::default().with_agent("planner"))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.content.as_deref(), Some("echo: hello"));
        assert_eq!(result.model, "default");
        assert_eq!(result.instance_id, instance.id());
        assert_eq!(instance.lifecycle(), LifecycleState::Ready);
        assert_eq!(instance.task_count(), 1);

        let ledger = instance.cost_ledger();
        assert_eq!(ledger["planner"].task_count, 1);
        assert_eq!(ledger["planner"].total_cost_usd, 0.25);
        assert!(instance.current_correlation_id().is_none());
    }

    #[tokio::test]
    async fn test_model_alias_resolution() {
        let (instance, _) = ready_instance(Mode::Succeed, settings(3)).await;
        let mut aliases = HashMap::new();
        aliases.insert("fast".to_string(), "provider/fast-v2".to_string());
        instance.set_model_resolver(Arc::new(StaticModelResolver::new(aliases)));

        let result = instance
            .execute("x", TaskOptions::default().with_model("fast"))
            .await
            .unwrap();
        assert_eq!(result.model, "provider/fast-v2");
    }

    #[tokio::test]
    async fn test_circuit_opens_and_blocks_backend() {
        let (instance, backend) = ready_instance(Mode::Throw, settings(2)).await;

        for _ in 0..2 {
            let result = instance.execute("boom", TaskOptions::default()).await.unwrap();
            assert!(!result.success);
            assert_eq!(result.failure, Some(FailureKind::Backend));
            assert_eq!(result.error_type.as_deref(), Some("network"));
        }
        assert_eq!(instance.circuit_state(), CircuitState::Open);
        assert_eq!(instance.lifecycle(), LifecycleState::Ready);
        assert!(!instance.is_available());

        let err = instance.execute("boom", TaskOptions::default()).await.unwrap_err();
        assert!(matches!(err, PoolError::CircuitOpen { .. }));
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_half_open_success_closes_circuit() {
        let (instance, backend) = ready_instance(Mode::Throw, settings(1)).await;
        instance.execute("boom", TaskOptions::default()).await.unwrap();
        assert_eq!(instance.circuit_state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(instance.circuit_state(), CircuitState::HalfOpen);
        assert!(instance.is_available());

        backend.set_mode(Mode::Succeed);
        let result = instance.execute("ok", TaskOptions::default()).await.unwrap();
        assert!(result.success);
        assert_eq!(instance.circuit_state(), CircuitState::Closed);
        assert_eq!(instance.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let (instance, _) = ready_instance(Mode::Throw, settings(1)).await;
        instance.execute("boom", TaskOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(instance.circuit_state(), CircuitState::HalfOpen);

        instance.execute("boom", TaskOptions::default()).await.unwrap();
        assert_eq!(instance.circuit_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_business_error_is_circuit_neutral() {
        let (instance, _) = ready_instance(Mode::Business, settings(1)).await;
        for _ in 0..3 {
            let result = instance.execute("q", TaskOptions::default()).await.unwrap();
            assert!(!result.success);
            assert_eq!(result.failure, Some(FailureKind::BusinessError));
            assert_eq!(result.error_type.as_deref(), Some("model_not_found"));
        }
        assert_eq!(instance.circuit_state(), CircuitState::Closed);
        assert_eq!(instance.consecutive_failures(), 0);
        assert_eq!(instance.cost_ledger()[UNASSIGNED_AGENT].task_count, 3);
        assert_eq!(instance.failed_count(), 3);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_circuit_failure() {
        let (instance, _) = ready_instance(Mode::Hang, settings(3)).await;
        let result = instance
            .execute("slow", TaskOptions::default().with_timeout(Duration::from_millis(30)))
            .await
            .unwrap();

        assert_eq!(result.failure, Some(FailureKind::Timeout));
        assert_eq!(result.error_type.as_deref(), Some("timeout"));
        assert_eq!(instance.consecutive_failures(), 1);
        assert_eq!(instance.lifecycle(), LifecycleState::Ready);
    }

    #[tokio::test]
    async fn test_external_cancellation() {
        let (instance, _) = ready_instance(Mode::Hang, settings(3)).await;
        let external = CancellationToken::new();
        let trigger = external.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = instance
            .execute("wait", TaskOptions::default().with_cancel(external))
            .await
            .unwrap();
        assert_eq!(result.failure, Some(FailureKind::Cancelled));
        assert_eq!(instance.consecutive_failures(), 0);
        assert_eq!(instance.lifecycle(), LifecycleState::Ready);
    }

    #[tokio::test]
    async fn test_pre_cancelled_task_skips_backend() {
        let (instance, backend) = ready_instance(Mode::Succeed, settings(3)).await;
        let token = CancellationToken::new();
        token.cancel();

        let result = instance
            .execute("never sent", TaskOptions::default().with_cancel(token))
            .await
            .unwrap();
        assert_eq!(result.failure, Some(FailureKind::Cancelled));
        assert_eq!(backend.calls(), 0);
        assert_eq!(instance.consecutive_failures(), 0);
        assert_eq!(instance.lifecycle(), LifecycleState::Ready);
    }

    #[tokio::test]
    async fn test_cancel_current_task() {
        let (instance, _) = ready_instance(Mode::Hang, settings(3)).await;
        assert!(!instance.cancel_current_task("idle"));

        let runner = instance.clone();
        let handle = tokio::spawn(async move { runner.execute("wait", TaskOptions::default()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(instance.is_busy());
        assert!(instance.cancel_current_task("user request"));

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.failure, Some(FailureKind::Cancelled));
    }

    #[tokio::test]
    async fn test_zombie_watchdog_crashes_instance() {
        let mut s = settings(3);
        s.zombie_timeout = Duration::from_millis(40);
        s.task_timeout = Duration::from_secs(10);
        let (instance, backend) = ready_instance(Mode::Hang, s).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        instance.attach_observer(tx);

        let result = instance.execute("hang", TaskOptions::default()).await.unwrap();
        assert_eq!(result.failure, Some(FailureKind::ZombieTimeout));
        assert_eq!(instance.lifecycle(), LifecycleState::Crashed);
        assert_eq!(instance.consecutive_failures(), 1);
        assert!(backend.saw_cancel.load(Ordering::SeqCst));

        let mut saw_zombie = false;
        let mut saw_crash = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                PoolEvent::ZombieDetected { .. } => saw_zombie = true,
                PoolEvent::InstanceCrashed { .. } => saw_crash = true,
                _ => {}
            }
        }
        assert!(saw_zombie && saw_crash);

        instance.spawn().await.unwrap();
        assert_eq!(instance.lifecycle(), LifecycleState::Ready);
        assert_eq!(instance.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_dropped_execute_returns_to_ready() {
        let (instance, backend) = ready_instance(Mode::Hang, settings(3)).await;
        tokio::select! {
            _ = instance.execute("dropped", TaskOptions::default()) => panic!("hang backend completed"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
        assert_eq!(instance.lifecycle(), LifecycleState::Ready);
        assert!(instance.current_correlation_id().is_none());
        assert_eq!(instance.task_count(), 0);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_reservation() {
        let (instance, _) = ready_instance(Mode::Succeed, settings(3)).await;
        assert!(instance.try_reserve());
        assert!(!instance.try_reserve());
        assert!(!instance.is_available());

        // Executing consumes the reservation
        instance.execute("x", TaskOptions::default()).await.unwrap();
        assert!(!instance.is_reserved());
        assert!(instance.try_reserve());
        assert!(instance.release_reservation());
        assert!(!instance.release_reservation());
    }

    #[tokio::test]
    async fn test_health_check() {
        let (instance, _) = ready_instance(Mode::Succeed, settings(3)).await;
        assert!(instance.health_check().is_ok());
        assert!(instance.snapshot().last_health_check_at.is_some());

        instance.terminate("test");
        let err = instance.health_check().unwrap_err();
        assert!(matches!(err, PoolError::HealthCheckFailed { .. }));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_and_detaches() {
        let (instance, _) = ready_instance(Mode::Succeed, settings(3)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        instance.attach_observer(tx);

        instance.terminate("first");
        instance.terminate("second");
        assert_eq!(instance.lifecycle(), LifecycleState::Terminated);

        let mut terminations = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PoolEvent::InstanceTerminated { .. }) {
                terminations += 1;
            }
        }
        assert_eq!(terminations, 1);
        assert!(!instance.transition(LifecycleState::Spawning));
        assert!(instance.spawn().await.is_err());
    }

    #[tokio::test]
    async fn test_terminate_cancels_in_flight_task() {
        let (instance, backend) = ready_instance(Mode::Hang, settings(3)).await;
        let runner = instance.clone();
        let handle = tokio::spawn(async move { runner.execute("wait", TaskOptions::default()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        instance.terminate("shutdown");
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.failure, Some(FailureKind::Cancelled));
        assert!(backend.saw_cancel.load(Ordering::SeqCst));
        assert_eq!(instance.lifecycle(), LifecycleState::Terminated);
    }
}
