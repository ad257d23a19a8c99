//! Acquire queue
//! 获取队列
//!
//! Pending `acquire_instance` callers. High-priority waiters are placed
//! behind earlier high-priority waiters but ahead of every normal/low one,
//! so service is FIFO within a tier.
//! 等待获取实例的调用方。高优先级请求排在已有高优先级请求之后、所有普通/低优先级请求之前。

use super::instance::Instance;
use super::types::{AcquireOptions, Priority};
use super::PoolResult;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub type AcquireResponder = oneshot::Sender<PoolResult<Arc<Instance>>>;

/// One queued acquisition / 一个排队的获取请求
#[derive(Debug)]
pub struct Waiter {
    pub id: u64,
    pub options: AcquireOptions,
    pub enqueued_at: Instant,
    responder: AcquireResponder,
    timer: Option<JoinHandle<()>>,
}

impl Waiter {
    pub fn new(id: u64, options: AcquireOptions, responder: AcquireResponder) -> Self {
        Self {
            id,
            options,
            enqueued_at: Instant::now(),
            responder,
            timer: None,
        }
    }

    /// Attach the acquire-timeout timer / 绑定获取超时计时器
    pub fn set_timer(&mut self, timer: JoinHandle<()>) {
        if let Some(previous) = self.timer.replace(timer) {
            previous.abort();
        }
    }

    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    /// The caller stopped waiting / 调用方已不再等待
    pub fn is_abandoned(&self) -> bool {
        self.responder.is_closed()
    }

    /// Complete the waiter; hands the value back if the caller is gone
    /// 完成等待；调用方已离开时返还结果
    pub fn resolve(mut self, result: PoolResult<Arc<Instance>>) -> Result<(), PoolResult<Arc<Instance>>> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.responder.send(result)
    }
}

#[derive(Debug, Default)]
pub struct AcquireQueue {
    entries: VecDeque<Waiter>,
    next_id: u64,
}

impl AcquireQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn push(&mut self, waiter: Waiter) {
        match waiter.options.priority {
            Priority::High => {
                let position = self
                    .entries
                    .iter()
                    .position(|w| w.options.priority != Priority::High)
                    .unwrap_or(self.entries.len());
                self.entries.insert(position, waiter);
            }
            Priority::Normal | Priority::Low => self.entries.push_back(waiter),
        }
    }

    pub fn front(&self) -> Option<&Waiter> {
        self.entries.front()
    }

    pub fn pop_front(&mut self) -> Option<Waiter> {
        self.entries.pop_front()
    }

    /// Remove a waiter by id (timeout path) / 按 id 移除等待者（超时路径）
    pub fn remove(&mut self, id: u64) -> Option<Waiter> {
        let position = self.entries.iter().position(|w| w.id == id)?;
        self.entries.remove(position)
    }

    /// Drop waiters whose caller went away; returns how many / 移除调用方已离开的等待者
    pub fn prune_abandoned(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|w| !w.is_abandoned());
        before - self.entries.len()
    }

    pub fn drain(&mut self) -> Vec<Waiter> {
        self.entries.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolError;

    fn enqueue(queue: &mut AcquireQueue, priority: Priority) -> (u64, oneshot::Receiver<PoolResult<Arc<Instance>>>) {
        let (tx, rx) = oneshot::channel();
        let id = queue.next_id();
        let options = AcquireOptions {
            agent: None,
            priority,
        };
        queue.push(Waiter::new(id, options, tx));
        (id, rx)
    }

    fn order(queue: &mut AcquireQueue) -> Vec<u64> {
        let mut ids = Vec::new();
        while let Some(w) = queue.pop_front() {
            ids.push(w.id);
        }
        ids
    }

    #[test]
    fn test_fifo_within_tier() {
        let mut queue = AcquireQueue::new();
        let (a, _ra) = enqueue(&mut queue, Priority::Normal);
        let (b, _rb) = enqueue(&mut queue, Priority::Low);
        let (c, _rc) = enqueue(&mut queue, Priority::Normal);
        assert_eq!(order(&mut queue), vec![a, b, c]);
    }

    #[test]
    fn test_high_priority_jumps_ahead() {
        let mut queue = AcquireQueue::new();
        let (n1, _r1) = enqueue(&mut queue, Priority::Normal);
        let (h1, _r2) = enqueue(&mut queue, Priority::High);
        let (n2, _r3) = enqueue(&mut queue, Priority::Normal);
        let (h2, _r4) = enqueue(&mut queue, Priority::High);
        assert_eq!(order(&mut queue), vec![h1, h2, n1, n2]);
    }

    #[test]
    fn test_remove_by_id() {
        let mut queue = AcquireQueue::new();
        let (a, _ra) = enqueue(&mut queue, Priority::Normal);
        let (b, _rb) = enqueue(&mut queue, Priority::Normal);
        assert!(queue.remove(a).is_some());
        assert!(queue.remove(a).is_none());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.front().map(|w| w.id), Some(b));
    }

    #[test]
    fn test_prune_abandoned() {
        let mut queue = AcquireQueue::new();
        let (_a, ra) = enqueue(&mut queue, Priority::Normal);
        let (_b, _rb) = enqueue(&mut queue, Priority::Normal);
        drop(ra);
        assert_eq!(queue.prune_abandoned(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_delivers_result() {
        let mut queue = AcquireQueue::new();
        let (_id, rx) = enqueue(&mut queue, Priority::Normal);
        let waiter = queue.pop_front().unwrap();
        assert!(waiter.resolve(Err(PoolError::ShuttingDown)).is_ok());
        assert!(matches!(rx.await.unwrap(), Err(PoolError::ShuttingDown)));
    }

    #[test]
    fn test_resolve_abandoned_returns_value() {
        let mut queue = AcquireQueue::new();
        let (_id, rx) = enqueue(&mut queue, Priority::Normal);
        drop(rx);
        let waiter = queue.pop_front().unwrap();
        assert!(waiter.is_abandoned());
        assert!(waiter.resolve(Err(PoolError::Draining)).is_err());
    }
}
