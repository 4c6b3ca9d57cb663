//! 限流、去重的工作队列。
//!
//! 语义:
//! - 同一 ID 的条目在队列中最多出现一次；重复 `add` 只更新其内容。
//! - 被 `get` 取出、尚未 `done` 的条目再次 `add` 时不会立即可见，
//!   而是在 `done` 之后重新排队，所以同一 ID 同一时刻最多被一个消费者处理。
//! - `add_rate_limited` 按条目的失败次数做指数退避，`forget` 清零。
//! - `shut_down` 之后新的 `add` 被忽略，`get` 取完剩余条目后返回 `None`，
//!   等待中的延迟入队被取消。

use crate::types::{ChangeId, ServiceChange};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// 可放入 `ChangeQueue` 的条目。
pub trait QueueItem: Clone + Send + 'static {
    /// 去重与退避使用的标识。
    type Id: Eq + Hash + Clone + Debug + Send + 'static;

    fn queue_id(&self) -> Self::Id;
}

impl QueueItem for ServiceChange {
    type Id = ChangeId;

    fn queue_id(&self) -> ChangeId {
        self.id
    }
}

/// 逐条目指数退避参数: 第 n 次失败后等待 `base_delay * 2^n`，不超过 `max_delay`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

struct Inner<T: QueueItem> {
    /// 等待处理的 ID (按入队顺序)。
    order: VecDeque<T::Id>,
    /// 待处理条目的最新内容。
    dirty: HashMap<T::Id, T>,
    /// 已被取出、尚未 `done` 的 ID。
    processing: HashSet<T::Id>,
    /// 每个 ID 的连续失败次数。
    failures: HashMap<T::Id, u32>,
    shutting_down: bool,
}

/// 变更队列。
pub struct ChangeQueue<T: QueueItem> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    rate_limiter: RateLimiterConfig,
    /// 取消等待中的延迟入队。
    shutdown: CancellationToken,
    /// 正在等待的延迟入队数量。
    delayed: AtomicUsize,
}

impl<T: QueueItem> ChangeQueue<T> {
    pub fn new(rate_limiter: RateLimiterConfig) -> Self {
        ChangeQueue {
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                dirty: HashMap::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            rate_limiter,
            shutdown: CancellationToken::new(),
            delayed: AtomicUsize::new(0),
        }
    }

    /// 加入条目。
    pub fn add(&self, item: T) {
        let mut inner = self.inner.lock();
        if inner.shutting_down {
            trace!("(Queue) 队列正在关闭，忽略条目 {:?}", item.queue_id());
            return;
        }
        let id = item.queue_id();
        if let Some(existing) = inner.dirty.get_mut(&id) {
            *existing = item;
            return;
        }
        inner.dirty.insert(id.clone(), item);
        if inner.processing.contains(&id) {
            // 在 done 时重新排队
            return;
        }
        inner.order.push_back(id);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// 在 `delay` 之后加入条目。
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay == Duration::ZERO {
            self.add(item);
            return;
        }
        self.delayed.fetch_add(1, Ordering::SeqCst);
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(item),
            }
            queue.delayed.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// 按条目的失败次数退避后加入条目。
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = self.when(&item.queue_id());
        trace!("(Queue) 条目 {:?} 将在 {:?} 后重新入队", item.queue_id(), delay);
        self.add_after(item, delay);
    }

    /// 记录一次失败并返回下一次重试前应等待的时间。
    pub fn when(&self, id: &T::Id) -> Duration {
        let mut inner = self.inner.lock();
        let failures = inner.failures.entry(id.clone()).or_insert(0);
        let exponent = *failures;
        *failures = failures.saturating_add(1);
        drop(inner);

        let base = self.rate_limiter.base_delay.as_secs_f64();
        let secs = base * 2f64.powi(exponent.min(i32::MAX as u32) as i32);
        if !secs.is_finite() || secs > self.rate_limiter.max_delay.as_secs_f64() {
            self.rate_limiter.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// 清除条目的失败记录。
    pub fn forget(&self, id: &T::Id) {
        self.inner.lock().failures.remove(id);
    }

    /// 条目的失败次数。
    pub fn num_requeues(&self, id: &T::Id) -> u32 {
        self.inner.lock().failures.get(id).copied().unwrap_or(0)
    }

    /// 等待并取出下一个条目。队列关闭且为空时返回 `None`。
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if let Some(item) = Self::pop_next(&mut inner) {
                    return Some(item);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// 不等待地取出下一个条目。
    pub fn try_get(&self) -> Option<T> {
        Self::pop_next(&mut self.inner.lock())
    }

    fn pop_next(inner: &mut Inner<T>) -> Option<T> {
        while let Some(id) = inner.order.pop_front() {
            if let Some(item) = inner.dirty.remove(&id) {
                inner.processing.insert(id);
                return Some(item);
            }
        }
        None
    }

    /// 标记条目处理完成。处理期间再次加入的条目此时重新排队。
    pub fn done(&self, id: &T::Id) {
        let mut inner = self.inner.lock();
        inner.processing.remove(id);
        if inner.dirty.contains_key(id) {
            inner.order.push_back(id.clone());
            drop(inner);
            self.notify.notify_waiters();
        }
    }

    /// 等待处理的条目数 (不含延迟入队和处理中的条目)。
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 正在等待的延迟入队数。
    pub fn delayed_len(&self) -> usize {
        self.delayed.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    /// 关闭队列，唤醒所有等待的 `get`。
    pub fn shut_down(&self) {
        self.inner.lock().shutting_down = true;
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: u64,
        payload: &'static str,
    }

    impl QueueItem for Item {
        type Id = u64;

        fn queue_id(&self) -> u64 {
            self.id
        }
    }

    fn item(id: u64, payload: &'static str) -> Item {
        Item { id, payload }
    }

    fn queue() -> Arc<ChangeQueue<Item>> {
        Arc::new(ChangeQueue::new(RateLimiterConfig {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
        }))
    }

    #[tokio::test]
    async fn test_fifo_and_dedup() {
        let q = queue();
        q.add(item(1, "a"));
        q.add(item(2, "b"));
        q.add(item(1, "a2"));
        assert_eq!(q.len(), 2);
        // 重复加入保留原位置，内容被更新
        assert_eq!(q.get().await, Some(item(1, "a2")));
        assert_eq!(q.get().await, Some(item(2, "b")));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_add_during_processing_is_deferred() {
        let q = queue();
        q.add(item(1, "first"));
        let got = q.get().await.unwrap();
        q.add(item(1, "second"));
        // 处理中，不可见
        assert_eq!(q.len(), 0);
        assert_eq!(q.try_get(), None);
        q.done(&got.id);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some(item(1, "second")));
    }

    #[test]
    fn test_exponential_backoff_and_forget() {
        let q = queue();
        assert_eq!(q.when(&7), Duration::from_millis(5));
        assert_eq!(q.when(&7), Duration::from_millis(10));
        assert_eq!(q.when(&7), Duration::from_millis(20));
        assert_eq!(q.num_requeues(&7), 3);
        q.forget(&7);
        assert_eq!(q.num_requeues(&7), 0);
        assert_eq!(q.when(&7), Duration::from_millis(5));
    }

    #[test]
    fn test_backoff_is_capped() {
        let q = queue();
        for _ in 0..100 {
            q.when(&1);
        }
        assert_eq!(q.when(&1), Duration::from_secs(1000));
    }

    #[tokio::test]
    async fn test_add_after_delivers() {
        let q = queue();
        q.add_after(item(3, "late"), Duration::from_millis(10));
        assert_eq!(q.len(), 0);
        assert_eq!(q.delayed_len(), 1);
        let got = tokio::time::timeout(Duration::from_secs(5), q.get())
            .await
            .expect("延迟条目应当到达");
        assert_eq!(got, Some(item(3, "late")));
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_get_and_cancels_delayed() {
        let q = queue();
        q.add_after(item(4, "never"), Duration::from_secs(3600));
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.shut_down();
        let got = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("get 应当被唤醒")
            .unwrap();
        assert_eq!(got, None);
        // 关闭后忽略新条目
        q.add(item(5, "ignored"));
        assert_eq!(q.len(), 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(q.delayed_len(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_remaining_first() {
        let q = queue();
        q.add(item(1, "a"));
        q.shut_down();
        assert_eq!(q.get().await, Some(item(1, "a")));
        assert_eq!(q.get().await, None);
    }
}
