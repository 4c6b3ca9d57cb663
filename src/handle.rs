//! 定义 `ControllerHandle`，这是 watch 通知进入控制器的入口。
//!
//! `ControllerHandle` 把每个通知包装成 `ServiceChange` 放入共享的变更队列。
//! 入队路径与初始同步屏障共用同一把互斥锁，屏障排空、排序、重新入队期间
//! 新到达的通知会等待，保证顺序。
//!
//! 这个句柄是 `Clone` 的，可以在多个 watch 任务之间共享。

use crate::queue::ChangeQueue;
use crate::types::{ChangeId, ServiceChange, ServiceRecord, WatchEvent};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// 控制器与句柄共享的状态。
pub(crate) struct Shared {
    pub(crate) queue: Arc<ChangeQueue<ServiceChange>>,
    /// 入队路径与初始同步屏障共用的锁。
    pub(crate) sync_lock: Mutex<()>,
    next_change_id: AtomicU64,
}

impl Shared {
    pub(crate) fn new(queue: Arc<ChangeQueue<ServiceChange>>) -> Self {
        Shared {
            queue,
            sync_lock: Mutex::new(()),
            next_change_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ChangeId {
        self.next_change_id.fetch_add(1, Ordering::Relaxed)
    }

    /// 构造一个带新 ID 的变更。
    pub(crate) fn new_change(
        &self,
        key: Option<String>,
        old_service: Option<ServiceRecord>,
    ) -> ServiceChange {
        ServiceChange {
            id: self.next_id(),
            key,
            old_service,
            requeued_allocation: false,
        }
    }
}

/// 向控制器投递 watch 通知的句柄。
#[derive(Clone)]
pub struct ControllerHandle {
    shared: Arc<Shared>,
}

impl ControllerHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        ControllerHandle { shared }
    }

    /// 新增通知。
    pub fn on_add(&self, service: &ServiceRecord) {
        self.enqueue_change(Some(service), None);
    }

    /// 更新通知。
    pub fn on_update(&self, old: &ServiceRecord, new: &ServiceRecord) {
        self.enqueue_change(Some(new), Some(old));
    }

    /// 删除通知。
    pub fn on_delete(&self, old: &ServiceRecord) {
        self.enqueue_change(None, Some(old));
    }

    /// 分派单个 watch 事件。
    pub fn dispatch(&self, event: &WatchEvent) {
        match event {
            WatchEvent::Added(service) => self.on_add(service),
            WatchEvent::Updated { old, new } => self.on_update(old, new),
            WatchEvent::Deleted(old) => self.on_delete(old),
        }
    }

    /// 把一个 watch 事件流转发给控制器，直到流结束。
    ///
    /// 返回转发的事件数。
    pub async fn forward_events<S>(&self, events: S) -> usize
    where
        S: Stream<Item = WatchEvent> + Send,
    {
        info!("(Handle) 开始转发 watch 事件");
        let mut events = Box::pin(events);
        let mut forwarded = 0;
        while let Some(event) = events.next().await {
            self.dispatch(&event);
            forwarded += 1;
        }
        info!("(Handle) watch 事件流结束，共转发 {} 个事件", forwarded);
        forwarded
    }

    /// 队列中等待处理的变更数。
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    fn enqueue_change(&self, new: Option<&ServiceRecord>, old: Option<&ServiceRecord>) {
        if new.is_none() && old.is_none() {
            trace!("(Handle) 新旧对象都为空，忽略");
            return;
        }
        let _guard = self.shared.sync_lock.lock();
        let change = self
            .shared
            .new_change(new.map(ServiceRecord::key), old.cloned());
        debug!(
            "(Handle) 变更 {} 入队: key={:?}, 有旧对象={}",
            change.id,
            change.key,
            change.old_service.is_some()
        );
        self.shared.queue.add(change);
    }
}
