//! 进程内的服务存储。
//!
//! `MemoryStore` 同时实现 `ServiceLister` 与 `ServiceClient`，
//! 每次写入都分配新的版本号并向订阅者发送 `WatchEvent`。
//! 它用于演示程序和测试，也可以注入写入失败来模拟暂时性的存储错误。

use crate::client::{ServiceClient, ServiceLister};
use crate::types::{ServiceKey, ServiceRecord, WatchEvent, WriteOutcome};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// 写入计数。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub spec: usize,
    pub status: usize,
}

impl WriteCounts {
    pub fn total(&self) -> usize {
        self.spec + self.status
    }
}

struct StoreInner {
    services: BTreeMap<ServiceKey, ServiceRecord>,
    next_version: u64,
    synced: bool,
    /// 写入时是否要求版本号与存储中的一致 (不一致返回 `Conflict`)。
    strict_versions: bool,
    /// 预设的写入结果，每次控制器写入消耗一个。
    injected: VecDeque<WriteOutcome>,
    counts: WriteCounts,
    subscribers: Vec<mpsc::UnboundedSender<WatchEvent>>,
}

impl StoreInner {
    fn bump(&mut self, record: &mut ServiceRecord) {
        self.next_version += 1;
        record.resource_version = self.next_version;
    }

    fn publish(&mut self, event: WatchEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// 进程内服务存储。
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Mutex::new(StoreInner {
                services: BTreeMap::new(),
                next_version: 0,
                synced: false,
                strict_versions: false,
                injected: VecDeque::new(),
                counts: WriteCounts::default(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// 启用版本号检查: 控制器用过期版本写入时返回 `Conflict`。
    pub fn with_strict_versions(self) -> Self {
        self.inner.lock().strict_versions = true;
        self
    }

    /// 订阅后续的变更事件。
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<WatchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(tx);
        rx
    }

    /// 标记初始 list 已全部投递。
    pub fn mark_synced(&self) {
        self.inner.lock().synced = true;
    }

    /// 创建 (或覆盖) 服务，发送 `Added` 事件。
    pub fn create(&self, mut record: ServiceRecord) -> ServiceRecord {
        let mut inner = self.inner.lock();
        inner.bump(&mut record);
        let key = record.key();
        debug!("(Store) 创建服务 {}", key);
        inner.services.insert(key, record.clone());
        inner.publish(WatchEvent::Added(record.clone()));
        record
    }

    /// 模拟用户修改服务: 用 `edit` 修改当前对象，发送 `Updated` 事件。
    pub fn edit<F>(&self, key: &str, edit: F) -> Option<ServiceRecord>
    where
        F: FnOnce(&mut ServiceRecord),
    {
        let mut inner = self.inner.lock();
        let old = inner.services.get(key)?.clone();
        let mut new = old.clone();
        edit(&mut new);
        inner.bump(&mut new);
        inner.services.insert(key.to_string(), new.clone());
        inner.publish(WatchEvent::Updated {
            old,
            new: new.clone(),
        });
        Some(new)
    }

    /// 删除服务，发送 `Deleted` 事件。
    pub fn delete(&self, key: &str) -> Option<ServiceRecord> {
        let mut inner = self.inner.lock();
        let removed = inner.services.remove(key)?;
        debug!("(Store) 删除服务 {}", key);
        inner.publish(WatchEvent::Deleted(removed.clone()));
        Some(removed)
    }

    /// 让接下来的 `n` 次控制器写入返回 `Other(message)`。
    pub fn fail_next_writes(&self, n: usize, message: &str) {
        let mut inner = self.inner.lock();
        for _ in 0..n {
            inner.injected.push_back(WriteOutcome::Other(message.to_string()));
        }
    }

    /// 让下一次控制器写入返回给定结果 (不修改存储)。
    pub fn inject_outcome(&self, outcome: WriteOutcome) {
        self.inner.lock().injected.push_back(outcome);
    }

    /// 控制器写入 (成功或失败) 的次数。
    pub fn write_counts(&self) -> WriteCounts {
        self.inner.lock().counts
    }

    /// 所有服务的快照 (按键排序)。
    pub fn list(&self) -> Vec<ServiceRecord> {
        self.inner.lock().services.values().cloned().collect()
    }

    fn write<F>(&self, service: &ServiceRecord, apply: F) -> WriteOutcome
    where
        F: FnOnce(&mut ServiceRecord),
    {
        let mut inner = self.inner.lock();
        if let Some(outcome) = inner.injected.pop_front() {
            trace!("(Store) 对 {} 的写入返回预设结果 {:?}", service.key(), outcome);
            return outcome;
        }
        let key = service.key();
        let old = match inner.services.get(&key) {
            Some(old) => old.clone(),
            None => return WriteOutcome::NotFound,
        };
        if inner.strict_versions && old.resource_version != service.resource_version {
            return WriteOutcome::Conflict;
        }
        let mut new = old.clone();
        apply(&mut new);
        inner.bump(&mut new);
        inner.services.insert(key, new.clone());
        inner.publish(WatchEvent::Updated { old, new });
        WriteOutcome::Success
    }
}

impl ServiceLister for MemoryStore {
    fn get(&self, key: &str) -> Option<ServiceRecord> {
        self.inner.lock().services.get(key).cloned()
    }

    fn has_synced(&self) -> bool {
        self.inner.lock().synced
    }
}

#[async_trait]
impl ServiceClient for MemoryStore {
    async fn update_spec(&self, service: &ServiceRecord) -> WriteOutcome {
        self.inner.lock().counts.spec += 1;
        let spec = service.spec.clone();
        self.write(service, move |record| record.spec = spec)
    }

    async fn update_status(&self, service: &ServiceRecord) -> WriteOutcome {
        self.inner.lock().counts.status += 1;
        let status = service.status.clone();
        self.write(service, move |record| record.status = status)
    }
}
