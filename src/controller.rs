//! 控制器的主模块定义和核心事件循环
//!
//! 包含 `IngressIpController` 结构体定义、启动函数 (`spawn`)、主循环 (`run`)
//! 以及单个变更的处理与重试策略 (`work`)。
//! 具体的同步逻辑放在 `components` 子模块中，初始同步屏障放在 `sync` 子模块中。

// 声明子模块 (Declare submodules)
pub mod components;
mod sync;

use crate::client::{ServiceClient, ServiceLister};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::handle::{ControllerHandle, Shared};
use crate::queue::ChangeQueue;
use crate::types::{ServiceChange, ServiceKey};
use components::{
    AddressAllocator, ChangeHandler, DefaultChangeHandler, EventRecorder, LocalAllocations,
    RangeAllocator, ReconcileContext, RetryingPersister, ServicePersister, TracingEventRecorder,
    REASON_RANGE_FULL,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Ingress 地址分配控制器
///
/// 单个 Worker 独占地址池和本地分配表，逐个处理 `ControllerHandle` 投递的变更。
pub struct IngressIpController {
    /// 与句柄共享的队列和入队锁
    shared: Arc<Shared>,
    /// 服务快照
    lister: Arc<dyn ServiceLister>,
    /// 地址池 + 地址到服务的映射
    allocations: LocalAllocations,
    /// 因地址池耗尽而等待重试的服务键
    requeued_allocations: HashSet<ServiceKey>,

    change_handler: Box<dyn ChangeHandler>,
    persister: Box<dyn ServicePersister>,
    recorder: Box<dyn EventRecorder>,

    sync_poll_period: Duration,
    /// 停止时取消，中断持久化重试的等待
    cancel: CancellationToken,
}

impl IngressIpController {
    /// 使用默认组件创建控制器。
    ///
    /// 返回用于投递 watch 通知的句柄和尚未启动的控制器。
    pub fn new<L, C>(
        config: ControllerConfig,
        lister: Arc<L>,
        client: Arc<C>,
    ) -> (ControllerHandle, Self)
    where
        L: ServiceLister,
        C: ServiceClient,
    {
        let queue = Arc::new(ChangeQueue::new(config.rate_limiter));
        let shared = Arc::new(Shared::new(queue));
        let cancel = CancellationToken::new();

        info!(
            "(Controller) 已创建。地址池: {} ({} 个地址), 同步轮询间隔: {:?}",
            config.ingress_range,
            config.ingress_range.size(),
            config.sync_poll_period
        );

        let controller = IngressIpController {
            shared: shared.clone(),
            lister,
            allocations: LocalAllocations::new(Box::new(RangeAllocator::new(
                config.ingress_range,
            ))),
            requeued_allocations: HashSet::new(),
            change_handler: Box::new(DefaultChangeHandler),
            persister: Box::new(RetryingPersister::new(
                client,
                config.persist_backoff,
                cancel.clone(),
            )),
            recorder: Box::new(TracingEventRecorder),
            sync_poll_period: config.sync_poll_period,
            cancel,
        };
        (ControllerHandle::new(shared), controller)
    }

    /// 替换变更处理器。
    pub fn with_change_handler(mut self, handler: impl ChangeHandler) -> Self {
        self.change_handler = Box::new(handler);
        self
    }

    /// 替换持久化处理器。
    pub fn with_persister(mut self, persister: impl ServicePersister) -> Self {
        self.persister = Box::new(persister);
        self
    }

    /// 替换事件记录器。
    pub fn with_recorder(mut self, recorder: impl EventRecorder) -> Self {
        self.recorder = Box::new(recorder);
        self
    }

    /// 替换地址分配器。必须在 `run` 之前调用，已记录的分配会被丢弃。
    pub fn with_allocator(mut self, allocator: impl AddressAllocator) -> Self {
        self.allocations = LocalAllocations::new(Box::new(allocator));
        self
    }

    /// 当前的本地分配表。
    pub fn allocations(&self) -> &LocalAllocations {
        &self.allocations
    }

    /// 因地址池耗尽而等待重试的服务数。
    pub fn requeued_allocations(&self) -> usize {
        self.requeued_allocations.len()
    }

    /// 在新任务中运行控制器。
    pub fn spawn(self, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }

    /// 控制器主循环: 等待初始同步，执行同步屏障，然后逐个处理变更直到 `stop` 被取消。
    pub async fn run(mut self, stop: CancellationToken) {
        info!("(Controller) 开始运行");

        // 停止信号: 中断持久化等待并关闭队列，唤醒阻塞的 get
        let watcher = {
            let queue = self.shared.queue.clone();
            let cancel = self.cancel.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                stop.cancelled().await;
                cancel.cancel();
                queue.shut_down();
            })
        };

        let synced = Self::wait_for_sync(&*self.lister, self.sync_poll_period, &stop).await;
        if synced && self.process_initial_sync() {
            info!("(Controller) 开始处理变更");
            while self.work().await {
                if stop.is_cancelled() {
                    break;
                }
            }
        }

        self.shared.queue.shut_down();
        watcher.abort();
        info!(
            "(Controller) 已停止。当前分配数: {}",
            self.allocations.len()
        );
    }

    /// 轮询等待服务快照完成初始同步。被取消时返回 `false`。
    async fn wait_for_sync(
        lister: &dyn ServiceLister,
        poll_period: Duration,
        stop: &CancellationToken,
    ) -> bool {
        loop {
            if lister.has_synced() {
                debug!("(Controller) 服务快照已同步");
                return true;
            }
            tokio::select! {
                _ = stop.cancelled() => {
                    info!("(Controller) 等待初始同步时被停止");
                    return false;
                }
                _ = tokio::time::sleep(poll_period) => {
                    trace!("(Controller) 服务快照尚未同步");
                }
            }
        }
    }

    /// 处理队列中的下一个变更。队列关闭时返回 `false`。
    async fn work(&mut self) -> bool {
        let mut change = match self.shared.queue.get().await {
            Some(change) => change,
            None => return false,
        };
        let id = change.id;

        if change.requeued_allocation {
            // 重置，以便该变更在需要时可以再次重新入队
            change.requeued_allocation = false;
            if let Some(key) = &change.key {
                self.requeued_allocations.remove(key);
            }
        }

        trace!("(Controller) 处理变更 {}: key={:?}", id, change.key);
        let result = {
            let mut ctx = ReconcileContext {
                lister: &*self.lister,
                allocations: &mut self.allocations,
                persister: &*self.persister,
                recorder: &*self.recorder,
            };
            self.change_handler.handle_change(&mut ctx, &change).await
        };

        match result {
            Ok(()) => self.shared.queue.forget(&id),
            Err(e) => self.handle_error(change, e),
        }
        self.shared.queue.done(&id);
        true
    }

    /// 失败变更的重试策略。
    ///
    /// 地址池耗尽时，每个服务最多保留一个等待中的重试，其余变更直接丢弃，
    /// 避免耗尽期间队列无限增长。
    fn handle_error(&mut self, mut change: ServiceChange, err: ControllerError) {
        let id = change.id;
        match &err {
            ControllerError::RangeFull => {
                let key = match change.key.clone() {
                    Some(key) => key,
                    None => {
                        self.shared.queue.forget(&id);
                        return;
                    }
                };
                if self.requeued_allocations.contains(&key) {
                    debug!(
                        "(Controller) 地址池已满，服务 {} 已有等待中的重试，丢弃变更 {}",
                        key, id
                    );
                    self.shared.queue.forget(&id);
                    return;
                }
                change.requeued_allocation = true;
                self.requeued_allocations.insert(key.clone());
                if self.lister.get(&key).is_some() {
                    self.recorder.warning(
                        &key,
                        REASON_RANGE_FULL,
                        &format!("地址池已满，暂时无法为服务 {} 分配 ingress 地址", key),
                    );
                }
                warn!("(Controller) 地址池已满，服务 {} 将稍后重试", key);
            }
            ControllerError::Cancelled => {
                debug!("(Controller) 变更 {} 的处理被取消", id);
            }
            _ => {
                error!("(Controller) 处理变更 {} 失败，将稍后重试: {}", id, err);
            }
        }
        self.shared.queue.add_rate_limited(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::components::address_allocator::FaultyAllocator;
    use crate::controller::components::{
        BackoffConfig, CollectingEventRecorder, IngressRange, PersistTarget, REASON_REALLOCATED,
    };
    use crate::error::AllocatorError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use crate::queue::RateLimiterConfig;
    use crate::store::MemoryStore;
    use crate::types::{ServiceRecord, ServiceType};
    use std::net::Ipv4Addr;
    use std::time::UNIX_EPOCH;

    fn lb(name: &str) -> ServiceRecord {
        ServiceRecord::new("ns", name, name, UNIX_EPOCH, ServiceType::LoadBalancer)
    }

    /// 单地址的地址池，重试延迟足够长，测试期间不会再次到达。
    fn single_address_config() -> ControllerConfig {
        ControllerConfig::new(IngressRange::new(Ipv4Addr::new(10, 1, 0, 5), 1).unwrap())
            .with_rate_limiter(RateLimiterConfig {
                base_delay: Duration::from_secs(3600),
                max_delay: Duration::from_secs(3600),
            })
            .with_persist_backoff(BackoffConfig {
                steps: 2,
                duration: Duration::from_millis(1),
                factor: 1.0,
            })
    }

    fn controller_with_recorder(
        config: ControllerConfig,
    ) -> (
        Arc<MemoryStore>,
        ControllerHandle,
        IngressIpController,
        Arc<CollectingEventRecorder>,
    ) {
        let store = Arc::new(MemoryStore::new());
        let recorder = Arc::new(CollectingEventRecorder::new());
        let (handle, controller) = IngressIpController::new(config, store.clone(), store.clone());
        let controller = controller.with_recorder(recorder.clone());
        (store, handle, controller, recorder)
    }

    async fn drain(controller: &mut IngressIpController) {
        while !controller.shared.queue.is_empty() {
            assert!(controller.work().await);
        }
    }

    #[tokio::test]
    async fn test_exhaustion_backlog_is_bounded() {
        let (store, handle, mut controller, recorder) =
            controller_with_recorder(single_address_config());

        let a = store.create(lb("a"));
        handle.on_add(&a);
        drain(&mut controller).await;
        assert_eq!(
            store.get("ns/a").unwrap().assigned_address(),
            Some("10.1.0.5")
        );

        let b = store.create(lb("b"));
        for _ in 0..100 {
            handle.on_update(&b, &b);
        }
        drain(&mut controller).await;

        assert_eq!(controller.requeued_allocations(), 1);
        assert_eq!(controller.shared.queue.delayed_len(), 1);
        assert_eq!(recorder.count(REASON_RANGE_FULL), 1);
        assert_eq!(store.get("ns/b").unwrap().assigned_address(), None);
        assert!(controller.allocations().is_consistent());
    }

    #[tokio::test]
    async fn test_requeued_allocation_clears_flag() {
        let (store, handle, mut controller, recorder) =
            controller_with_recorder(single_address_config());
        let a = store.create(lb("a"));
        let b = store.create(lb("b"));
        handle.on_add(&a);
        handle.on_add(&b);
        drain(&mut controller).await;
        assert_eq!(controller.requeued_allocations(), 1);

        // 模拟重试到达: 地址已被释放
        let deleted = store.delete("ns/a").unwrap();
        handle.on_delete(&deleted);
        let retry = ServiceChange {
            id: 9999,
            key: Some("ns/b".to_string()),
            old_service: None,
            requeued_allocation: true,
        };
        controller.shared.queue.add(retry);
        drain(&mut controller).await;

        assert_eq!(controller.requeued_allocations(), 0);
        assert_eq!(
            store.get("ns/b").unwrap().assigned_address(),
            Some("10.1.0.5")
        );
        assert_eq!(recorder.count(REASON_RANGE_FULL), 1);
        assert_eq!(recorder.count(REASON_REALLOCATED), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let config = ControllerConfig::from_cidr("10.2.0.0/29")
            .unwrap()
            .with_rate_limiter(RateLimiterConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
            })
            .with_persist_backoff(BackoffConfig {
                steps: 1,
                duration: Duration::from_millis(1),
                factor: 1.0,
            });
        let (store, handle, mut controller, _recorder) = controller_with_recorder(config);
        let a = store.create(lb("a"));
        store.fail_next_writes(1, "超时");
        handle.on_add(&a);

        // 第一次失败，重新入队
        assert!(controller.work().await);
        assert_eq!(store.get("ns/a").unwrap().assigned_address(), None);
        assert!(controller.allocations().is_empty());

        // 退避后重试成功
        let _ = tokio::time::timeout(Duration::from_secs(5), controller.work())
            .await
            .expect("重试应当到达");
        assert_eq!(
            store.get("ns/a").unwrap().assigned_address(),
            Some("10.2.0.1")
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let config = ControllerConfig::from_cidr("10.3.0.0/29")
            .unwrap()
            .with_sync_poll_period(Duration::from_millis(5));
        let (handle, controller) = IngressIpController::new(config, store.clone(), store.clone());
        let stop = CancellationToken::new();
        let task = controller.spawn(stop.clone());

        let a = store.create(lb("a"));
        handle.on_add(&a);
        store.mark_synced();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.get("ns/a").unwrap().assigned_address().is_none() {
            assert!(tokio::time::Instant::now() < deadline, "服务应当获得地址");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("控制器应当停止")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_before_sync() {
        let store = Arc::new(MemoryStore::new());
        let config = ControllerConfig::from_cidr("10.3.0.0/29").unwrap();
        let (_handle, controller) = IngressIpController::new(config, store.clone(), store);
        let stop = CancellationToken::new();
        let task = controller.spawn(stop.clone());
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("控制器应当停止")
            .unwrap();
    }

    /// 每次写入都失败的持久化实现。
    struct UnavailablePersister;

    #[async_trait]
    impl ServicePersister for UnavailablePersister {
        async fn persist(
            &self,
            service: &ServiceRecord,
            _target: PersistTarget,
        ) -> Result<(), ControllerError> {
            Err(ControllerError::Persist {
                key: service.key(),
                message: "存储不可用".to_string(),
            })
        }
    }

    /// 只记录处理顺序的变更处理器。
    #[derive(Clone, Default)]
    struct RecordingHandler {
        seen: Arc<Mutex<Vec<Option<String>>>>,
    }

    #[async_trait]
    impl ChangeHandler for RecordingHandler {
        async fn handle_change(
            &self,
            _ctx: &mut ReconcileContext<'_>,
            change: &ServiceChange,
        ) -> Result<(), ControllerError> {
            self.seen.lock().push(change.key.clone());
            Ok(())
        }
    }

    fn long_retry_config(cidr: &str) -> ControllerConfig {
        ControllerConfig::from_cidr(cidr)
            .unwrap()
            .with_rate_limiter(RateLimiterConfig {
                base_delay: Duration::from_secs(3600),
                max_delay: Duration::from_secs(3600),
            })
    }

    #[tokio::test]
    async fn test_failed_persist_returns_address() {
        let (store, handle, controller, _recorder) =
            controller_with_recorder(long_retry_config("10.4.0.0/29"));
        let mut controller = controller.with_persister(UnavailablePersister);
        let free = controller.allocations().free();

        handle.on_add(&store.create(lb("a")));
        assert!(controller.work().await);

        assert_eq!(controller.allocations().free(), free);
        assert!(controller.allocations().is_empty());
        assert_eq!(controller.shared.queue.delayed_len(), 1);
        assert_eq!(store.get("ns/a").unwrap().assigned_address(), None);
    }

    #[tokio::test]
    async fn test_custom_handler_sees_barrier_order() {
        let (store, handle, controller, _recorder) =
            controller_with_recorder(long_retry_config("10.5.0.0/29"));
        let handler = RecordingHandler::default();
        let mut controller = controller.with_change_handler(handler.clone());

        for (name, age) in &[("young", 30), ("oldest", 10), ("middle", 20)] {
            let service = ServiceRecord::new(
                "ns",
                *name,
                *name,
                UNIX_EPOCH + Duration::from_secs(*age),
                ServiceType::LoadBalancer,
            );
            handle.on_add(&store.create(service));
        }
        assert!(controller.process_initial_sync());
        drain(&mut controller).await;

        let seen: Vec<_> = handler.seen.lock().iter().cloned().flatten().collect();
        assert_eq!(seen, vec!["ns/oldest", "ns/middle", "ns/young"]);
        // 自定义处理器不写入存储
        assert_eq!(store.write_counts().total(), 0);
    }

    #[tokio::test]
    async fn test_allocator_error_is_retried_not_reallocated() {
        let mut allocator = FaultyAllocator::new("10.0.0.0/29");
        allocator.allocate_error = Some(AllocatorError::AlreadyAllocated(Ipv4Addr::new(10, 0, 0, 3)));
        allocator.release_error = Some(AllocatorError::NotAllocated(Ipv4Addr::new(10, 0, 0, 3)));
        let (store, handle, controller, recorder) =
            controller_with_recorder(long_retry_config("10.0.0.0/29"));
        let mut controller = controller.with_allocator(allocator);

        handle.on_add(&store.create(lb("x").with_ingress_ip("10.0.0.3")));
        assert!(controller.work().await);

        assert_eq!(recorder.count(REASON_REALLOCATED), 0);
        assert_eq!(store.write_counts().total(), 0);
        assert_eq!(controller.shared.queue.delayed_len(), 1);
        assert_eq!(
            store.get("ns/x").unwrap().status.ingress,
            vec!["10.0.0.3".to_string()]
        );
        assert!(controller.allocations().is_empty());
    }
}
