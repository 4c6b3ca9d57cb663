//! 初始同步屏障
//!
//! 在稳态处理开始之前，把启动时已存在的分配全部记入本地分配表，
//! 并按创建时间重新排列待处理的服务，使冲突的声明以最早创建者为准。

use super::IngressIpController;
use crate::types::{ServiceChange, ServiceRecord};
use std::sync::Arc;
use tracing::{debug, info, trace};

impl IngressIpController {
    /// 处理初始同步产生的变更。队列在排空过程中被关闭时返回 `false`。
    ///
    /// 持有入队锁执行，期间新的通知会等待。
    pub(super) fn process_initial_sync(&mut self) -> bool {
        let shared = Arc::clone(&self.shared);
        let _guard = shared.sync_lock.lock();
        let queue = &shared.queue;

        debug!("(Controller) 开始处理初始同步");

        // 需要地址的服务，排序后重新入队
        let mut pending_services: Vec<ServiceRecord> = Vec::new();
        // 不再需要地址、但仍带有旧分配的服务
        let mut stale_services: Vec<ServiceRecord> = Vec::new();
        // 第一个更新/删除通知及其之后的所有变更，按原顺序重新入队
        let mut pending_changes: Vec<ServiceChange> = Vec::new();

        while let Some(change) = queue.try_get() {
            queue.done(&change.id);
            queue.forget(&change.id);
            if queue.is_shutting_down() {
                info!("(Controller) 初始同步期间队列被关闭");
                return false;
            }

            if change.is_update_or_delete() || !pending_changes.is_empty() {
                pending_changes.push(change);
                continue;
            }

            let service = match change.key.as_deref().and_then(|key| self.lister.get(key)) {
                Some(service) => service,
                None => {
                    trace!("(Controller) 服务 {:?} 已删除，跳过", change.key);
                    continue;
                }
            };

            if service.wants_address() {
                pending_services.push(service);
            } else if service.assigned_address().is_some() {
                stale_services.push(service);
            }
        }

        // 最早创建者优先，UID 打破平局
        pending_services.sort_by(|a, b| {
            a.creation_timestamp
                .cmp(&b.creation_timestamp)
                .then_with(|| a.uid.cmp(&b.uid))
        });

        for service in &pending_services {
            let key = service.key();
            if let Some(ip_string) = service.assigned_address() {
                // 需要重新分配或出错时忽略结果，稍后处理该服务时会再次检查
                let _ = self.allocations.record_local_allocation(&key, ip_string);
            }
            trace!("(Controller) 服务 {} 重新入队", key);
            queue.add(shared.new_change(Some(key), None));
        }
        for service in &stale_services {
            queue.add(shared.new_change(Some(service.key()), None));
        }
        for change in pending_changes {
            queue.add(change);
        }

        info!(
            "(Controller) 初始同步完成: 已记录 {} 个分配，{} 个服务待处理",
            self.allocations.len(),
            pending_services.len() + stale_services.len()
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::controller::IngressIpController;
    use crate::config::ControllerConfig;
    use crate::store::MemoryStore;
    use crate::types::{ServiceRecord, ServiceType};
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::{Duration, UNIX_EPOCH};

    fn service_at(name: &str, age_secs: u64) -> ServiceRecord {
        ServiceRecord::new(
            "ns",
            name,
            name,
            UNIX_EPOCH + Duration::from_secs(age_secs),
            ServiceType::LoadBalancer,
        )
    }

    #[tokio::test]
    async fn test_oldest_claim_is_recorded_and_processed_first() {
        let store = Arc::new(MemoryStore::new());
        let config = ControllerConfig::from_cidr("10.0.0.0/29").unwrap();
        let (handle, mut controller) =
            IngressIpController::new(config, store.clone(), store.clone());

        // 到达顺序与创建时间相反
        let young = store.create(service_at("young", 30).with_ingress_ip("10.0.0.1"));
        let middle = store.create(service_at("middle", 20).with_ingress_ip("10.0.0.1"));
        let oldest = store.create(service_at("oldest", 10).with_ingress_ip("10.0.0.1"));
        handle.on_add(&young);
        handle.on_add(&middle);
        handle.on_add(&oldest);

        assert!(controller.process_initial_sync());
        assert_eq!(
            controller
                .allocations()
                .owner(Ipv4Addr::new(10, 0, 0, 1))
                .map(String::as_str),
            Some("ns/oldest")
        );

        let queue = &controller.shared.queue;
        let order: Vec<_> = std::iter::from_fn(|| queue.try_get())
            .map(|change| change.key.unwrap())
            .collect();
        assert_eq!(order, vec!["ns/oldest", "ns/middle", "ns/young"]);
    }

    #[tokio::test]
    async fn test_post_sync_changes_keep_their_order() {
        let store = Arc::new(MemoryStore::new());
        let config = ControllerConfig::from_cidr("10.0.0.0/29").unwrap();
        let (handle, mut controller) =
            IngressIpController::new(config, store.clone(), store.clone());

        let a = store.create(service_at("a", 1));
        let gone = service_at("gone", 2);
        let plain = store.create(ServiceRecord::new(
            "ns",
            "plain",
            "plain",
            UNIX_EPOCH,
            ServiceType::ClusterIp,
        ));
        let stale = store.create(
            ServiceRecord::new("ns", "stale", "stale", UNIX_EPOCH, ServiceType::NodePort)
                .with_ingress_ip("10.0.0.3"),
        );
        handle.on_add(&a);
        handle.on_add(&gone);
        handle.on_add(&plain);
        handle.on_add(&stale);
        // 第一个更新之后的 add 也视为同步后的变更
        handle.on_update(&a, &a);
        handle.on_add(&plain);

        assert!(controller.process_initial_sync());
        let queue = &controller.shared.queue;
        let changes: Vec<_> = std::iter::from_fn(|| queue.try_get()).collect();
        let summary: Vec<_> = changes
            .iter()
            .map(|change| (change.key.clone().unwrap(), change.is_update_or_delete()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("ns/a".to_string(), false),
                ("ns/stale".to_string(), false),
                ("ns/a".to_string(), true),
                ("ns/plain".to_string(), false),
            ]
        );
        // 不需要地址的旧分配不会被记录
        assert!(controller.allocations().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_barrier() {
        let store = Arc::new(MemoryStore::new());
        let config = ControllerConfig::from_cidr("10.0.0.0/29").unwrap();
        let (handle, mut controller) =
            IngressIpController::new(config, store.clone(), store.clone());
        handle.on_add(&store.create(service_at("a", 1)));
        controller.shared.queue.shut_down();
        assert!(!controller.process_initial_sync());
    }
}
