//! 变更处理模块
//!
//! 定义了 `ChangeHandler` Trait 及其默认实现 `DefaultChangeHandler`。
//! 默认实现比较服务的旧/新状态，决定分配、重新分配、释放或什么都不做，
//! 并驱动本地分配表和持久化。
//!
//! 持久化顺序约束: 一个 ingress 地址只有在 status 确认它时才能出现在
//! `external_ips` 中，所以清除时先写 spec 再写 status，分配时先写 status 再写 spec。

use crate::client::ServiceLister;
use crate::controller::components::event_recorder::{EventRecorder, REASON_REALLOCATED};
use crate::controller::components::local_allocations::{LocalAllocations, RecordOutcome};
use crate::controller::components::persistence::{PersistTarget, ServicePersister};
use crate::error::{AllocatorError, ControllerError};
use crate::types::{ServiceChange, ServiceRecord};
use async_trait::async_trait;
use tracing::{debug, trace, warn};

/// 处理一次变更所需的全部协作者。
///
/// 由 Worker 循环在每次处理前组装，`ChangeHandler` 不持有任何控制器状态。
pub struct ReconcileContext<'a> {
    pub lister: &'a dyn ServiceLister,
    pub allocations: &'a mut LocalAllocations,
    pub persister: &'a dyn ServicePersister,
    pub recorder: &'a dyn EventRecorder,
}

/// `ChangeHandler` Trait
///
/// 对一次服务变更作出响应，同步该服务的本地与持久化分配状态。
/// 返回的错误由 Worker 循环决定如何重试；`ControllerError::RangeFull` 会被特殊处理。
#[async_trait]
pub trait ChangeHandler: Send + Sync + 'static {
    /// 处理一次变更。
    ///
    /// # Arguments
    /// * `ctx` - 本次处理可用的快照、本地分配表、持久化与事件记录器。
    /// * `change` - 队列取出的变更；`key` 为 `None` 表示删除通知，此时只有 `old_service`。
    ///
    /// # Returns
    /// - `Ok(())`: 服务已同步 (或无需处理)，Worker 清除该变更的退避记录。
    /// - `Err(ControllerError::RangeFull)`: 地址池耗尽，每个服务最多保留一个重试。
    /// - 其他错误: 变更按退避重新入队。
    async fn handle_change(
        &self,
        ctx: &mut ReconcileContext<'_>,
        change: &ServiceChange,
    ) -> Result<(), ControllerError>;
}

/// 默认的变更处理器。
pub struct DefaultChangeHandler;

#[async_trait]
impl ChangeHandler for DefaultChangeHandler {
    async fn handle_change(
        &self,
        ctx: &mut ReconcileContext<'_>,
        change: &ServiceChange,
    ) -> Result<(), ControllerError> {
        let service = change.key.as_deref().and_then(|key| ctx.lister.get(key));

        clear_old_allocation(ctx, service.as_ref(), change.old_service.as_ref());

        let service = match service {
            Some(service) => service,
            None => {
                trace!("(Controller) 服务已删除，无需进一步处理");
                return Ok(());
            }
        };
        let key = service.key();

        match (service.wants_address(), service.assigned_address().is_some()) {
            (true, true) => record_allocation(ctx, &service, &key).await,
            (true, false) => allocate(ctx, service.clone(), &key).await,
            (false, true) => deallocate(ctx, &service, &key).await,
            (false, false) => Ok(()),
        }
    }
}

/// 旧对象持有的地址与新对象不同时 (更新或删除)，释放旧地址。
/// 返回是否释放了地址。
fn clear_old_allocation(
    ctx: &mut ReconcileContext<'_>,
    new: Option<&ServiceRecord>,
    old: Option<&ServiceRecord>,
) -> bool {
    let old = match old.filter(|old| old.wants_address()) {
        Some(old) => old,
        None => return false,
    };
    let old_ip = match old.assigned_address() {
        Some(ip) => ip,
        None => return false,
    };
    let new_ip = new
        .filter(|new| new.wants_address())
        .and_then(ServiceRecord::assigned_address);
    if new_ip == Some(old_ip) {
        return false;
    }
    // 新对象可能已不存在，使用旧对象的键
    ctx.allocations.clear_local_allocation(&old.key(), old_ip)
}

/// 记录 status 中的地址，并确保它出现在 `external_ips` 中。
/// 地址因任何原因无效时重新分配。
async fn record_allocation(
    ctx: &mut ReconcileContext<'_>,
    service: &ServiceRecord,
    key: &str,
) -> Result<(), ControllerError> {
    // 只看第一个 ingress 地址
    let ip_string = service.assigned_address().unwrap_or_default().to_string();

    match ctx.allocations.record_local_allocation(key, &ip_string) {
        RecordOutcome::Recorded => {
            let mut service = service.clone();
            ensure_external_ip(ctx, &mut service, key, &ip_string).await
        }
        RecordOutcome::Reallocate(reason) => {
            ctx.recorder.warning(key, REASON_REALLOCATED, &reason);
            let mut service = service.clone();
            clear_persisted_allocation(ctx, &mut service, key, Some(&reason)).await?;
            allocate(ctx, service, key).await
        }
        RecordOutcome::Unexpected(source) => Err(ControllerError::Allocator {
            key: key.to_string(),
            source,
        }),
    }
}

/// 为服务分配一个地址并持久化其 status。
async fn allocate(
    ctx: &mut ReconcileContext<'_>,
    mut service: ServiceRecord,
    key: &str,
) -> Result<(), ControllerError> {
    let ip = ctx
        .allocations
        .allocate_ip(service.requested_address())
        .map_err(|e| match e {
            AllocatorError::Full => ControllerError::RangeFull,
            source => ControllerError::Allocator {
                key: key.to_string(),
                source,
            },
        })?;
    let ip_string = ip.to_string();

    debug!("(Controller) 为服务 {} 分配地址 {}", key, ip_string);
    service.status.ingress = vec![ip_string.clone()];
    if let Err(e) = ctx.persister.persist(&service, PersistTarget::Status).await {
        // 持久化失败时归还地址，避免泄漏
        ctx.allocations.release_ip(ip);
        return Err(e);
    }
    // Conflict/NotFound 也返回 Ok，此时 status 并未写入: 地址仍被提交，
    // 下一次处理会为该服务再分配一个地址，这个地址在进程存活期间无法回收。
    ctx.allocations.commit(ip, key);

    ensure_external_ip(ctx, &mut service, key, &ip_string).await
}

/// 清除服务的持久化分配，然后释放本地分配。
async fn deallocate(
    ctx: &mut ReconcileContext<'_>,
    service: &ServiceRecord,
    key: &str,
) -> Result<(), ControllerError> {
    debug!("(Controller) 清除服务 {} 的分配状态", key);
    // 在从服务中移除之前取出地址
    let ip_string = service.assigned_address().unwrap_or_default().to_string();

    let mut service = service.clone();
    clear_persisted_allocation(ctx, &mut service, key, None).await?;

    ctx.allocations.clear_local_allocation(key, &ip_string);
    Ok(())
}

/// 从 `external_ips` 中移除 ingress 地址 (先写 spec)，再清空 status。
async fn clear_persisted_allocation(
    ctx: &mut ReconcileContext<'_>,
    service: &mut ServiceRecord,
    key: &str,
    reason: Option<&str>,
) -> Result<(), ControllerError> {
    match reason {
        Some(reason) => warn!("(Controller) {}", reason),
        None => debug!("(Controller) 尝试清除服务 {} 的持久化分配", key),
    }

    if let Some(ingress_ip) = service.assigned_address().map(str::to_string) {
        if let Some(pos) = service
            .spec
            .external_ips
            .iter()
            .position(|ip| *ip == ingress_ip)
        {
            debug!("(Controller) 从服务 {} 的外部地址中移除 {}", key, ingress_ip);
            service.spec.external_ips.remove(pos);
            ctx.persister.persist(service, PersistTarget::Spec).await?;
        }
    }

    debug!("(Controller) 清空服务 {} 的 ingress 状态", key);
    service.status.ingress.clear();
    ctx.persister.persist(service, PersistTarget::Status).await
}

/// 确保 ingress 地址出现在服务的 `external_ips` 中 (缺失时追加并持久化 spec)。
async fn ensure_external_ip(
    ctx: &mut ReconcileContext<'_>,
    service: &mut ServiceRecord,
    key: &str,
    ingress_ip: &str,
) -> Result<(), ControllerError> {
    if service.has_external_ip(ingress_ip) {
        trace!("(Controller) 服务 {} 的外部地址已包含 {}", key, ingress_ip);
        return Ok(());
    }
    debug!("(Controller) 将 {} 添加为服务 {} 的外部地址", ingress_ip, key);
    service.spec.external_ips.push(ingress_ip.to_string());
    ctx.persister.persist(service, PersistTarget::Spec).await
}
