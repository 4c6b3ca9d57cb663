//! 外部协作者接口。
//!
//! 控制器把远端对象存储视为黑盒:
//! - `ServiceLister`: watch 客户端维护的本地快照 (按键查询，是否完成初始同步)。
//! - `ServiceClient`: 写客户端，返回带类型的写入结果。

use crate::types::{ServiceRecord, WriteOutcome};
use async_trait::async_trait;

/// 按键访问服务快照。
pub trait ServiceLister: Send + Sync + 'static {
    /// 返回服务的当前状态；`None` 表示已删除 (或从未存在)。
    fn get(&self, key: &str) -> Option<ServiceRecord>;

    /// 初始 list 是否已全部投递。
    fn has_synced(&self) -> bool;
}

/// 写入服务的 spec 或 status。
#[async_trait]
pub trait ServiceClient: Send + Sync + 'static {
    /// 更新服务的 spec (`external_ips` 等)。
    async fn update_spec(&self, service: &ServiceRecord) -> WriteOutcome;

    /// 更新服务的 status (`ingress`)。
    async fn update_status(&self, service: &ServiceRecord) -> WriteOutcome;
}
