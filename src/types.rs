//! 定义库的核心数据结构和类型别名。
//!
//! 这个模块包含了控制器、变更队列和存储之间传递的服务记录 (`ServiceRecord`)、
//! 变更 (`ServiceChange`)、写入结果 (`WriteOutcome`) 以及 watch 事件 (`WatchEvent`)。

use std::time::SystemTime;

// --- 基本类型别名 (Basic Type Aliases) ---

/// 服务的稳定键，格式为 `namespace/name`。
pub type ServiceKey = String;

/// 变更在队列中的唯一标识。
/// 队列按此 ID 去重，并按此 ID 记录失败次数以计算退避时间。
pub type ChangeId = u64;

// --- 服务记录 (Service Record) ---

/// 服务类型。只有 `LoadBalancer` 类型的服务需要 ingress 地址。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    ClusterIp,
    NodePort,
    LoadBalancer,
    ExternalName,
}

/// 服务的期望状态中与地址分配相关的部分。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    /// 服务类型。
    pub service_type: ServiceType,
    /// 用户请求的地址 (提示)。无效或不可用时会被忽略。
    pub load_balancer_ip: Option<String>,
    /// 外部地址列表。当服务持有 ingress 地址时，列表中必须包含该地址。
    pub external_ips: Vec<String>,
}

/// 服务的持久化状态。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStatus {
    /// 已分配的 ingress 地址。只有第一个条目有意义。
    pub ingress: Vec<String>,
}

/// 被调和的服务对象。
///
/// 控制器不拥有服务的身份，只负责其上叠加的地址分配状态
/// (`status.ingress` 以及 `spec.external_ips` 中对应的条目)。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub namespace: String,
    pub name: String,
    /// 全局唯一 ID，用作创建时间相同时的排序依据。
    pub uid: String,
    pub creation_timestamp: SystemTime,
    /// 存储为每次写入分配的版本号，用于冲突检测。
    pub resource_version: u64,
    pub spec: ServiceSpec,
    pub status: ServiceStatus,
}

impl ServiceRecord {
    /// 创建一个新的服务记录 (无状态，版本号为 0)。
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<String>,
        creation_timestamp: SystemTime,
        service_type: ServiceType,
    ) -> Self {
        ServiceRecord {
            namespace: namespace.into(),
            name: name.into(),
            uid: uid.into(),
            creation_timestamp,
            resource_version: 0,
            spec: ServiceSpec {
                service_type,
                load_balancer_ip: None,
                external_ips: Vec::new(),
            },
            status: ServiceStatus::default(),
        }
    }

    /// 设置请求的地址提示 (构建器风格)。
    pub fn with_requested_ip(mut self, ip: impl Into<String>) -> Self {
        self.spec.load_balancer_ip = Some(ip.into());
        self
    }

    /// 设置已分配的地址 (构建器风格)。
    pub fn with_ingress_ip(mut self, ip: impl Into<String>) -> Self {
        self.status.ingress = vec![ip.into()];
        self
    }

    /// 服务的稳定键 `namespace/name`。
    pub fn key(&self) -> ServiceKey {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }

    /// 服务是否需要 ingress 地址。
    pub fn wants_address(&self) -> bool {
        self.spec.service_type == ServiceType::LoadBalancer
    }

    /// 持久化状态中记录的地址 (第一个 ingress 条目)。
    pub fn assigned_address(&self) -> Option<&str> {
        self.status.ingress.first().map(String::as_str)
    }

    /// 用户请求的地址提示。空字符串视为未请求。
    pub fn requested_address(&self) -> Option<&str> {
        self.spec
            .load_balancer_ip
            .as_deref()
            .filter(|ip| !ip.is_empty())
    }

    /// `external_ips` 中是否包含给定地址。
    pub fn has_external_ip(&self, ip: &str) -> bool {
        self.spec.external_ips.iter().any(|existing| existing == ip)
    }
}

// --- 变更 (Change) ---

/// 队列中的一个工作单元：一次 watch 通知或一次合成的重试。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceChange {
    /// 队列标识。重新入队的变更保留原 ID，以便累计退避。
    pub id: ChangeId,
    /// 用于从快照中获取最新状态的键。删除通知没有键。
    pub key: Option<ServiceKey>,
    /// 更新或删除通知携带的旧对象。启动时的 "add" 通知没有旧对象。
    pub old_service: Option<ServiceRecord>,
    /// 是否是因地址池耗尽而重新入队的变更。
    pub requeued_allocation: bool,
}

impl ServiceChange {
    /// 是否为更新或删除通知 (区别于初始同步产生的 "add")。
    pub fn is_update_or_delete(&self) -> bool {
        self.old_service.is_some()
    }
}

// --- 外部接口 (External Interfaces) ---

/// 对象存储写操作的结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Success,
    /// 对象已不存在。后续会收到删除事件。
    NotFound,
    /// 对象在读取后已被修改。后续会收到更新事件。
    Conflict,
    /// 其他 (可能是暂时性的) 错误。
    Other(String),
}

/// watch 流中的一个通知。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(ServiceRecord),
    Updated {
        old: ServiceRecord,
        new: ServiceRecord,
    },
    Deleted(ServiceRecord),
}
