//! 定义库中使用的错误类型。
//!
//! 本模块包含三种错误枚举：
//! - `AllocatorError`: 地址池分配器 (`AddressAllocator`) 的操作结果。
//! - `RangeError`: 解析和校验地址池配置 (CIDR) 时的错误。
//! - `ControllerError`: 一次变更处理 (`ChangeHandler::handle_change`) 失败的原因。
//!   Worker 循环根据它决定是重试、限流重试还是丢弃。

use crate::types::ServiceKey;
use std::net::Ipv4Addr;
use thiserror::Error;

/// 地址池分配器返回的错误。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    /// 地址池中已没有空闲地址。
    #[error("地址池已满，没有可分配的地址")]
    Full,

    /// 请求的地址不在配置的地址池范围内。
    #[error("地址 {ip} 不在地址池 {range} 范围内")]
    NotInRange {
        /// 请求的地址。
        ip: Ipv4Addr,
        /// 地址池的文本描述。
        range: String,
    },

    /// 请求的地址已经被分配。
    #[error("地址 {0} 已被分配")]
    AlreadyAllocated(Ipv4Addr),

    /// 尝试释放一个未被分配的地址。
    /// 对分配器自己发出的地址而言，这意味着本地状态已不一致。
    #[error("地址 {0} 当前未被分配，无法释放")]
    NotAllocated(Ipv4Addr),
}

/// 解析或校验地址池配置时的错误。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    /// 文本不是合法的 IPv4 CIDR (例如 `172.29.0.0/16`)。
    #[error("无效的 CIDR '{0}': 必须是合法的 CIDR 表示法 (例如 172.46.0.0/16)")]
    InvalidCidr(String),

    /// 地址族不受支持 (当前只支持 IPv4)。
    #[error("不支持的地址范围 '{0}': 只支持 IPv4")]
    Unsupported(String),

    /// 未指定的网络 (`0.0.0.0/x`) 表示功能关闭，不能作为地址池。
    #[error("地址池 '{0}' 是未指定地址，不能用于分配")]
    Unspecified(String),

    /// 显式构造的地址范围为空或越过了 IPv4 地址空间的末尾。
    #[error("地址范围无效: 起始地址 {first}, 大小 {size}")]
    InvalidSize {
        /// 起始地址。
        first: Ipv4Addr,
        /// 地址数量。
        size: u64,
    },

    /// 地址池与其他网络 (集群网络/服务网络) 重叠。
    #[error("地址池 {range} 与网络 {other} 冲突")]
    Overlaps {
        /// 地址池的文本描述。
        range: String,
        /// 冲突的网络。
        other: String,
    },
}

/// 处理单个变更时可能发生的错误。
///
/// 除 `RangeFull` 外，所有错误都由 Worker 循环按指数退避重新入队；
/// `RangeFull` 受限于每个服务最多一个待重试的变更。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// 地址池耗尽，无法为服务分配地址。
    #[error("地址池已满，没有可分配给服务的 ingress 地址")]
    RangeFull,

    /// 持久化服务的 spec 或 status 在重试耗尽后仍然失败。
    #[error("持久化服务 '{key}' 失败: {message}")]
    Persist {
        /// 相关的服务键。
        key: ServiceKey,
        /// 最后一次失败的原因。
        message: String,
    },

    /// 分配器返回了一个意料之外的错误 (重新分配也无法解决)。
    #[error("服务 '{key}' 的地址分配出现意外错误: {source}")]
    Allocator {
        /// 相关的服务键。
        key: ServiceKey,
        /// 分配器返回的错误。
        #[source]
        source: AllocatorError,
    },

    /// 在退避等待期间收到了停止信号。
    #[error("控制器正在停止，操作已取消")]
    Cancelled,
}

impl ControllerError {
    /// 是否为地址池耗尽错误。
    pub fn is_range_full(&self) -> bool {
        matches!(self, ControllerError::RangeFull)
    }
}
