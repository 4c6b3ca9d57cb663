//! Ingress 地址分配控制器
//!
//! 从固定的 IPv4 地址池中为负载均衡类型的服务分配 ingress 地址，
//! 并保证同一地址同一时刻最多属于一个服务。
//!
//! 典型用法:
//! 1. 用 `IngressIpController::new` 创建控制器，得到 `ControllerHandle`。
//! 2. 把 watch 通知交给 `ControllerHandle` (`on_add` / `on_update` / `on_delete`
//!    或 `forward_events`)。
//! 3. `IngressIpController::spawn` 启动控制器，取消 `CancellationToken` 停止。

// 声明模块 (Declare modules)
pub mod client;
pub mod config;
pub mod controller;
pub mod defaults;
mod error;
mod handle;
pub mod queue;
pub mod store;
mod types;

// 公开导出需要被外部 (如 main 函数) 使用的类型
pub use client::{ServiceClient, ServiceLister};
pub use config::ControllerConfig;
pub use controller::components::{
    AddressAllocator, BackoffConfig, ChangeHandler, CollectingEventRecorder, EventRecorder,
    IngressRange, LocalAllocations, PersistTarget, ReconcileContext, RecordedEvent,
    ServicePersister, REASON_RANGE_FULL, REASON_REALLOCATED,
};
pub use controller::IngressIpController;
pub use error::{AllocatorError, ControllerError, RangeError};
pub use handle::ControllerHandle;
pub use queue::{ChangeQueue, QueueItem, RateLimiterConfig};
pub use store::{MemoryStore, WriteCounts};
pub use types::{
    ChangeId, ServiceChange, ServiceKey, ServiceRecord, ServiceSpec, ServiceStatus, ServiceType,
    WatchEvent, WriteOutcome,
};

// 方便使用者构造停止信号
pub use tokio_util::sync::CancellationToken;
