//! 控制器核心组件的定义与导出
//!
//! 这个模块声明了构成 `IngressIpController` 核心功能的各个组件，
//! 并重新导出它们的 Trait 和默认实现，方便外部使用。
//!
//! 主要内容包括：
//! - `address_allocator`: 地址池与 `AddressAllocator` Trait。
//! - `local_allocations`: 地址到服务的本地分配表。
//! - `persistence`: 带重试的持久化 (`ServicePersister` Trait)。
//! - `event_recorder`: 面向运维的警告事件 (`EventRecorder` Trait)。
//! - `change_handler`: 单个变更的同步逻辑 (`ChangeHandler` Trait)。

// --- 子模块声明 ---
pub mod address_allocator;
pub mod change_handler;
pub mod event_recorder;
pub mod local_allocations;
pub mod persistence;

// --- 公开导出子模块中的关键 Trait 和默认实现 ---
pub use address_allocator::{AddressAllocator, IngressRange, RangeAllocator};
pub use change_handler::{ChangeHandler, DefaultChangeHandler, ReconcileContext};
pub use event_recorder::{
    CollectingEventRecorder, EventRecorder, RecordedEvent, TracingEventRecorder,
    REASON_RANGE_FULL, REASON_REALLOCATED,
};
pub use local_allocations::{LocalAllocations, RecordOutcome};
pub use persistence::{BackoffConfig, PersistTarget, RetryingPersister, ServicePersister};
