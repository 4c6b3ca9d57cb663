//! 默认配置常量，以及直接可用的默认组件的导出。

use std::time::Duration;

/// 默认的 ingress 地址池。
pub const DEFAULT_INGRESS_CIDR: &str = "172.29.0.0/16";

/// 等待初始同步完成时的轮询间隔。
pub const SYNC_POLL_PERIOD: Duration = Duration::from_millis(100);

/// 持久化重试: 最多尝试次数、第一次重试前的等待时间、等待时间乘数。
pub const CLIENT_RETRY_COUNT: u32 = 5;
pub const CLIENT_RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const CLIENT_RETRY_FACTOR: f64 = 1.1;

/// 队列逐条目退避: 基础延迟与上限。
pub const QUEUE_BASE_DELAY: Duration = Duration::from_millis(5);
pub const QUEUE_MAX_DELAY: Duration = Duration::from_secs(1000);

pub use crate::controller::components::{
    DefaultChangeHandler, RangeAllocator, RetryingPersister, TracingEventRecorder,
};
