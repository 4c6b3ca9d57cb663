//! 控制器配置。

use crate::controller::components::{BackoffConfig, IngressRange};
use crate::defaults;
use crate::error::RangeError;
use crate::queue::RateLimiterConfig;
use std::time::Duration;

/// 控制器的全部可调参数。
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// 可分配的地址池。
    pub ingress_range: IngressRange,
    /// 持久化 spec/status 的退避参数。
    pub persist_backoff: BackoffConfig,
    /// 失败变更重新入队的退避参数。
    pub rate_limiter: RateLimiterConfig,
    /// 等待初始同步完成时的轮询间隔。
    pub sync_poll_period: Duration,
}

impl ControllerConfig {
    /// 使用给定地址池和默认参数。
    pub fn new(ingress_range: IngressRange) -> Self {
        ControllerConfig {
            ingress_range,
            persist_backoff: BackoffConfig {
                steps: defaults::CLIENT_RETRY_COUNT,
                duration: defaults::CLIENT_RETRY_INTERVAL,
                factor: defaults::CLIENT_RETRY_FACTOR,
            },
            rate_limiter: RateLimiterConfig {
                base_delay: defaults::QUEUE_BASE_DELAY,
                max_delay: defaults::QUEUE_MAX_DELAY,
            },
            sync_poll_period: defaults::SYNC_POLL_PERIOD,
        }
    }

    /// 从 CIDR 文本构造。
    pub fn from_cidr(cidr: &str) -> Result<Self, RangeError> {
        Ok(Self::new(IngressRange::from_cidr(cidr)?))
    }

    pub fn with_persist_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.persist_backoff = backoff;
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiterConfig) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn with_sync_poll_period(mut self, period: Duration) -> Self {
        self.sync_poll_period = period;
        self
    }

    /// 校验地址池不与集群网络、服务网络等其他网络重叠。
    pub fn validate_against(&self, other_networks: &[&str]) -> Result<(), RangeError> {
        for other in other_networks {
            if self.ingress_range.overlaps(other)? {
                return Err(RangeError::Overlaps {
                    range: self.ingress_range.to_string(),
                    other: other.to_string(),
                });
            }
        }
        Ok(())
    }
}
