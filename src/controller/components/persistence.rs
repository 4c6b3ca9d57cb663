//! 持久化模块
//! 定义了持久化服务变更的 Trait (`ServicePersister`) 及其带有限指数退避的默认实现。

use crate::client::ServiceClient;
use crate::error::ControllerError;
use crate::types::{ServiceRecord, WriteOutcome};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 要写入服务的哪一部分。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistTarget {
    Spec,
    Status,
}

/// 有限指数退避参数。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// 最多尝试的次数。
    pub steps: u32,
    /// 第一次重试前的等待时间。
    pub duration: Duration,
    /// 每次重试后等待时间的乘数。
    pub factor: f64,
}

impl BackoffConfig {
    /// 第 `attempt` 次失败 (从 0 开始) 之后的等待时间。
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.duration.mul_f64(self.factor.powi(attempt as i32))
    }
}

/// `ServicePersister` Trait
///
/// 控制器通过它持久化服务的 spec/status。测试中可以替换为记录调用或注入失败的实现。
///
/// 返回 `Ok(())` 并不保证写入生效: 对象不存在或版本冲突时同样返回 `Ok(())`，
/// 由后续的 watch 事件驱动下一次调和。
#[async_trait]
pub trait ServicePersister: Send + Sync + 'static {
    /// 持久化服务的一部分。
    ///
    /// # Arguments
    /// * `service` - 已修改的服务副本 (携带读取时的版本号)。
    /// * `target` - 写入 spec (`external_ips`) 还是 status (`ingress`)。
    ///
    /// # Returns
    /// - `Ok(())`: 写入成功，或因对象已删除/已被修改而放弃。
    /// - `Err(ControllerError::Persist)`: 重试耗尽。
    /// - `Err(ControllerError::Cancelled)`: 控制器正在停止。
    async fn persist(
        &self,
        service: &ServiceRecord,
        target: PersistTarget,
    ) -> Result<(), ControllerError>;
}

/// 带有限指数退避的默认持久化实现。
///
/// - `Success` / `NotFound` / `Conflict`: 结束重试，不报告错误。
/// - `Other`: 按 `BackoffConfig` 退避重试，次数耗尽后返回 `ControllerError::Persist`。
/// - 退避期间收到停止信号时返回 `ControllerError::Cancelled`。
pub struct RetryingPersister<C: ServiceClient> {
    client: Arc<C>,
    backoff: BackoffConfig,
    cancel: CancellationToken,
}

impl<C: ServiceClient> RetryingPersister<C> {
    pub fn new(client: Arc<C>, backoff: BackoffConfig, cancel: CancellationToken) -> Self {
        RetryingPersister {
            client,
            backoff,
            cancel,
        }
    }

    async fn attempt(&self, service: &ServiceRecord, target: PersistTarget) -> WriteOutcome {
        match target {
            PersistTarget::Spec => self.client.update_spec(service).await,
            PersistTarget::Status => self.client.update_status(service).await,
        }
    }
}

#[async_trait]
impl<C: ServiceClient> ServicePersister for RetryingPersister<C> {
    async fn persist(
        &self,
        service: &ServiceRecord,
        target: PersistTarget,
    ) -> Result<(), ControllerError> {
        let key = service.key();
        let mut last_error = String::new();

        for attempt in 0..self.backoff.steps {
            match self.attempt(service, target).await {
                WriteOutcome::Success => return Ok(()),
                WriteOutcome::NotFound => {
                    // 不重新创建已删除的服务，等待删除事件
                    debug!("(Persist) 服务 '{}' 已不存在，放弃持久化 {:?}", key, target);
                    return Ok(());
                }
                WriteOutcome::Conflict => {
                    // 引起版本变化的那次更新会再次触发调和
                    debug!("(Persist) 服务 '{}' 在读取后已被修改，放弃持久化 {:?}", key, target);
                    return Ok(());
                }
                WriteOutcome::Other(message) => {
                    warn!(
                        "(Persist) 持久化服务 '{}' 的 {:?} 失败 (第 {} 次): {}",
                        key,
                        target,
                        attempt + 1,
                        message
                    );
                    last_error = message;
                }
            }

            if attempt + 1 < self.backoff.steps {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(ControllerError::Cancelled),
                    _ = tokio::time::sleep(self.backoff.delay_for(attempt)) => {}
                }
            }
        }

        Err(ControllerError::Persist {
            key,
            message: last_error,
        })
    }
}
