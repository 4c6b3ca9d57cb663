//! 事件记录模块
//! 控制器通过 `EventRecorder` 发出面向运维的警告 (地址池耗尽、地址被重新分配)。

use parking_lot::Mutex;
use tracing::warn;

/// 地址池耗尽时的事件原因。
pub const REASON_RANGE_FULL: &str = "IngressIPRangeFull";
/// 服务的地址被重新分配时的事件原因。
pub const REASON_REALLOCATED: &str = "IngressIPReallocated";

/// 一条已记录的警告事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub key: String,
    pub reason: String,
    pub message: String,
}

/// `EventRecorder` Trait
pub trait EventRecorder: Send + Sync + 'static {
    /// 为服务记录一条警告事件。
    fn warning(&self, key: &str, reason: &str, message: &str);
}

/// 默认实现: 以结构化日志输出事件。
pub struct TracingEventRecorder;

impl EventRecorder for TracingEventRecorder {
    fn warning(&self, key: &str, reason: &str, message: &str) {
        warn!(service = key, reason = reason, "(Event) {}", message);
    }
}

/// 在内存中收集事件，同时输出日志。用于测试和演示程序。
#[derive(Default)]
pub struct CollectingEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl CollectingEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已收集事件的副本。
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// 给定原因的事件数量。
    pub fn count(&self, reason: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.reason == reason)
            .count()
    }
}

impl EventRecorder for CollectingEventRecorder {
    fn warning(&self, key: &str, reason: &str, message: &str) {
        TracingEventRecorder.warning(key, reason, message);
        self.events.lock().push(RecordedEvent {
            key: key.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

/// 共享的收集器同样可以作为记录器注入，测试保留另一份引用用于断言。
impl<R: EventRecorder> EventRecorder for std::sync::Arc<R> {
    fn warning(&self, key: &str, reason: &str, message: &str) {
        (**self).warning(key, reason, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_collecting_recorder() {
        let recorder = Arc::new(CollectingEventRecorder::new());
        let shared: Box<dyn EventRecorder> = Box::new(recorder.clone());
        shared.warning("ns/a", REASON_RANGE_FULL, "没有可用地址");
        shared.warning("ns/b", REASON_REALLOCATED, "地址冲突");
        assert_eq!(recorder.count(REASON_RANGE_FULL), 1);
        assert_eq!(recorder.events()[1].key, "ns/b");
    }
}
