//! 主程序入口和示例用法演示
//!
//! 这个示例在进程内存储上运行控制器，演示:
//! 1. 启动前已存在的服务在初始同步后获得地址。
//! 2. 地址池耗尽时记录警告事件，新服务等待。
//! 3. 服务删除后释放的地址被等待中的服务获得。
//! 4. 暂时性的存储写入失败被重试。
//! 5. 取消停止信号后控制器退出。

use futures::stream;
use ingress_ip::{
    BackoffConfig, CancellationToken, CollectingEventRecorder, ControllerConfig,
    IngressIpController, MemoryStore, ServiceLister, ServiceRecord, ServiceType,
    REASON_RANGE_FULL, REASON_REALLOCATED,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// 轮询直到条件满足或超时。
async fn wait_until<F>(description: &str, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            warn!("等待超时: {}", description);
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}

fn load_balancer(name: &str, uid: &str) -> ServiceRecord {
    ServiceRecord::new(
        "demo",
        name,
        uid,
        SystemTime::now(),
        ServiceType::LoadBalancer,
    )
}

fn address_of(store: &MemoryStore, key: &str) -> Option<String> {
    store
        .get(key)
        .and_then(|service| service.assigned_address().map(str::to_string))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // --- 初始化日志系统 ---
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("设置全局日志 subscriber 失败");

    info!("========================================================");
    info!("启动 ingress 地址分配控制器示例");
    info!("========================================================");

    // --- 配置参数 ---
    // /30 只有两个可用地址
    let config = ControllerConfig::from_cidr("10.0.0.0/30")?.with_persist_backoff(BackoffConfig {
        steps: 3,
        duration: Duration::from_millis(50),
        factor: 2.0,
    });
    config.validate_against(&["10.128.0.0/14", "172.30.0.0/16"])?;
    info!("配置: {:?}", config);

    let store = Arc::new(MemoryStore::new());
    let recorder = Arc::new(CollectingEventRecorder::new());
    let (handle, controller) = IngressIpController::new(config, store.clone(), store.clone());
    let controller = controller.with_recorder(recorder.clone());

    // --- watch 事件转发 ---
    let events = store.subscribe();
    let forwarder = {
        let handle = handle.clone();
        tokio::spawn(async move {
            let events = stream::unfold(events, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            });
            handle.forward_events(events).await
        })
    };

    // --- 启动前已存在的服务 ---
    store.create(load_balancer("x", "uid-x"));
    store.create(load_balancer("y", "uid-y"));
    store.mark_synced();

    let stop = CancellationToken::new();
    let controller_task = controller.spawn(stop.clone());

    wait_until("x 和 y 获得地址", || {
        address_of(&store, "demo/x").is_some() && address_of(&store, "demo/y").is_some()
    })
    .await;
    info!(
        "x -> {:?}, y -> {:?}",
        address_of(&store, "demo/x"),
        address_of(&store, "demo/y")
    );

    // --- 地址池耗尽 ---
    store.create(load_balancer("z", "uid-z"));
    wait_until("地址池耗尽事件", || recorder.count(REASON_RANGE_FULL) > 0).await;
    info!("z -> {:?} (地址池已满)", address_of(&store, "demo/z"));

    // --- 删除 x，z 获得释放的地址 ---
    // 让下一次写入失败一次，演示持久化重试
    store.fail_next_writes(1, "模拟的暂时性存储错误");
    store.delete("demo/x");
    // 耗尽重试的退避最短为 5ms，逐次翻倍
    wait_until("z 获得地址", || address_of(&store, "demo/z").is_some()).await;
    info!("z -> {:?}", address_of(&store, "demo/z"));

    // --- 停止 ---
    stop.cancel();
    controller_task.await?;
    forwarder.abort();

    info!("========================================================");
    for service in store.list() {
        info!(
            "{} -> status={:?}, external_ips={:?}",
            service.key(),
            service.status.ingress,
            service.spec.external_ips
        );
    }
    info!(
        "事件: 地址池耗尽 {} 次, 重新分配 {} 次",
        recorder.count(REASON_RANGE_FULL),
        recorder.count(REASON_REALLOCATED)
    );
    let writes = store.write_counts();
    info!("控制器写入: spec {} 次, status {} 次", writes.spec, writes.status);
    info!("========================================================");
    Ok(())
}
