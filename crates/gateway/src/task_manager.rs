use chrono::{Duration as ChronoDuration, Utc};
use courier_broker::{BrokerChannel, WorkerRegistry};
use courier_config::GatewayConfig;
use courier_domain::{
    DispatchRequest, Operation, Task, TaskEvent, TaskStatus, TaskUpdate,
};
use courier_errors::{CourierError, CourierResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::notifier::Notifier;

/// 异步任务编排器
///
/// 受理任务后立即返回句柄，后台把执行请求分发给READY的
/// Worker实例。任务终态具有粘性：Completed/Failed/Expired
/// 一旦写入，迟到的结果与事件一律丢弃。TTL看门狗把超龄的
/// 非终态任务标记为Expired，终态任务在保留期后被清出。
pub struct TaskManager {
    channel: Arc<BrokerChannel>,
    registry: Arc<WorkerRegistry>,
    notifier: Arc<Notifier>,
    tasks: RwLock<HashMap<Uuid, Task>>,
    config: GatewayConfig,
}

impl TaskManager {
    pub fn new(
        channel: Arc<BrokerChannel>,
        registry: Arc<WorkerRegistry>,
        notifier: Arc<Notifier>,
        config: GatewayConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            registry,
            notifier,
            tasks: RwLock::new(HashMap::new()),
            config,
        })
    }

    /// 启动任务事件监听与TTL看门狗
    pub async fn start(self: &Arc<Self>) -> CourierResult<()> {
        self.spawn_event_listener().await?;
        self.spawn_watchdog();
        info!(
            "任务编排器已启动，TTL {}s，保留期 {}s",
            self.config.task_ttl_seconds, self.config.task_retention_seconds
        );
        Ok(())
    }

    /// 受理一个异步任务
    ///
    /// 没有可用Worker时直接拒绝，不入队。
    pub async fn start_task(
        self: &Arc<Self>,
        operation: Operation,
        owner: String,
        payload: Value,
    ) -> CourierResult<Task> {
        if self.registry.eligible().await.is_empty() {
            return Err(CourierError::NoWorkerAvailable);
        }

        let task = Task::new(operation, owner);
        self.tasks.write().await.insert(task.id, task.clone());
        info!("受理任务 {} ({})", task.id, operation);

        self.spawn_dispatch(task.id, operation, payload);
        Ok(task)
    }

    pub async fn get_task(&self, id: Uuid) -> CourierResult<Task> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| CourierError::task_not_found(id.to_string()))
    }

    /// 全部在管任务，按创建时间降序
    pub async fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<_> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// 后台分发：依次尝试可用Worker，忙碌的跳过
    fn spawn_dispatch(self: &Arc<Self>, task_id: Uuid, operation: Operation, payload: Value) {
        let manager = Arc::clone(self);
        let ttl = Duration::from_secs(manager.config.task_ttl_seconds);

        tokio::spawn(async move {
            let request = match serde_json::to_value(DispatchRequest { task_id, payload }) {
                Ok(v) => v,
                Err(e) => {
                    manager
                        .apply_failure(task_id, CourierError::Serialization(e.to_string()))
                        .await;
                    return;
                }
            };

            let candidates = manager.registry.eligible().await;
            let mut last_error = CourierError::NoWorkerAvailable;
            for worker in candidates {
                debug!("任务 {} 分发给Worker '{}'", task_id, worker.instance);
                match manager
                    .channel
                    .request_instance(&worker.instance, operation, request.clone(), Some(ttl))
                    .await
                {
                    Ok(result) => {
                        manager.apply_success(task_id, result).await;
                        return;
                    }
                    Err(CourierError::WorkerBusy { id }) => {
                        debug!("Worker '{}' 忙碌，任务 {} 尝试下一个实例", id, task_id);
                        last_error = CourierError::WorkerBusy { id };
                    }
                    Err(e) => {
                        manager.apply_failure(task_id, e).await;
                        return;
                    }
                }
            }
            manager.apply_failure(task_id, last_error).await;
        });
    }

    async fn apply_success(&self, task_id: Uuid, result: Value) {
        let update = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(&task_id) else {
                debug!("任务 {} 已被清出，结果丢弃", task_id);
                return;
            };
            if task.status.is_terminal() {
                debug!("任务 {} 已是终态 {:?}，迟到的结果丢弃", task_id, task.status);
                return;
            }
            task.status = TaskStatus::Completed;
            task.result = Some(result);
            task.updated_at = Utc::now();
            TaskUpdate::from_task(task)
        };
        info!("任务 {} 完成", task_id);
        self.notifier.push(&update).await;
    }

    async fn apply_failure(&self, task_id: Uuid, error: CourierError) {
        // RPC超时即任务超龄，归入Expired而非Failed
        let expired = matches!(error, CourierError::Timeout(_));
        let update = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(&task_id) else {
                debug!("任务 {} 已被清出，错误丢弃", task_id);
                return;
            };
            if task.status.is_terminal() {
                debug!("任务 {} 已是终态 {:?}，迟到的错误丢弃", task_id, task.status);
                return;
            }
            if expired {
                task.status = TaskStatus::Expired;
            } else {
                task.status = TaskStatus::Failed;
                task.error = Some(error.to_string());
            }
            task.updated_at = Utc::now();
            TaskUpdate::from_task(task)
        };
        warn!("任务 {} 失败: {}", task_id, error);
        self.notifier.push(&update).await;
    }

    /// 消费Worker发布的Started/Progress事件
    async fn spawn_event_listener(self: &Arc<Self>) -> CourierResult<()> {
        let mut events = self.channel.subscribe_task_events().await?;
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                manager.on_task_event(event).await;
            }
            info!("任务事件流关闭，监听退出");
        });

        Ok(())
    }

    async fn on_task_event(&self, event: TaskEvent) {
        let task_id = event.task_id();
        let update = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(&task_id) else {
                debug!("收到未知任务 {} 的事件，忽略", task_id);
                return;
            };
            if task.status.is_terminal() {
                debug!("任务 {} 已是终态，事件忽略", task_id);
                return;
            }

            match event {
                TaskEvent::Started { worker, .. } => {
                    debug!("任务 {} 由Worker '{}' 开始执行", task_id, worker);
                    task.status = TaskStatus::Running;
                }
                TaskEvent::Progress { payload, .. } => {
                    task.progress = Some(payload);
                    // 进度事件先于Started到达时同样视为已开始
                    if task.status == TaskStatus::Queued {
                        task.status = TaskStatus::Running;
                    }
                }
            }
            task.updated_at = Utc::now();
            TaskUpdate::from_task(task)
        };
        self.notifier.push(&update).await;
    }

    /// TTL看门狗：过期标记与终态清出
    fn spawn_watchdog(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let period = Duration::from_secs(self.config.sweep_interval_seconds);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.sweep().await;
            }
        });
    }

    async fn sweep(&self) {
        let ttl = ChronoDuration::seconds(self.config.task_ttl_seconds as i64);
        let retention = ChronoDuration::seconds(self.config.task_retention_seconds as i64);
        let now = Utc::now();

        let mut expired_updates = Vec::new();
        {
            let mut tasks = self.tasks.write().await;
            for task in tasks.values_mut() {
                if !task.status.is_terminal() && now - task.created_at > ttl {
                    warn!("任务 {} 超过TTL，标记为Expired", task.id);
                    task.status = TaskStatus::Expired;
                    task.updated_at = now;
                    expired_updates.push(TaskUpdate::from_task(task));
                }
            }

            let evictable: Vec<Uuid> = tasks
                .values()
                .filter(|t| t.status.is_terminal() && now - t.updated_at > retention)
                .map(|t| t.id)
                .collect();
            for id in evictable {
                tasks.remove(&id);
                debug!("任务 {} 超过保留期，已清出", id);
            }
        }

        for update in expired_updates {
            self.notifier.push(&update).await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn insert_task(&self, task: Task) {
        self.tasks.write().await.insert(task.id, task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_broker::{FnHandler, InMemoryBus, MessageBus};
    use courier_domain::ApplicationStatus;
    use courier_domain::StateReport;
    use serde_json::json;

    fn test_config(ttl: u64, retention: u64, sweep: u64) -> GatewayConfig {
        GatewayConfig {
            enabled: true,
            bind_address: "127.0.0.1:0".to_string(),
            environment: "testnet".to_string(),
            cors_enabled: false,
            max_request_size_mb: 1,
            task_ttl_seconds: ttl,
            task_retention_seconds: retention,
            sweep_interval_seconds: sweep,
        }
    }

    struct Harness {
        bus: Arc<InMemoryBus>,
        gateway: Arc<BrokerChannel>,
        worker: Arc<BrokerChannel>,
        registry: Arc<WorkerRegistry>,
        notifier: Arc<Notifier>,
    }

    impl Harness {
        async fn worker_channel(&self, instance: &str) -> Arc<BrokerChannel> {
            BrokerChannel::new(
                self.bus.clone() as Arc<dyn MessageBus>,
                "courier",
                instance,
                Duration::from_secs(5),
            )
            .await
            .unwrap()
        }
    }

    async fn setup() -> Harness {
        let bus = Arc::new(InMemoryBus::new());
        let gateway = BrokerChannel::new(
            bus.clone() as Arc<dyn MessageBus>,
            "courier",
            "gateway-1",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let worker = BrokerChannel::new(
            bus.clone() as Arc<dyn MessageBus>,
            "courier",
            "worker-1",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        Harness {
            bus,
            gateway,
            worker,
            registry: WorkerRegistry::new(Duration::from_secs(90)),
            notifier: Notifier::new(),
        }
    }

    async fn mark_ready(registry: &Arc<WorkerRegistry>, instance: &str) {
        registry
            .observe(StateReport {
                instance: instance.to_string(),
                status: ApplicationStatus::Ready,
                timestamp: Utc::now(),
            })
            .await;
    }

    #[tokio::test]
    async fn test_task_completes_and_notifies() {
        let h = setup().await;
        mark_ready(&h.registry, "worker-1").await;

        h.worker
            .respond_instance(
                "worker-1",
                Operation::IssueCredential,
                Arc::new(FnHandler(|payload: Value| async move {
                    let req: DispatchRequest = serde_json::from_value(payload).unwrap();
                    // 留出订阅推送的时间窗口
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(json!({"credentialFor": req.task_id}))
                })),
            )
            .await
            .unwrap();

        let manager = TaskManager::new(
            Arc::clone(&h.gateway),
            Arc::clone(&h.registry),
            Arc::clone(&h.notifier),
            test_config(300, 60, 300),
        );
        manager.start().await.unwrap();

        let task = manager
            .start_task(Operation::IssueCredential, "userA".to_string(), json!({}))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Queued);

        let (conn, mut rx) = h.notifier.register().await;
        h.notifier.subscribe(conn, task.id).await;

        let update = rx.recv().await.unwrap();
        assert_eq!(update.status, TaskStatus::Completed);
        assert_eq!(
            update.result.unwrap()["credentialFor"],
            serde_json::to_value(task.id).unwrap()
        );

        let stored = manager.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_no_worker_available_is_rejected() {
        let h = setup().await;
        let manager = TaskManager::new(
            Arc::clone(&h.gateway),
            Arc::clone(&h.registry),
            Arc::clone(&h.notifier),
            test_config(300, 60, 300),
        );

        let err = manager
            .start_task(Operation::IssueCredential, "userA".to_string(), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::NoWorkerAvailable));
        assert_eq!(manager.task_count().await, 0);
    }

    #[tokio::test]
    async fn test_busy_worker_fails_over_to_next() {
        let h = setup().await;
        mark_ready(&h.registry, "worker-1").await;
        mark_ready(&h.registry, "worker-2").await;

        // worker-1忙碌拒绝，worker-2正常完成
        h.worker
            .respond_instance(
                "worker-1",
                Operation::IssueCredential,
                Arc::new(FnHandler(|_| async move {
                    Err::<Value, _>(CourierError::WorkerBusy {
                        id: "worker-1".to_string(),
                    })
                })),
            )
            .await
            .unwrap();
        let worker2 = h.worker_channel("worker-2").await;
        worker2
            .respond_instance(
                "worker-2",
                Operation::IssueCredential,
                Arc::new(FnHandler(|_| async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(json!("issued"))
                })),
            )
            .await
            .unwrap();

        let manager = TaskManager::new(
            Arc::clone(&h.gateway),
            Arc::clone(&h.registry),
            Arc::clone(&h.notifier),
            test_config(300, 60, 300),
        );
        manager.start().await.unwrap();

        let task = manager
            .start_task(Operation::IssueCredential, "userA".to_string(), json!({}))
            .await
            .unwrap();

        let (conn, mut rx) = h.notifier.register().await;
        h.notifier.subscribe(conn, task.id).await;
        let update = rx.recv().await.unwrap();
        assert_eq!(update.status, TaskStatus::Completed);
        assert_eq!(update.result.unwrap(), json!("issued"));
    }

    #[tokio::test]
    async fn test_worker_failure_marks_task_failed() {
        let h = setup().await;
        mark_ready(&h.registry, "worker-1").await;

        h.worker
            .respond_instance(
                "worker-1",
                Operation::SendTransaction,
                Arc::new(FnHandler(|_| async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Err::<Value, _>(CourierError::TransientExhausted(
                        "2 次尝试后仍失败".to_string(),
                    ))
                })),
            )
            .await
            .unwrap();

        let manager = TaskManager::new(
            Arc::clone(&h.gateway),
            Arc::clone(&h.registry),
            Arc::clone(&h.notifier),
            test_config(300, 60, 300),
        );
        manager.start().await.unwrap();

        let task = manager
            .start_task(Operation::SendTransaction, "userA".to_string(), json!({}))
            .await
            .unwrap();

        let (conn, mut rx) = h.notifier.register().await;
        h.notifier.subscribe(conn, task.id).await;
        let update = rx.recv().await.unwrap();
        assert_eq!(update.status, TaskStatus::Failed);
        assert!(update.error.unwrap().contains("重试次数耗尽"));
    }

    #[tokio::test]
    async fn test_events_promote_and_terminal_is_sticky() {
        let h = setup().await;
        let manager = TaskManager::new(
            Arc::clone(&h.gateway),
            Arc::clone(&h.registry),
            Arc::clone(&h.notifier),
            test_config(300, 60, 300),
        );
        manager.start().await.unwrap();

        let task = Task::new(Operation::IssueCredential, "userA".to_string());
        let task_id = task.id;
        manager.insert_task(task).await;

        h.worker
            .publish_task_event(&TaskEvent::Started {
                task_id,
                worker: "worker-1".to_string(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            manager.get_task(task_id).await.unwrap().status,
            TaskStatus::Running
        );

        h.worker
            .publish_task_event(&TaskEvent::Progress {
                task_id,
                payload: json!({"step": "2/3"}),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stored = manager.get_task(task_id).await.unwrap();
        assert_eq!(stored.progress.unwrap()["step"], "2/3");

        // 写入终态后事件不再生效
        manager.apply_success(task_id, json!("done")).await;
        h.worker
            .publish_task_event(&TaskEvent::Progress {
                task_id,
                payload: json!({"step": "3/3"}),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stored = manager.get_task(task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.progress.unwrap()["step"], "2/3");
    }

    #[tokio::test]
    async fn test_watchdog_expires_and_evicts() {
        let h = setup().await;
        let manager = TaskManager::new(
            Arc::clone(&h.gateway),
            Arc::clone(&h.registry),
            Arc::clone(&h.notifier),
            test_config(1, 1, 1),
        );
        manager.start().await.unwrap();

        let task = Task::new(Operation::IssueCredential, "userA".to_string());
        let task_id = task.id;
        manager.insert_task(task).await;

        // TTL 1s后过期
        tokio::time::sleep(Duration::from_millis(2200)).await;
        assert_eq!(
            manager.get_task(task_id).await.unwrap().status,
            TaskStatus::Expired
        );

        // 保留期1s后清出
        tokio::time::sleep(Duration::from_millis(2200)).await;
        assert!(matches!(
            manager.get_task(task_id).await.unwrap_err(),
            CourierError::TaskNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_late_result_after_expiry_is_discarded() {
        let h = setup().await;
        let manager = TaskManager::new(
            Arc::clone(&h.gateway),
            Arc::clone(&h.registry),
            Arc::clone(&h.notifier),
            test_config(1, 300, 1),
        );
        manager.start().await.unwrap();

        let task = Task::new(Operation::IssueCredential, "userA".to_string());
        let task_id = task.id;
        manager.insert_task(task).await;

        tokio::time::sleep(Duration::from_millis(2200)).await;
        assert_eq!(
            manager.get_task(task_id).await.unwrap().status,
            TaskStatus::Expired
        );

        // 迟到的成功结果不再改变终态
        manager.apply_success(task_id, json!("late")).await;
        let stored = manager.get_task(task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Expired);
        assert!(stored.result.is_none());
    }
}
