use async_trait::async_trait;
use chrono::Utc;
use courier_broker::{BrokerChannel, RequestHandler, StateReporter};
use courier_config::WorkerConfig;
use courier_domain::{ApplicationStatus, DispatchRequest, Operation, TaskEvent};
use courier_errors::{CourierError, CourierResult};
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::executors::{ExecutionContext, OperationExecutor};

/// 生成实例通道名
///
/// 配置了instance_id时原样使用，否则用主机名加随机token拼出
/// 全网唯一的名字。
pub fn resolve_instance_id(config: &WorkerConfig) -> String {
    if !config.instance_id.is_empty() {
        return config.instance_id.clone();
    }
    let host = hostname::get()
        .unwrap_or_else(|_| "unknown".into())
        .to_string_lossy()
        .to_string();
    format!("worker.{}-{}", host, Uuid::new_v4().simple())
}

/// Worker服务构建器
pub struct WorkerServiceBuilder {
    channel: Arc<BrokerChannel>,
    config: WorkerConfig,
    executors: HashMap<Operation, Arc<dyn OperationExecutor>>,
}

impl WorkerServiceBuilder {
    pub fn new(channel: Arc<BrokerChannel>, config: WorkerConfig) -> Self {
        Self {
            channel,
            config,
            executors: HashMap::new(),
        }
    }

    /// 注册操作执行器
    pub fn register_executor(mut self, executor: Arc<dyn OperationExecutor>) -> Self {
        let operation = executor.operation();
        info!("注册操作执行器: {}", operation);
        self.executors.insert(operation, executor);
        self
    }

    pub fn build(self) -> Arc<WorkerService> {
        Arc::new(WorkerService {
            channel: self.channel,
            config: self.config,
            executors: self.executors,
            busy: Arc::new(AtomicBool::new(false)),
            reporter: RwLock::new(None),
            is_running: Arc::new(RwLock::new(false)),
        })
    }
}

/// Worker服务实现
///
/// 单飞执行模型：同一时刻只执行一个任务，忙碌期间收到的
/// 分发立即以[`CourierError::WorkerBusy`]拒绝，由调度端另选
/// 实例。
pub struct WorkerService {
    channel: Arc<BrokerChannel>,
    config: WorkerConfig,
    executors: HashMap<Operation, Arc<dyn OperationExecutor>>,
    /// 单飞闸门
    busy: Arc<AtomicBool>,
    reporter: RwLock<Option<Arc<StateReporter>>>,
    is_running: Arc<RwLock<bool>>,
}

impl WorkerService {
    pub fn builder(channel: Arc<BrokerChannel>, config: WorkerConfig) -> WorkerServiceBuilder {
        WorkerServiceBuilder::new(channel, config)
    }

    pub fn instance(&self) -> &str {
        self.channel.instance()
    }

    pub fn supported_operations(&self) -> Vec<Operation> {
        self.executors.keys().copied().collect()
    }

    /// 启动Worker
    ///
    /// 生命周期序列：广播`STARTED`，注册全部分发处理器期间为
    /// `INITIALIZING`，就绪后广播`READY`并开始心跳。
    pub async fn start(self: &Arc<Self>) -> CourierResult<()> {
        {
            let mut running = self.is_running.write().await;
            if *running {
                warn!("Worker '{}' 已在运行", self.instance());
                return Ok(());
            }
            *running = true;
        }

        let reporter = StateReporter::new(Arc::clone(&self.channel), self.instance()).await?;
        reporter.update_state(ApplicationStatus::Initializing).await?;

        for executor in self.executors.values() {
            let handler = Arc::new(DispatchHandler {
                executor: Arc::clone(executor),
                channel: Arc::clone(&self.channel),
                instance: self.instance().to_string(),
                busy: Arc::clone(&self.busy),
                max_retry_attempts: self.config.max_retry_attempts,
                retry_backoff_base_ms: self.config.retry_backoff_base_ms,
                retry_backoff_max_ms: self.config.retry_backoff_max_ms,
            });
            self.channel
                .respond_instance(self.instance(), executor.operation(), handler)
                .await?;
        }

        self.spawn_heartbeat(Arc::clone(&reporter));
        reporter.update_state(ApplicationStatus::Ready).await?;
        *self.reporter.write().await = Some(reporter);

        info!(
            "Worker '{}' 就绪，支持操作: {:?}",
            self.instance(),
            self.supported_operations()
        );
        Ok(())
    }

    /// 停止Worker并广播`STOPPED`
    pub async fn stop(&self) -> CourierResult<()> {
        {
            let mut running = self.is_running.write().await;
            if !*running {
                return Ok(());
            }
            *running = false;
        }

        if let Some(reporter) = self.reporter.read().await.as_ref() {
            reporter.update_state(ApplicationStatus::Stopped).await?;
        }
        info!("Worker '{}' 已停止", self.instance());
        Ok(())
    }

    pub async fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn spawn_heartbeat(&self, reporter: Arc<StateReporter>) {
        let is_running = Arc::clone(&self.is_running);
        let period = Duration::from_secs(self.config.heartbeat_interval_seconds);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // 首个tick立即触发，跳过
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !*is_running.read().await {
                    debug!("Worker已停止，心跳循环退出");
                    break;
                }
                if let Err(e) = reporter.publish_heartbeat().await {
                    warn!("发布心跳失败: {}", e);
                }
            }
        });
    }
}

/// 释放单飞闸门的守卫
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// 单个操作的分发处理器
struct DispatchHandler {
    executor: Arc<dyn OperationExecutor>,
    channel: Arc<BrokerChannel>,
    instance: String,
    busy: Arc<AtomicBool>,
    max_retry_attempts: u32,
    retry_backoff_base_ms: u64,
    retry_backoff_max_ms: u64,
}

impl DispatchHandler {
    /// 启动进度转发泵：执行上下文 -> 任务事件subject
    fn spawn_progress_pump(&self, task_id: Uuid) -> mpsc::UnboundedSender<Value> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        let channel = Arc::clone(&self.channel);

        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let event = TaskEvent::Progress { task_id, payload };
                if let Err(e) = channel.publish_task_event(&event).await {
                    debug!("发布进度事件失败: {}", e);
                }
            }
        });

        tx
    }

    /// 带分类重试的执行循环
    async fn execute_with_retry(
        &self,
        ctx: &ExecutionContext,
        payload: &Value,
    ) -> CourierResult<Value> {
        let mut attempt: u32 = 0;
        loop {
            match self.executor.execute(ctx, payload.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_retry_attempts {
                        return Err(CourierError::TransientExhausted(format!(
                            "{} 次尝试后仍失败: {e}",
                            attempt
                        )));
                    }
                    let delay = retry_delay(
                        attempt - 1,
                        self.retry_backoff_base_ms,
                        self.retry_backoff_max_ms,
                    );
                    warn!(
                        "任务 {} 第 {} 次尝试失败，{:?} 后重试: {}",
                        ctx.task_id, attempt, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// 发射遥测事件，与RPC响应路径完全解耦
    fn emit_telemetry(&self, task_id: Uuid, outcome: &str, duration: Duration) {
        let channel = Arc::clone(&self.channel);
        let payload = json!({
            "taskId": task_id,
            "worker": self.instance,
            "operation": self.executor.operation().wire_name(),
            "outcome": outcome,
            "durationMs": duration.as_millis() as u64,
            "timestamp": Utc::now(),
        });

        tokio::spawn(async move {
            if let Err(e) = channel.publish(Operation::TransactionLogEvent, payload).await {
                debug!("发射遥测事件失败: {}", e);
            }
        });
    }
}

#[async_trait]
impl RequestHandler for DispatchHandler {
    async fn handle(&self, payload: Value) -> CourierResult<Value> {
        let request: DispatchRequest = serde_json::from_value(payload)
            .map_err(|e| CourierError::validation(format!("分发请求格式无效: {e}")))?;

        // 单飞闸门：忙碌时立即拒绝，不排队
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Worker '{}' 忙碌，拒绝任务 {}", self.instance, request.task_id);
            return Err(CourierError::WorkerBusy {
                id: self.instance.clone(),
            });
        }
        let _guard = BusyGuard(Arc::clone(&self.busy));

        info!(
            "Worker '{}' 接受任务 {} ({})",
            self.instance,
            request.task_id,
            self.executor.operation()
        );
        let started = TaskEvent::Started {
            task_id: request.task_id,
            worker: self.instance.clone(),
        };
        if let Err(e) = self.channel.publish_task_event(&started).await {
            warn!("发布Started事件失败: {}", e);
        }

        let progress_tx = self.spawn_progress_pump(request.task_id);
        let ctx = ExecutionContext::new(request.task_id, progress_tx);

        let clock = Instant::now();
        let result = self.execute_with_retry(&ctx, &request.payload).await;
        let outcome = if result.is_ok() { "completed" } else { "failed" };
        self.emit_telemetry(request.task_id, outcome, clock.elapsed());

        result
    }
}

/// 有界指数退避加随机抖动
fn retry_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(max_ms);
    let jitter = rand::rng().random_range(0..=capped / 4);
    Duration::from_millis(capped + jitter)
}
