use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_domain::{Envelope, EnvelopeKind, Operation, ResponseStatus, StateReport, TaskEvent};
use courier_errors::{CourierError, CourierResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::bus::{decode_envelope, BusEvent, MessageBus};

/// RPC请求处理器
///
/// 处理器通过`Result`报告成败；错误会被转换为错误信封发回
/// 调用方，绝不会中断订阅循环。
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, payload: serde_json::Value) -> CourierResult<serde_json::Value>;
}

/// 闭包形式的请求处理器，主要用于测试与简单服务
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = CourierResult<serde_json::Value>> + Send,
{
    async fn handle(&self, payload: serde_json::Value) -> CourierResult<serde_json::Value> {
        (self.0)(payload).await
    }
}

/// 未完成的RPC调用
struct PendingCall {
    tx: oneshot::Sender<Envelope>,
    topic: String,
    created_at: DateTime<Utc>,
}

/// 消息代理通道
///
/// 包装一个逻辑pub/sub连接，以通道名作用域对外提供：
/// - `request`/`request_instance`：带关联id与超时的RPC原语
/// - `respond`/`respond_instance`：持久订阅 + 处理器边界
/// - `publish`：fire-and-forget通知
///
/// 每个关联id至多被解析一次；迟到或重复的响应会被静默丢弃
/// （记录debug日志）。底层连接断开时所有未完成调用以
/// `ConnectionLost`失败。
pub struct BrokerChannel {
    bus: Arc<dyn MessageBus>,
    channel_name: String,
    instance: String,
    reply_subject: String,
    pending: Arc<Mutex<HashMap<String, PendingCall>>>,
    default_timeout: Duration,
}

impl BrokerChannel {
    /// 创建通道并启动响应泵与连接事件监听
    pub async fn new(
        bus: Arc<dyn MessageBus>,
        channel_name: &str,
        instance: &str,
        default_timeout: Duration,
    ) -> CourierResult<Arc<Self>> {
        let reply_subject = format!("{channel_name}.reply.{instance}");
        let channel = Arc::new(Self {
            bus: Arc::clone(&bus),
            channel_name: channel_name.to_string(),
            instance: instance.to_string(),
            reply_subject: reply_subject.clone(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            default_timeout,
        });

        channel.spawn_reply_pump().await?;
        channel.spawn_event_watch();

        info!(
            "通道 '{}' 已建立，实例 '{}'，响应subject '{}'",
            channel_name, instance, reply_subject
        );
        Ok(channel)
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    fn request_subject(&self, topic: &str) -> String {
        format!("{}.request.{}", self.channel_name, topic)
    }

    fn instance_subject(&self, instance: &str, topic: &str) -> String {
        format!("{}.instance.{}.{}", self.channel_name, instance, topic)
    }

    fn event_subject(&self, topic: &str) -> String {
        format!("{}.event.{}", self.channel_name, topic)
    }

    fn state_subject(&self) -> String {
        format!("{}.state", self.channel_name)
    }

    fn task_event_subject(&self) -> String {
        format!("{}.task-event", self.channel_name)
    }

    /// 启动响应泵：消费本实例的reply subject并解析未完成调用
    async fn spawn_reply_pump(&self) -> CourierResult<()> {
        let mut rx = self.bus.subscribe(&self.reply_subject).await?;
        let pending = Arc::clone(&self.pending);

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let envelope = match decode_envelope(&message.payload) {
                    Ok(env) => env,
                    Err(e) => {
                        warn!("响应subject收到无法解析的消息: {}", e);
                        continue;
                    }
                };
                let Some(correlation_id) = envelope.correlation_id.clone() else {
                    warn!("响应信封缺少关联id，已丢弃");
                    continue;
                };

                let call = pending.lock().await.remove(&correlation_id);
                match call {
                    Some(call) => {
                        let elapsed_ms = (Utc::now() - call.created_at).num_milliseconds();
                        debug!(
                            "关联id {} ({}) 在 {}ms 后解析",
                            correlation_id, call.topic, elapsed_ms
                        );
                        // 接收端可能已因超时放弃，忽略发送失败
                        let _ = call.tx.send(envelope);
                    }
                    None => {
                        debug!(
                            "丢弃迟到或重复的响应: 关联id {} ({})",
                            correlation_id, envelope.topic
                        );
                    }
                }
            }
        });

        Ok(())
    }

    /// 监听传输层连接事件；断连时让所有未完成调用失败
    fn spawn_event_watch(&self) {
        let mut events = self.bus.events();
        let pending = Arc::clone(&self.pending);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(BusEvent::ConnectionLost) => {
                        let drained: Vec<(String, PendingCall)> =
                            pending.lock().await.drain().collect();
                        if !drained.is_empty() {
                            warn!("连接丢失，{} 个未完成调用将失败", drained.len());
                        }
                        for (correlation_id, call) in drained {
                            let envelope = Envelope::failure(
                                correlation_id,
                                call.topic.clone(),
                                CourierError::ConnectionLost.to_string(),
                                CourierError::ConnectionLost.code(),
                            );
                            let _ = call.tx.send(envelope);
                        }
                    }
                    Ok(BusEvent::Reconnected) => {
                        info!("传输层已重连，订阅已恢复");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("连接事件流滞后，跳过 {} 条事件", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// 发起RPC请求（共享subject）
    pub async fn request(
        &self,
        operation: Operation,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> CourierResult<serde_json::Value> {
        let subject = self.request_subject(operation.wire_name());
        self.request_on_subject(&subject, operation, payload, timeout)
            .await
    }

    /// 向指定实例发起RPC请求（点对点subject）
    pub async fn request_instance(
        &self,
        instance: &str,
        operation: Operation,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> CourierResult<serde_json::Value> {
        let subject = self.instance_subject(instance, operation.wire_name());
        self.request_on_subject(&subject, operation, payload, timeout)
            .await
    }

    async fn request_on_subject(
        &self,
        subject: &str,
        operation: Operation,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> CourierResult<serde_json::Value> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let envelope = Envelope::request(operation, payload, self.reply_subject.clone());
        let correlation_id = envelope
            .correlation_id
            .clone()
            .ok_or_else(|| CourierError::Internal("请求信封缺少关联id".to_string()))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                correlation_id.clone(),
                PendingCall {
                    tx,
                    topic: operation.wire_name().to_string(),
                    created_at: Utc::now(),
                },
            );
        }

        let bytes = serde_json::to_vec(&envelope)?;
        if let Err(e) = self.bus.publish(subject, bytes).await {
            self.pending.lock().await.remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Self::unwrap_response(response),
            Ok(Err(_)) => Err(CourierError::ConnectionLost),
            Err(_) => {
                // 超时后移除槽位，使迟到的响应被响应泵丢弃
                self.pending.lock().await.remove(&correlation_id);
                Err(CourierError::Timeout(format!(
                    "{} 在 {:?} 内未收到响应",
                    operation, timeout
                )))
            }
        }
    }

    fn unwrap_response(envelope: Envelope) -> CourierResult<serde_json::Value> {
        match envelope.status {
            Some(ResponseStatus::Success) => {
                Ok(envelope.payload.unwrap_or(serde_json::Value::Null))
            }
            Some(ResponseStatus::Error) => {
                let detail = envelope.error.unwrap_or_else(|| courier_domain::ErrorDetail {
                    message: "未知错误".to_string(),
                    code: 500,
                });
                Err(CourierError::from_code(detail.code, detail.message))
            }
            None => Err(CourierError::Internal(
                "响应信封缺少status字段".to_string(),
            )),
        }
    }

    /// 注册共享subject上的请求处理器
    pub async fn respond(
        &self,
        operation: Operation,
        handler: Arc<dyn RequestHandler>,
    ) -> CourierResult<()> {
        let subject = self.request_subject(operation.wire_name());
        self.respond_on_subject(&subject, handler).await
    }

    /// 注册本实例专属subject上的请求处理器
    pub async fn respond_instance(
        &self,
        instance: &str,
        operation: Operation,
        handler: Arc<dyn RequestHandler>,
    ) -> CourierResult<()> {
        let subject = self.instance_subject(instance, operation.wire_name());
        self.respond_on_subject(&subject, handler).await
    }

    async fn respond_on_subject(
        &self,
        subject: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> CourierResult<()> {
        let mut rx = self.bus.subscribe(subject).await?;
        let bus = Arc::clone(&self.bus);
        let subject = subject.to_string();

        tokio::spawn(async move {
            info!("开始处理subject '{}' 上的请求", subject);
            while let Some(message) = rx.recv().await {
                let envelope = match decode_envelope(&message.payload) {
                    Ok(env) => env,
                    Err(e) => {
                        warn!("subject '{}' 收到无法解析的请求: {}", subject, e);
                        continue;
                    }
                };
                if envelope.kind != EnvelopeKind::Request {
                    debug!("忽略subject '{}' 上的非请求信封", subject);
                    continue;
                }
                let Some(correlation_id) = envelope.correlation_id.clone() else {
                    warn!("请求信封缺少关联id，已丢弃");
                    continue;
                };
                let Some(reply_to) = envelope.reply_to.clone() else {
                    warn!("请求信封缺少reply_to，无法响应: {}", correlation_id);
                    continue;
                };

                let payload = envelope.payload.unwrap_or(serde_json::Value::Null);
                let handler = Arc::clone(&handler);
                let bus = Arc::clone(&bus);
                let subject = subject.clone();

                // 每条请求独立处理，慢处理器不会阻塞后续请求；
                // 处理器错误在此边界转换为错误信封，订阅循环永不中断
                tokio::spawn(async move {
                    let response = match handler.handle(payload).await {
                        Ok(value) => Envelope::success(correlation_id, envelope.topic, value),
                        Err(e) => {
                            debug!("subject '{}' 的处理器返回错误: {}", subject, e);
                            Envelope::failure(
                                correlation_id,
                                envelope.topic,
                                e.to_string(),
                                e.code(),
                            )
                        }
                    };

                    match serde_json::to_vec(&response) {
                        Ok(bytes) => {
                            if let Err(e) = bus.publish(&reply_to, bytes).await {
                                error!("发布响应到 '{}' 失败: {}", reply_to, e);
                            }
                        }
                        Err(e) => error!("序列化响应信封失败: {}", e),
                    }
                });
            }
            info!("subject '{}' 的请求处理循环退出", subject);
        });

        Ok(())
    }

    /// fire-and-forget发布，无关联、不期待响应
    pub async fn publish(
        &self,
        operation: Operation,
        payload: serde_json::Value,
    ) -> CourierResult<()> {
        let subject = self.event_subject(operation.wire_name());
        let envelope = Envelope::event(operation, payload);
        self.bus.publish(&subject, serde_json::to_vec(&envelope)?).await
    }

    /// 订阅某操作的fire-and-forget事件
    pub async fn subscribe_events(
        &self,
        operation: Operation,
    ) -> CourierResult<mpsc::UnboundedReceiver<Envelope>> {
        let subject = self.event_subject(operation.wire_name());
        let mut raw = self.bus.subscribe(&subject).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(message) = raw.recv().await {
                match decode_envelope(&message.payload) {
                    Ok(env) => {
                        if tx.send(env).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("事件subject '{}' 上的消息无法解析: {}", subject, e),
                }
            }
        });

        Ok(rx)
    }

    /// 广播生命周期状态报告
    pub async fn publish_state(&self, report: &StateReport) -> CourierResult<()> {
        let subject = self.state_subject();
        self.bus.publish(&subject, serde_json::to_vec(report)?).await
    }

    /// 订阅全网生命周期状态广播
    pub async fn subscribe_state(
        &self,
    ) -> CourierResult<mpsc::UnboundedReceiver<StateReport>> {
        let mut raw = self.bus.subscribe(&self.state_subject()).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(message) = raw.recv().await {
                match serde_json::from_slice::<StateReport>(&message.payload) {
                    Ok(report) => {
                        if tx.send(report).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("状态广播无法解析: {}", e),
                }
            }
        });

        Ok(rx)
    }

    /// 发布任务事件（Started/Progress）
    pub async fn publish_task_event(&self, event: &TaskEvent) -> CourierResult<()> {
        let subject = self.task_event_subject();
        self.bus.publish(&subject, serde_json::to_vec(event)?).await
    }

    /// 订阅任务事件流
    pub async fn subscribe_task_events(
        &self,
    ) -> CourierResult<mpsc::UnboundedReceiver<TaskEvent>> {
        let mut raw = self.bus.subscribe(&self.task_event_subject()).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(message) = raw.recv().await {
                match serde_json::from_slice::<TaskEvent>(&message.payload) {
                    Ok(event) => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("任务事件无法解析: {}", e),
                }
            }
        });

        Ok(rx)
    }

    /// 当前未完成调用数量
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn make_pair() -> (Arc<InMemoryBus>, Arc<BrokerChannel>, Arc<BrokerChannel>) {
        let bus = Arc::new(InMemoryBus::new());
        let caller = BrokerChannel::new(
            bus.clone() as Arc<dyn MessageBus>,
            "courier",
            "gateway-1",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let callee = BrokerChannel::new(
            bus.clone() as Arc<dyn MessageBus>,
            "courier",
            "service-1",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        (bus, caller, callee)
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let (_bus, caller, callee) = make_pair().await;

        callee
            .respond(
                Operation::GetSettings,
                Arc::new(FnHandler(|_payload| async move {
                    Ok(json!({"operatorId": "0.0.1001"}))
                })),
            )
            .await
            .unwrap();

        let result = caller
            .request(Operation::GetSettings, json!({}), None)
            .await
            .unwrap();
        assert_eq!(result["operatorId"], "0.0.1001");
        assert_eq!(caller.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failure_envelope() {
        let (_bus, caller, callee) = make_pair().await;

        callee
            .respond(
                Operation::UpdateSettings,
                Arc::new(FnHandler(|_payload| async move {
                    Err::<serde_json::Value, _>(CourierError::validation("OPERATOR_ID格式无效"))
                })),
            )
            .await
            .unwrap();

        let err = caller
            .request(Operation::UpdateSettings, json!({"operatorId": "bad"}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::Validation(_)));
    }

    #[tokio::test]
    async fn test_handler_error_does_not_kill_subscription() {
        let (_bus, caller, callee) = make_pair().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        callee
            .respond(
                Operation::GetEnvironment,
                Arc::new(FnHandler(move |_payload| {
                    let calls = Arc::clone(&calls_clone);
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        if n == 0 {
                            Err(CourierError::Internal("第一次崩溃".to_string()))
                        } else {
                            Ok(json!("testnet"))
                        }
                    }
                })),
            )
            .await
            .unwrap();

        let first = caller
            .request(Operation::GetEnvironment, json!({}), None)
            .await;
        assert!(first.is_err());

        let second = caller
            .request(Operation::GetEnvironment, json!({}), None)
            .await
            .unwrap();
        assert_eq!(second, json!("testnet"));
    }

    #[tokio::test]
    async fn test_request_times_out_without_responder() {
        let (_bus, caller, _callee) = make_pair().await;

        let started = std::time::Instant::now();
        let err = caller
            .request(
                Operation::GetSettings,
                json!({}),
                Some(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, CourierError::Timeout(_)));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(1000));
        // 槽位已清理，迟到响应不会再命中
        assert_eq!(caller.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_response_is_discarded() {
        let bus = Arc::new(InMemoryBus::new());
        let caller = BrokerChannel::new(
            bus.clone() as Arc<dyn MessageBus>,
            "courier",
            "gateway-1",
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        // 手工响应端：对同一请求发布两份相互矛盾的响应
        let mut requests = bus.subscribe("courier.request.get-settings").await.unwrap();
        let bus_clone = bus.clone();
        tokio::spawn(async move {
            if let Some(message) = requests.recv().await {
                let envelope: Envelope = serde_json::from_slice(&message.payload).unwrap();
                let correlation_id = envelope.correlation_id.clone().unwrap();
                let reply_to = envelope.reply_to.clone().unwrap();

                let first = Envelope::success(
                    correlation_id.clone(),
                    envelope.topic.clone(),
                    json!("first"),
                );
                let second =
                    Envelope::success(correlation_id, envelope.topic.clone(), json!("second"));
                bus_clone
                    .publish(&reply_to, serde_json::to_vec(&first).unwrap())
                    .await
                    .unwrap();
                bus_clone
                    .publish(&reply_to, serde_json::to_vec(&second).unwrap())
                    .await
                    .unwrap();
            }
        });

        let result = caller
            .request(Operation::GetSettings, json!({}), None)
            .await
            .unwrap();
        // 只有第一份响应生效
        assert_eq!(result, json!("first"));

        // 等待重复响应被响应泵消化，不应引发任何变化
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(caller.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_connection_lost_fails_pending_calls() {
        let bus = Arc::new(InMemoryBus::new());
        let caller = BrokerChannel::new(
            bus.clone() as Arc<dyn MessageBus>,
            "courier",
            "gateway-1",
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        let caller_clone = Arc::clone(&caller);
        let call = tokio::spawn(async move {
            caller_clone
                .request(Operation::SendTransaction, json!({}), None)
                .await
        });

        // 等待调用挂起后模拟断连
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.emit_connection_lost();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, CourierError::ConnectionLost));
        assert_eq!(caller.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_publish_event_round_trip() {
        let (_bus, caller, callee) = make_pair().await;

        let mut events = callee
            .subscribe_events(Operation::TransactionLogEvent)
            .await
            .unwrap();

        caller
            .publish(Operation::TransactionLogEvent, json!({"tx": "0xabc"}))
            .await
            .unwrap();

        let envelope = events.recv().await.unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Event);
        assert!(envelope.correlation_id.is_none());
        assert_eq!(envelope.payload.unwrap()["tx"], "0xabc");
    }

    #[tokio::test]
    async fn test_instance_addressing_is_point_to_point() {
        let bus = Arc::new(InMemoryBus::new());
        let caller = BrokerChannel::new(
            bus.clone() as Arc<dyn MessageBus>,
            "courier",
            "gateway-1",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let worker_a = BrokerChannel::new(
            bus.clone() as Arc<dyn MessageBus>,
            "courier",
            "worker-a",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let worker_b = BrokerChannel::new(
            bus.clone() as Arc<dyn MessageBus>,
            "courier",
            "worker-b",
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        worker_a
            .respond_instance(
                "worker-a",
                Operation::SendTransaction,
                Arc::new(FnHandler(|_| async move { Ok(json!("from-a")) })),
            )
            .await
            .unwrap();
        worker_b
            .respond_instance(
                "worker-b",
                Operation::SendTransaction,
                Arc::new(FnHandler(|_| async move { Ok(json!("from-b")) })),
            )
            .await
            .unwrap();

        let result = caller
            .request_instance("worker-b", Operation::SendTransaction, json!({}), None)
            .await
            .unwrap();
        assert_eq!(result, json!("from-b"));
    }
}
