use async_trait::async_trait;
use courier_errors::{CourierError, CourierResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::debug;

/// 总线上的一条原始消息
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

/// 传输层连接事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    ConnectionLost,
    Reconnected,
}

/// pub/sub传输抽象
///
/// subject为fanout语义：每个订阅者都会收到发布到该subject的
/// 全部消息。需要点对点投递时使用实例唯一的subject。
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// 发布消息到指定subject
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> CourierResult<()>;

    /// 订阅subject，返回该订阅的消息接收端
    async fn subscribe(&self, subject: &str) -> CourierResult<mpsc::UnboundedReceiver<BusMessage>>;

    /// 订阅连接事件（断连/重连）
    fn events(&self) -> broadcast::Receiver<BusEvent>;
}

/// 内存消息总线实现
///
/// 使用Tokio channels实现subject到订阅者的fanout，适用于
/// 嵌入式部署和测试场景。没有持久化，订阅者消失后自动清理。
#[derive(Debug)]
pub struct InMemoryBus {
    subscribers: Arc<RwLock<HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>>>,
    events_tx: broadcast::Sender<BusEvent>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(16);
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            events_tx,
        }
    }

    /// 模拟一次连接丢失，用于验证上层的失败语义
    pub fn emit_connection_lost(&self) {
        let _ = self.events_tx.send(BusEvent::ConnectionLost);
    }

    /// 当前某subject的订阅者数量
    pub async fn subscriber_count(&self, subject: &str) -> usize {
        self.subscribers
            .read()
            .await
            .get(subject)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> CourierResult<()> {
        let mut dead = false;
        {
            let subscribers = self.subscribers.read().await;
            if let Some(senders) = subscribers.get(subject) {
                for sender in senders {
                    let message = BusMessage {
                        subject: subject.to_string(),
                        payload: payload.clone(),
                    };
                    if sender.send(message).is_err() {
                        dead = true;
                    }
                }
            } else {
                debug!("subject '{}' 没有订阅者，消息被丢弃", subject);
            }
        }

        // 惰性清理已关闭的订阅端
        if dead {
            let mut subscribers = self.subscribers.write().await;
            if let Some(senders) = subscribers.get_mut(subject) {
                senders.retain(|s| !s.is_closed());
                if senders.is_empty() {
                    subscribers.remove(subject);
                }
            }
        }

        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> CourierResult<mpsc::UnboundedReceiver<BusMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.write().await;
        subscribers.entry(subject.to_string()).or_default().push(tx);
        debug!("新增subject '{}' 的订阅者", subject);
        Ok(rx)
    }

    fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.events_tx.subscribe()
    }
}

/// 将serde错误统一转换为传输层错误
pub(crate) fn decode_envelope(payload: &[u8]) -> CourierResult<courier_domain::Envelope> {
    serde_json::from_slice(payload)
        .map_err(|e| CourierError::Serialization(format!("反序列化信封失败: {e}")))
}
