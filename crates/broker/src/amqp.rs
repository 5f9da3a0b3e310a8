use async_trait::async_trait;
use courier_config::BrokerConfig;
use courier_errors::{CourierError, CourierResult};
use futures::StreamExt;
use lapin::{
    options::*, types::FieldTable, BasicProperties, Channel, Connection, ConnectionProperties,
    ExchangeKind,
};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::bus::{BusEvent, BusMessage, MessageBus};

/// AMQP消息总线实现
///
/// 单个topic exchange承载全部subject：发布使用subject作为
/// routing key，订阅为每个接收端声明一个服务器命名的排他
/// 自动删除队列并绑定到对应routing key，得到fanout语义。
///
/// 连接由看门狗监督：断开时广播[`BusEvent::ConnectionLost`]，
/// 以有界指数退避重连，成功后重建全部订阅并广播
/// [`BusEvent::Reconnected`]。
pub struct AmqpBus {
    config: BrokerConfig,
    exchange: String,
    channel: Arc<Mutex<Option<Channel>>>,
    /// 存活的订阅端，重连后按此重建消费者
    subscriptions: Arc<Mutex<Vec<(String, mpsc::UnboundedSender<BusMessage>)>>>,
    events_tx: broadcast::Sender<BusEvent>,
}

impl AmqpBus {
    /// 连接AMQP broker并启动连接看门狗
    pub async fn connect(config: BrokerConfig) -> CourierResult<Arc<Self>> {
        let exchange = format!("{}.bus", config.channel_name);
        let (events_tx, _) = broadcast::channel(16);

        let connection = Self::open_connection(&config).await?;
        let channel = Self::open_channel(&connection, &exchange).await?;
        info!("成功连接到AMQP broker: {}", config.url);

        let bus = Arc::new(Self {
            config,
            exchange,
            channel: Arc::new(Mutex::new(Some(channel))),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            events_tx,
        });

        bus.spawn_watchdog(connection);
        Ok(bus)
    }

    async fn open_connection(config: &BrokerConfig) -> CourierResult<Connection> {
        Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| CourierError::Broker(format!("连接AMQP broker失败: {e}")))
    }

    /// 创建通道并声明exchange
    async fn open_channel(connection: &Connection, exchange: &str) -> CourierResult<Channel> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| CourierError::Broker(format!("创建通道失败: {e}")))?;

        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| CourierError::Broker(format!("声明exchange {exchange} 失败: {e}")))?;

        debug!("exchange {} 声明成功", exchange);
        Ok(channel)
    }

    /// 连接看门狗：监测断连，负责重连与订阅重建
    ///
    /// 健康判定是"连接存活且通道就绪"：上一轮恢复中途失败时
    /// 通道为空，即便连接已恢复也会在下个tick重新走恢复流程，
    /// 直到通道与订阅全部重建成功。
    fn spawn_watchdog(self: &Arc<Self>, mut connection: Connection) {
        let bus = Arc::clone(self);

        tokio::spawn(async move {
            let mut probe = tokio::time::interval(Duration::from_secs(1));
            probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                probe.tick().await;
                let channel_open = bus.channel.lock().await.is_some();
                if !needs_recovery(connection.status().connected(), channel_open) {
                    continue;
                }

                if channel_open {
                    // 本轮首次发现断连
                    warn!("AMQP连接丢失，开始重连");
                    *bus.channel.lock().await = None;
                    let _ = bus.events_tx.send(BusEvent::ConnectionLost);
                }
                if !connection.status().connected() {
                    connection = bus.reconnect().await;
                }

                match Self::open_channel(&connection, &bus.exchange).await {
                    Ok(channel) => {
                        *bus.channel.lock().await = Some(channel);
                    }
                    Err(e) => {
                        // 通道保持为空，下个tick重试
                        error!("重连后创建通道失败: {}", e);
                        continue;
                    }
                }

                if let Err(e) = bus.restore_subscriptions().await {
                    error!("重建订阅失败: {}", e);
                    // 关闭半成品通道，下个tick重新恢复
                    if let Some(channel) = bus.channel.lock().await.take() {
                        let _ = channel.close(200, "restore-failed").await;
                    }
                    continue;
                }
                info!("AMQP重连完成，订阅已重建");
                let _ = bus.events_tx.send(BusEvent::Reconnected);
            }
        });
    }

    /// 以有界指数退避重连，直到成功
    async fn reconnect(&self) -> Connection {
        let mut attempt: u32 = 0;
        loop {
            let delay = backoff_delay(
                attempt,
                self.config.reconnect_initial_delay_ms,
                self.config.reconnect_max_delay_ms,
            );
            debug!("第 {} 次重连，等待 {:?}", attempt + 1, delay);
            tokio::time::sleep(delay).await;

            match Self::open_connection(&self.config).await {
                Ok(connection) => return connection,
                Err(e) => {
                    warn!("重连失败: {}", e);
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// 为所有仍存活的订阅端重建消费者
    async fn restore_subscriptions(&self) -> CourierResult<()> {
        let mut subscriptions = self.subscriptions.lock().await;
        subscriptions.retain(|(_, tx)| !tx.is_closed());

        for (subject, tx) in subscriptions.iter() {
            self.start_consumer(subject, tx.clone()).await?;
        }
        debug!("已重建 {} 个订阅", subscriptions.len());
        Ok(())
    }

    /// 声明排他队列、绑定routing key并启动消费泵
    async fn start_consumer(
        &self,
        subject: &str,
        tx: mpsc::UnboundedSender<BusMessage>,
    ) -> CourierResult<()> {
        let guard = self.channel.lock().await;
        let channel = guard
            .as_ref()
            .ok_or(CourierError::ConnectionLost)?
            .clone();
        drop(guard);

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| CourierError::Broker(format!("声明订阅队列失败: {e}")))?;

        channel
            .queue_bind(
                queue.name().as_str(),
                &self.exchange,
                subject,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| CourierError::Broker(format!("绑定subject {subject} 失败: {e}")))?;

        let mut consumer = channel
            .basic_consume(
                queue.name().as_str(),
                &format!("courier-{subject}"),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| CourierError::Broker(format!("创建消费者失败: {e}")))?;

        let subject = subject.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("subject '{}' 的消费者出错: {}", subject, e);
                        break;
                    }
                };
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    warn!("确认消息失败: {}", e);
                }
                let message = BusMessage {
                    subject: subject.clone(),
                    payload: delivery.data,
                };
                if tx.send(message).is_err() {
                    debug!("subject '{}' 的订阅端已关闭，消费泵退出", subject);
                    break;
                }
            }
            debug!("subject '{}' 的消费泵结束", subject);
        });

        Ok(())
    }
}

#[async_trait]
impl MessageBus for AmqpBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> CourierResult<()> {
        let guard = self.channel.lock().await;
        let channel = guard
            .as_ref()
            .ok_or(CourierError::ConnectionLost)?
            .clone();
        drop(guard);

        let confirm = channel
            .basic_publish(
                &self.exchange,
                subject,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| CourierError::Broker(format!("发布到subject {subject} 失败: {e}")))?;

        confirm
            .await
            .map_err(|e| CourierError::Broker(format!("消息发布确认失败: {e}")))?;

        debug!("消息已发布到subject: {}", subject);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> CourierResult<mpsc::UnboundedReceiver<BusMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.start_consumer(subject, tx.clone()).await?;
        self.subscriptions
            .lock()
            .await
            .push((subject.to_string(), tx));
        Ok(rx)
    }

    fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.events_tx.subscribe()
    }
}

/// 看门狗是否需要进入恢复流程
pub(crate) fn needs_recovery(connected: bool, channel_open: bool) -> bool {
    !connected || !channel_open
}

/// 有界指数退避加随机抖动
pub(crate) fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(max_ms);
    // 抖动上限为退避值的25%
    let jitter = rand::rng().random_range(0..=capped / 4);
    Duration::from_millis(capped + jitter)
}
