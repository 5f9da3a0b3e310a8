use chrono::Utc;
use courier_domain::{ApplicationStatus, StateReport};
use courier_errors::{CourierError, CourierResult};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::channel::BrokerChannel;

/// 生命周期状态上报器
///
/// 持有本进程当前的[`ApplicationStatus`]，校验状态机转换并把
/// 每次变更广播到状态subject。心跳重发当前状态，供注册表刷新
/// `last_seen`。
pub struct StateReporter {
    channel: Arc<BrokerChannel>,
    instance: String,
    current: RwLock<ApplicationStatus>,
}

impl StateReporter {
    /// 创建上报器并立即广播初始的`Started`状态
    pub async fn new(channel: Arc<BrokerChannel>, instance: &str) -> CourierResult<Arc<Self>> {
        let reporter = Arc::new(Self {
            channel,
            instance: instance.to_string(),
            current: RwLock::new(ApplicationStatus::Started),
        });
        reporter.broadcast(ApplicationStatus::Started).await?;
        Ok(reporter)
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub async fn current(&self) -> ApplicationStatus {
        *self.current.read().await
    }

    /// 状态转换并广播
    ///
    /// 非法转换返回[`CourierError::InvalidStateTransition`]，当前
    /// 状态保持不变。自环转换合法，用于显式重广播。
    pub async fn update_state(&self, to: ApplicationStatus) -> CourierResult<()> {
        {
            let mut current = self.current.write().await;
            if !current.can_transition_to(to) {
                return Err(CourierError::InvalidStateTransition {
                    from: format!("{current:?}"),
                    to: format!("{to:?}"),
                });
            }
            if *current != to {
                info!("实例 '{}' 状态: {:?} -> {:?}", self.instance, current, to);
            }
            *current = to;
        }
        self.broadcast(to).await
    }

    /// 心跳：重新广播当前状态，不做任何转换
    pub async fn publish_heartbeat(&self) -> CourierResult<()> {
        let status = *self.current.read().await;
        self.broadcast(status).await
    }

    async fn broadcast(&self, status: ApplicationStatus) -> CourierResult<()> {
        let report = StateReport {
            instance: self.instance.clone(),
            status,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.channel.publish_state(&report).await {
            warn!("广播状态 {:?} 失败: {}", status, e);
            return Err(e);
        }
        Ok(())
    }
}
