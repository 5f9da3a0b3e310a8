use chrono::{Duration as ChronoDuration, Utc};
use courier_domain::{ApplicationStatus, StateReport, WorkerRegistration};
use courier_errors::CourierResult;
use rand::prelude::IndexedRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::channel::BrokerChannel;

/// Worker注册缓存
///
/// 被动消费生命周期状态广播，维护实例到注册信息的映射。
/// 过期实例（超过staleness窗口未广播）不参与选择但保留在
/// 缓存中，恢复广播后自动重新变为可用。
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerRegistration>>,
    stale_after: ChronoDuration,
}

impl WorkerRegistry {
    pub fn new(stale_after: Duration) -> Arc<Self> {
        Arc::new(Self {
            workers: RwLock::new(HashMap::new()),
            stale_after: ChronoDuration::from_std(stale_after)
                .unwrap_or_else(|_| ChronoDuration::seconds(90)),
        })
    }

    /// 启动状态广播监听，持续更新注册表
    pub async fn spawn_listener(
        self: &Arc<Self>,
        channel: &Arc<BrokerChannel>,
    ) -> CourierResult<()> {
        let mut reports = channel.subscribe_state().await?;
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            while let Some(report) = reports.recv().await {
                registry.observe(report).await;
            }
            info!("状态广播流关闭，注册表监听退出");
        });

        Ok(())
    }

    /// 记录一次状态广播
    pub async fn observe(&self, report: StateReport) {
        let mut workers = self.workers.write().await;
        let is_new = !workers.contains_key(&report.instance);
        if is_new {
            info!("发现新实例 '{}'，状态 {:?}", report.instance, report.status);
        } else {
            debug!("实例 '{}' 广播状态 {:?}", report.instance, report.status);
        }

        if report.status == ApplicationStatus::Stopped {
            workers.remove(&report.instance);
            info!("实例 '{}' 已停止，移出注册表", report.instance);
            return;
        }

        workers.insert(
            report.instance.clone(),
            WorkerRegistration {
                instance: report.instance,
                status: report.status,
                last_seen: Utc::now(),
            },
        );
    }

    /// 当前所有已知实例（含过期实例）
    pub async fn all(&self) -> Vec<WorkerRegistration> {
        let mut list: Vec<_> = self.workers.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.instance.cmp(&b.instance));
        list
    }

    /// 可接受分发的实例：状态READY且在staleness窗口内有广播
    pub async fn eligible(&self) -> Vec<WorkerRegistration> {
        let cutoff = Utc::now() - self.stale_after;
        self.workers
            .read()
            .await
            .values()
            .filter(|w| w.status == ApplicationStatus::Ready && w.last_seen >= cutoff)
            .cloned()
            .collect()
    }

    /// 随机挑选一个可用实例
    pub async fn pick(&self) -> Option<WorkerRegistration> {
        let eligible = self.eligible().await;
        eligible.choose(&mut rand::rng()).cloned()
    }

    /// 某实例当前是否可用
    pub async fn is_eligible(&self, instance: &str) -> bool {
        let cutoff = Utc::now() - self.stale_after;
        self.workers
            .read()
            .await
            .get(instance)
            .map(|w| w.status == ApplicationStatus::Ready && w.last_seen >= cutoff)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(instance: &str, status: ApplicationStatus) -> StateReport {
        StateReport {
            instance: instance.to_string(),
            status,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_only_ready_workers_are_eligible() {
        let registry = WorkerRegistry::new(Duration::from_secs(90));
        registry.observe(report("w-1", ApplicationStatus::Ready)).await;
        registry
            .observe(report("w-2", ApplicationStatus::Initializing))
            .await;
        registry
            .observe(report("w-3", ApplicationStatus::Degraded))
            .await;

        let eligible = registry.eligible().await;
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].instance, "w-1");
        assert_eq!(registry.all().await.len(), 3);
    }

    #[tokio::test]
    async fn test_stale_worker_is_retained_but_ineligible() {
        let registry = WorkerRegistry::new(Duration::from_millis(20));
        registry.observe(report("w-1", ApplicationStatus::Ready)).await;
        assert!(registry.is_eligible("w-1").await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!registry.is_eligible("w-1").await);
        // 过期但不删除
        assert_eq!(registry.all().await.len(), 1);

        // 恢复广播后重新可用
        registry.observe(report("w-1", ApplicationStatus::Ready)).await;
        assert!(registry.is_eligible("w-1").await);
    }

    #[tokio::test]
    async fn test_stopped_worker_is_removed() {
        let registry = WorkerRegistry::new(Duration::from_secs(90));
        registry.observe(report("w-1", ApplicationStatus::Ready)).await;
        registry
            .observe(report("w-1", ApplicationStatus::Stopped))
            .await;

        assert!(registry.all().await.is_empty());
        assert!(registry.pick().await.is_none());
    }

    #[tokio::test]
    async fn test_pick_returns_some_eligible_worker() {
        let registry = WorkerRegistry::new(Duration::from_secs(90));
        registry.observe(report("w-1", ApplicationStatus::Ready)).await;
        registry.observe(report("w-2", ApplicationStatus::Ready)).await;

        let picked = registry.pick().await.unwrap();
        assert!(picked.instance == "w-1" || picked.instance == "w-2");
    }

    #[tokio::test]
    async fn test_listener_consumes_broadcasts() {
        use crate::bus::{InMemoryBus, MessageBus};
        use crate::channel::BrokerChannel;

        let bus = Arc::new(InMemoryBus::new());
        let channel = BrokerChannel::new(
            bus as Arc<dyn MessageBus>,
            "courier",
            "gateway-1",
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let registry = WorkerRegistry::new(Duration::from_secs(90));
        registry.spawn_listener(&channel).await.unwrap();

        channel
            .publish_state(&report("w-9", ApplicationStatus::Ready))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.is_eligible("w-9").await);
    }
}
