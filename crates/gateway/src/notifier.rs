use courier_domain::TaskUpdate;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// 单条realtime连接
struct ConnectionEntry {
    sender: mpsc::UnboundedSender<TaskUpdate>,
    subscriptions: HashSet<Uuid>,
}

/// realtime推送中心
///
/// 维护连接到任务订阅的映射。推送是尽力而为：任何一条连接
/// 发送失败即视为断开并整体移除，绝不阻塞任务状态机。
pub struct Notifier {
    connections: RwLock<HashMap<Uuid, ConnectionEntry>>,
}

impl Notifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
        })
    }

    /// 注册一条新连接，返回连接id与推送接收端
    pub async fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<TaskUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = Uuid::new_v4();
        self.connections.write().await.insert(
            conn_id,
            ConnectionEntry {
                sender: tx,
                subscriptions: HashSet::new(),
            },
        );
        info!("realtime连接 {} 已注册", conn_id);
        (conn_id, rx)
    }

    /// 注销连接，其全部订阅随之消失
    pub async fn unregister(&self, conn_id: Uuid) {
        if self.connections.write().await.remove(&conn_id).is_some() {
            info!("realtime连接 {} 已注销", conn_id);
        }
    }

    /// 订阅某任务的更新，重复订阅为幂等操作
    pub async fn subscribe(&self, conn_id: Uuid, task_id: Uuid) {
        if let Some(entry) = self.connections.write().await.get_mut(&conn_id) {
            if entry.subscriptions.insert(task_id) {
                debug!("连接 {} 订阅任务 {}", conn_id, task_id);
            }
        }
    }

    /// 取消订阅，未订阅时为空操作
    pub async fn unsubscribe(&self, conn_id: Uuid, task_id: Uuid) {
        if let Some(entry) = self.connections.write().await.get_mut(&conn_id) {
            if entry.subscriptions.remove(&task_id) {
                debug!("连接 {} 取消订阅任务 {}", conn_id, task_id);
            }
        }
    }

    /// 向订阅了该任务的所有连接推送更新
    ///
    /// 发送失败的连接当场移除。
    pub async fn push(&self, update: &TaskUpdate) {
        let mut dead: Vec<Uuid> = Vec::new();
        {
            let connections = self.connections.read().await;
            for (conn_id, entry) in connections.iter() {
                if !entry.subscriptions.contains(&update.task_id) {
                    continue;
                }
                if entry.sender.send(update.clone()).is_err() {
                    dead.push(*conn_id);
                }
            }
        }

        if !dead.is_empty() {
            let mut connections = self.connections.write().await;
            for conn_id in dead {
                connections.remove(&conn_id);
                debug!("连接 {} 推送失败，已移除", conn_id);
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn subscriber_count(&self, task_id: Uuid) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|e| e.subscriptions.contains(&task_id))
            .count()
    }
}
