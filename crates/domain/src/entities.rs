use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::operations::Operation;

/// 进程生命周期状态
///
/// `Started -> Initializing -> Ready`，`Ready`与`Degraded`之间
/// 可来回切换，任意状态可进入`Stopped`终态。不允许回退到
/// `Started`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationStatus {
    Started,
    Initializing,
    Ready,
    Degraded,
    Stopped,
}

impl ApplicationStatus {
    /// 生命周期图中允许的转换
    pub fn can_transition_to(&self, to: ApplicationStatus) -> bool {
        use ApplicationStatus::*;
        match (self, to) {
            (_, Stopped) => true,
            (Started, Initializing) => true,
            (Initializing, Ready) => true,
            (Ready, Degraded) => true,
            (Degraded, Ready) => true,
            (from, to) if *from == to => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ApplicationStatus::Stopped)
    }
}

/// 生命周期状态广播
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateReport {
    /// 实例唯一通道名
    pub instance: String,
    pub status: ApplicationStatus,
    pub timestamp: DateTime<Utc>,
}

/// 调度端缓存的Worker注册信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub instance: String,
    pub status: ApplicationStatus,
    /// 最后一次收到该实例广播的时间
    pub last_seen: DateTime<Utc>,
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Expired,
}

impl TaskStatus {
    /// 终态具有粘性：一旦进入，后续事件不再改变任务状态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Expired
        )
    }
}

/// 客户端可见的异步任务句柄
///
/// 任务id与底层RPC关联id相互独立：一个任务可以聚合
/// 多次broker往返（分发 + 若干进度事件 + 终态响应）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// 发起任务的会话/用户标识
    pub owner: String,
    pub operation: Operation,
    pub status: TaskStatus,
    /// 操作自定义的进度载荷，原样透传
    pub progress: Option<serde_json::Value>,
    /// 仅在Completed时存在
    pub result: Option<serde_json::Value>,
    /// 仅在Failed时存在
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(operation: Operation, owner: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner,
            operation,
            status: TaskStatus::Queued,
            progress: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
