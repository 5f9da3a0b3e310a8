use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::TaskStatus;

/// Worker在执行过程中发布的任务事件
///
/// `Started`与`Progress`经由fire-and-forget发布到任务事件
/// subject；终态结果走RPC响应路径。协议必须容忍乱序到达，
/// 因此事件均携带任务id而非关联id。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TaskEvent {
    /// Worker已接受分发，任务进入RUNNING
    #[serde(rename_all = "camelCase")]
    Started { task_id: Uuid, worker: String },
    /// 进度更新，载荷由操作自定义
    #[serde(rename_all = "camelCase")]
    Progress {
        task_id: Uuid,
        payload: serde_json::Value,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> Uuid {
        match self {
            TaskEvent::Started { task_id, .. } => *task_id,
            TaskEvent::Progress { task_id, .. } => *task_id,
        }
    }
}

/// 分发给Worker实例的任务执行请求
///
/// 走RPC请求路径：响应即任务终态。任务id供Worker在
/// Started/Progress事件中回指。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub task_id: Uuid,
    /// 操作自定义的输入载荷
    pub payload: serde_json::Value,
}

/// 推送给realtime订阅者的任务快照
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub task_id: Uuid,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TaskUpdate {
    pub fn from_task(task: &crate::entities::Task) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            progress: task.progress.clone(),
            result: task.result.clone(),
            error: task.error.clone(),
            timestamp: Utc::now(),
        }
    }
}
