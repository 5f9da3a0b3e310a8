use thiserror::Error;


#[derive(Debug, Error)]
pub enum CourierError {
    #[error("输入验证失败: {0}")]
    Validation(String),
    #[error("瞬时故障: {0}")]
    Transient(String),
    #[error("重试次数耗尽: {0}")]
    TransientExhausted(String),
    #[error("请求超时: {0}")]
    Timeout(String),
    #[error("消息代理连接丢失")]
    ConnectionLost,
    #[error("消息代理错误: {0}")]
    Broker(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("Worker {id} 正忙，拒绝新任务")]
    WorkerBusy { id: String },
    #[error("没有可用的Worker节点")]
    NoWorkerAvailable,
    #[error("非法状态转换: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type CourierResult<T> = Result<T, CourierError>;

impl CourierError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
    pub fn transient<S: Into<String>>(msg: S) -> Self {
        Self::Transient(msg.into())
    }
    pub fn broker_error<S: Into<String>>(msg: S) -> Self {
        Self::Broker(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }

    /// 是否属于可在本地重试的瞬时类错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CourierError::Transient(_)
                | CourierError::Broker(_)
                | CourierError::Timeout(_)
                | CourierError::WorkerBusy { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CourierError::Internal(_) | CourierError::Configuration(_)
        )
    }

    /// 错误信封中携带的数字错误码
    pub fn code(&self) -> u16 {
        match self {
            CourierError::Validation(_) => 400,
            CourierError::TaskNotFound { .. } => 404,
            CourierError::Timeout(_) => 408,
            CourierError::WorkerBusy { .. } => 429,
            CourierError::Transient(_) => 502,
            CourierError::TransientExhausted(_) => 503,
            CourierError::NoWorkerAvailable => 503,
            CourierError::ConnectionLost => 504,
            _ => 500,
        }
    }

    /// 根据信封中的错误码还原错误分类
    ///
    /// 信封里的message是发送侧的完整显示文本；还原时剥掉本侧
    /// 变体的标签，往返后显示文本保持稳定，不会出现双重前缀。
    pub fn from_code(code: u16, message: String) -> Self {
        match code {
            400 => CourierError::Validation(strip_label(message, "输入验证失败: ")),
            404 => CourierError::TaskNotFound {
                id: strip_label(message, "任务未找到: "),
            },
            408 => CourierError::Timeout(strip_label(message, "请求超时: ")),
            429 => {
                let id = message
                    .strip_prefix("Worker ")
                    .and_then(|m| m.strip_suffix(" 正忙，拒绝新任务"))
                    .map(str::to_string)
                    .unwrap_or(message);
                CourierError::WorkerBusy { id }
            }
            502 => CourierError::Transient(strip_label(message, "瞬时故障: ")),
            503 => CourierError::TransientExhausted(strip_label(message, "重试次数耗尽: ")),
            504 => CourierError::ConnectionLost,
            _ => CourierError::Internal(strip_label(message, "内部错误: ")),
        }
    }
}

fn strip_label(message: String, label: &str) -> String {
    message
        .strip_prefix(label)
        .map(str::to_string)
        .unwrap_or(message)
}

impl From<serde_json::Error> for CourierError {
    fn from(err: serde_json::Error) -> Self {
        CourierError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for CourierError {
    fn from(err: anyhow::Error) -> Self {
        CourierError::Internal(err.to_string())
    }
}
