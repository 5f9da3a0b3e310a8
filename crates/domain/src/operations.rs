use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 服务间操作标识
///
/// 原设计中topic是自由字符串，调用方与处理方各写各的，
/// 拼写错误只能在运行时发现。这里收敛为封闭枚举，
/// 调用方和处理方共享同一组标识，编译期即可校验。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// 签发凭证（长任务，经由Task Manager分发给Worker）
    IssueCredential,
    /// 提交账本交易（长任务）
    SendTransaction,
    /// 读取系统设置（同步RPC）
    GetSettings,
    /// 更新系统设置（同步RPC）
    UpdateSettings,
    /// 查询账本网络环境（同步RPC）
    GetEnvironment,
    /// 交易日志事件（fire-and-forget遥测）
    TransactionLogEvent,
}

impl Operation {
    /// 线上topic名，与原协议保持一致的kebab-case
    pub fn wire_name(&self) -> &'static str {
        match self {
            Operation::IssueCredential => "issue-credential",
            Operation::SendTransaction => "send-transaction",
            Operation::GetSettings => "get-settings",
            Operation::UpdateSettings => "update-settings",
            Operation::GetEnvironment => "get-environment",
            Operation::TransactionLogEvent => "transaction-log-event",
        }
    }

    /// 该操作是否为长任务，需要经由Task Manager跟踪
    pub fn is_long_running(&self) -> bool {
        matches!(self, Operation::IssueCredential | Operation::SendTransaction)
    }

    pub fn all() -> &'static [Operation] {
        &[
            Operation::IssueCredential,
            Operation::SendTransaction,
            Operation::GetSettings,
            Operation::UpdateSettings,
            Operation::GetEnvironment,
            Operation::TransactionLogEvent,
        ]
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::all()
            .iter()
            .find(|op| op.wire_name() == s)
            .copied()
            .ok_or_else(|| format!("未知的操作标识: {s}"))
    }
}
