use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::operations::Operation;

/// 信封类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Request,
    Response,
    Event,
}

/// 响应状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// 错误信封中的错误详情
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub message: String,
    pub code: u16,
}

/// 消息代理线上信封
///
/// 字段采用camelCase以保持与既有协议兼容。请求信封携带
/// `reply_to`指明响应应发布到的subject；响应信封携带
/// `status`与`payload`或`error`之一；事件信封没有关联id。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub topic: String,
    pub kind: EnvelopeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ResponseStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// 构造请求信封，分配新的关联id
    pub fn request(operation: Operation, payload: serde_json::Value, reply_to: String) -> Self {
        Self {
            correlation_id: Some(Uuid::new_v4().to_string()),
            topic: operation.wire_name().to_string(),
            kind: EnvelopeKind::Request,
            reply_to: Some(reply_to),
            status: None,
            payload: Some(payload),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// 构造成功响应信封，携带原请求的关联id
    pub fn success(correlation_id: String, topic: String, payload: serde_json::Value) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            topic,
            kind: EnvelopeKind::Response,
            reply_to: None,
            status: Some(ResponseStatus::Success),
            payload: Some(payload),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// 构造错误响应信封
    pub fn failure(correlation_id: String, topic: String, message: String, code: u16) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            topic,
            kind: EnvelopeKind::Response,
            reply_to: None,
            status: Some(ResponseStatus::Error),
            payload: None,
            error: Some(ErrorDetail { message, code }),
            timestamp: Utc::now(),
        }
    }

    /// 构造fire-and-forget事件信封
    pub fn event(operation: Operation, payload: serde_json::Value) -> Self {
        Self {
            correlation_id: None,
            topic: operation.wire_name().to_string(),
            kind: EnvelopeKind::Event,
            reply_to: None,
            status: None,
            payload: Some(payload),
            error: None,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_envelope_has_fresh_correlation_id() {
        let a = Envelope::request(
            Operation::GetSettings,
            serde_json::json!({}),
            "gw.reply.1".to_string(),
        );
        let b = Envelope::request(
            Operation::GetSettings,
            serde_json::json!({}),
            "gw.reply.1".to_string(),
        );
        assert_ne!(a.correlation_id, b.correlation_id);
        assert_eq!(a.kind, EnvelopeKind::Request);
        assert_eq!(a.reply_to.as_deref(), Some("gw.reply.1"));
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let env = Envelope::failure(
            "c-1".to_string(),
            "get-settings".to_string(),
            "boom".to_string(),
            500,
        );
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["correlationId"], "c-1");
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["code"], 500);
        // 成功载荷字段在错误信封中不应出现
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn test_event_envelope_has_no_correlation() {
        let env = Envelope::event(
            Operation::TransactionLogEvent,
            serde_json::json!({"tx": "0xabc"}),
        );
        assert!(env.correlation_id.is_none());
        assert_eq!(env.kind, EnvelopeKind::Event);
    }
}
