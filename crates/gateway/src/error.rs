use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use courier_errors::CourierError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("平台错误: {0}")]
    Courier(#[from] CourierError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            ApiError::Courier(e) => {
                let status = StatusCode::from_u16(e.code())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (status, error_type_of(e), e.to_string())
            }
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone())
            }
            ApiError::Serialization(e) => (
                StatusCode::BAD_REQUEST,
                "SERIALIZATION_ERROR",
                e.to_string(),
            ),
        };

        let body = Json(json!({
            "success": false,
            "error": {
                "code": error_type,
                "message": message,
            },
            "timestamp": chrono::Utc::now(),
        }));

        (status, body).into_response()
    }
}

fn error_type_of(e: &CourierError) -> &'static str {
    match e {
        CourierError::Validation(_) => "VALIDATION_ERROR",
        CourierError::TaskNotFound { .. } => "TASK_NOT_FOUND",
        CourierError::WorkerBusy { .. } => "WORKER_BUSY",
        CourierError::NoWorkerAvailable => "NO_WORKER_AVAILABLE",
        CourierError::Timeout(_) => "TIMEOUT",
        CourierError::TransientExhausted(_) => "RETRIES_EXHAUSTED",
        CourierError::ConnectionLost => "BROKER_UNAVAILABLE",
        CourierError::Broker(_) | CourierError::Transient(_) => "UPSTREAM_ERROR",
        _ => "INTERNAL_ERROR",
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_follows_error_code() {
        let resp = ApiError::Courier(CourierError::task_not_found("42")).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = ApiError::Courier(CourierError::NoWorkerAvailable).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = ApiError::Courier(CourierError::WorkerBusy {
            id: "w-1".to_string(),
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
