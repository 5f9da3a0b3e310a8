use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use courier_domain::Operation;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::response::{accepted, success, ApiResponse};
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub operation: Operation,
    #[serde(default)]
    pub payload: Value,
    pub owner: Option<String>,
}

/// 受理异步任务，返回202与任务句柄
pub async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> ApiResult<impl IntoResponse> {
    if !request.operation.is_long_running() {
        return Err(ApiError::BadRequest(format!(
            "操作 {} 不是异步任务，请使用对应的同步接口",
            request.operation
        )));
    }

    let owner = request.owner.unwrap_or_else(|| "anonymous".to_string());
    let task = state
        .task_manager
        .start_task(request.operation, owner, request.payload)
        .await?;
    Ok(accepted(task))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let task = state.task_manager.get_task(id).await?;
    Ok(success(task))
}

pub async fn list_tasks(State(state): State<AppState>) -> impl IntoResponse {
    ApiResponse::success(state.task_manager.list_tasks().await)
}

/// Worker注册表快照，包含过期实例
pub async fn list_workers(State(state): State<AppState>) -> impl IntoResponse {
    ApiResponse::success(state.registry.all().await)
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    ApiResponse::success(json!({
        "status": "healthy",
        "tasks": state.task_manager.task_count().await,
        "workers": state.registry.eligible().await.len(),
        "realtimeConnections": state.notifier.connection_count().await,
    }))
}

/// 设置读取透传
pub async fn get_settings(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let settings = state
        .channel
        .request(Operation::GetSettings, json!({}), None)
        .await?;
    Ok(success(settings))
}

/// 设置更新透传
pub async fn update_settings(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let result = state
        .channel
        .request(Operation::UpdateSettings, body, None)
        .await?;
    Ok(success(result))
}

pub async fn get_environment(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let environment = state
        .channel
        .request(Operation::GetEnvironment, json!({}), None)
        .await?;
    Ok(success(environment))
}
