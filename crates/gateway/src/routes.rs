use axum::extract::DefaultBodyLimit;
use axum::{
    routing::get,
    Router,
};
use courier_broker::{BrokerChannel, WorkerRegistry};
use courier_config::GatewayConfig;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{
    create_task, get_environment, get_settings, get_task, health, list_tasks, list_workers,
    update_settings,
};
use crate::notifier::Notifier;
use crate::task_manager::TaskManager;
use crate::ws::ws_upgrade;

/// 网关应用状态
#[derive(Clone)]
pub struct AppState {
    pub task_manager: Arc<TaskManager>,
    pub registry: Arc<WorkerRegistry>,
    pub notifier: Arc<Notifier>,
    pub channel: Arc<BrokerChannel>,
}

/// 创建网关应用
pub fn create_app(state: AppState, config: &GatewayConfig) -> Router {
    let mut router = Router::new()
        // 健康检查
        .route("/health", get(health))
        // 任务编排API
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}", get(get_task))
        // Worker注册表
        .route("/api/workers", get(list_workers))
        // 设置透传
        .route("/api/settings", get(get_settings).post(update_settings))
        .route("/api/environment", get(get_environment))
        // realtime推送
        .route("/ws", get(ws_upgrade))
        .layer(DefaultBodyLimit::max(
            config.max_request_size_mb * 1024 * 1024,
        ))
        .layer(TraceLayer::new_for_http());

    if config.cors_enabled {
        router = router.layer(CorsLayer::permissive());
    }

    router.with_state(state)
}
