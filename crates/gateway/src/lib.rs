//! # Courier Gateway
//!
//! 平台的对外入口，基于Axum构建，包括：
//! - 任务编排：`POST /api/tasks`受理长耗时操作，立即返回任务
//!   句柄，后台经broker分发到Worker
//! - 任务查询与Worker注册表查询
//! - 设置服务的HTTP透传
//! - `GET /ws`：realtime任务推送，按任务id订阅
//!
//! ## API 端点
//!
//! - `GET /health` - 健康检查
//! - `POST /api/tasks` - 受理异步任务
//! - `GET /api/tasks` - 任务列表
//! - `GET /api/tasks/{id}` - 任务详情
//! - `GET /api/workers` - Worker注册表快照
//! - `GET /api/settings` - 读取平台设置（透传）
//! - `POST /api/settings` - 更新平台设置（透传）
//! - `GET /api/environment` - 当前账本环境（透传）
//! - `GET /ws` - realtime任务推送

pub mod error;
pub mod handlers;
pub mod notifier;
pub mod response;
pub mod routes;
pub mod settings;
pub mod task_manager;
pub mod ws;

pub use error::ApiError;
pub use notifier::Notifier;
pub use response::ApiResponse;
pub use routes::{create_app, AppState};
pub use settings::SettingsService;
pub use task_manager::TaskManager;
