//! # Courier
//!
//! 基于消息代理的微服务RPC与异步任务编排平台的组装层：
//! 按运行模式装配网关与Worker组件，并提供优雅关闭。

pub mod app;
pub mod shutdown;

pub use app::{AppMode, Application};
pub use shutdown::ShutdownManager;
