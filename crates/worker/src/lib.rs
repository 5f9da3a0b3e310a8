//! # Courier Worker
//!
//! 任务执行Worker：
//! - 通过实例唯一subject接收分发，同一时刻只执行一个任务，
//!   忙碌时直接拒绝
//! - 按错误分类做有界指数退避重试
//! - 执行期间发布Started/Progress事件，完成后发射遥测事件
//! - 周期心跳维持注册表中的可用性

pub mod executors;
pub mod service;

pub use executors::{
    CredentialExecutor, ExecutionContext, InMemoryLedger, LedgerClient, OperationExecutor,
    TransactionExecutor,
};
pub use service::{resolve_instance_id, WorkerService, WorkerServiceBuilder};
