//! # Courier Domain
//!
//! courier平台的领域模型：线上信封格式、封闭的操作枚举、
//! 任务与Worker实体、应用生命周期状态以及任务事件。
//!
//! 所有服务之间只通过消息代理通信，这里定义的类型即是
//! 服务间协议的唯一来源。

pub mod entities;
pub mod envelope;
pub mod events;
pub mod operations;

pub use entities::{
    ApplicationStatus, StateReport, Task, TaskStatus, WorkerRegistration,
};
pub use envelope::{Envelope, EnvelopeKind, ErrorDetail, ResponseStatus};
pub use events::{DispatchRequest, TaskEvent, TaskUpdate};
pub use operations::Operation;
