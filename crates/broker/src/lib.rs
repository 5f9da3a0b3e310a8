//! # Courier Broker
//!
//! 消息代理之上的通信基础设施：
//! - [`MessageBus`]：pub/sub传输抽象，提供内存实现（嵌入式部署、测试）
//!   与AMQP实现（生产部署）
//! - [`BrokerChannel`]：在fire-and-forget的pub/sub之上实现带关联id、
//!   超时与类型化成败结果的request/response RPC
//! - [`StateReporter`]：进程生命周期状态机及其广播
//! - [`WorkerRegistry`]：基于广播维护的Worker注册缓存
//!
//! 所有subject均为fanout语义；点对点投递通过实例唯一subject实现。

pub mod amqp;
pub mod bus;
pub mod channel;
pub mod registry;
pub mod state;

pub use amqp::AmqpBus;
pub use bus::{BusEvent, BusMessage, InMemoryBus, MessageBus};
pub use channel::{BrokerChannel, FnHandler, RequestHandler};
pub use registry::WorkerRegistry;
pub use state::StateReporter;
