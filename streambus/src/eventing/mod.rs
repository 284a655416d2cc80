//! 事件子系统（eventing）
//!
//! 提供发布/订阅的协议与运行时：
//! - `Publisher` / `Subscriber` / `Bus`：统一的总线接口，引擎与装饰器共用；
//! - `Handler`：订阅方处理器，带稳定名称；
//! - `Middleware` / `Pipeline`：包裹处理器的中间件链，先注册者在最外层；
//! - `StreamBus`：基于追加日志存储的订阅引擎（消费组、积压回放、确认、失败上报）；
//! - `report`：有界错误通道的上报端与消费辅助。
//!
pub mod bus;
pub mod engine;
pub mod handler;
pub mod middleware;
pub mod report;

pub use crate::error::ConsumeError;
pub use bus::{Bus, Publisher, Subscriber};
pub use engine::{StreamBus, StreamBusConfig};
pub use handler::{HandleFuture, Handler, HandlerFn, MessageContext, handler_fn};
pub use middleware::{Middleware, MiddlewareFn, Next, Pipeline, middleware_fn};
pub use report::{ErrorReporter, error_stream, handle_errors, log_reporter};
