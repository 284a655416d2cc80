//! 基于追加日志的发布/订阅总线（streambus）
//!
//! 以支持消费组语义的有序、可重放追加日志（如 Redis Streams）为底座，提供：
//! - 信封（`envelope`）：不可变的传输单元，含校验与线上格式；
//! - 事件子系统（`eventing`）：总线协议、处理器、中间件管道与订阅引擎 `StreamBus`；
//! - 存储协议（`store`）：`LogStore` 及内存实现，`redis` 特性下提供 Redis Streams 实现；
//! - 可观测性（`observe`）：度量与追踪装饰器，可与引擎任意叠加。
//!
//! 投递语义为至少一次：处理成功才确认，失败的消息保留在消费组的待确认集合中，
//! 在消费者重启回放积压时再次投递。
//!
//! 典型用法：
//! 1. 选择一个 `LogStore` 实现，构建 `StreamBus::builder().store(..).build()`；
//! 2. 按需以 `MetricsBus` / `TracingBus` 包裹，并注册中间件；
//! 3. 为每个通道 `subscribe` 具名处理器，并消费 `errors()` 返回的错误通道；
//! 4. 关闭时调用 `stop(timeout)`，等待消费任务退出。
//!
pub mod envelope;
pub mod error;
pub mod eventing;
pub mod observe;
pub mod store;
