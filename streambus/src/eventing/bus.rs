//! 总线（Bus）协议
//!
//! 发布端与订阅端的统一抽象。引擎（`StreamBus`）与装饰器（`MetricsBus`、
//! `TracingBus`）均实现同一组能力，因此可以任意叠加。
//!
use super::{ConsumeError, Handler, Middleware};
use crate::{envelope::Envelope, error::BusResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// 发布端
#[async_trait]
pub trait Publisher: Send + Sync {
    /// 校验并追加信封到以 `envelope.name()` 命名的通道
    async fn publish(&self, envelope: &Envelope) -> BusResult<()>;
}

/// 订阅端
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// 追加中间件；只影响此后创建的订阅
    fn middleware(&self, middlewares: Vec<Arc<dyn Middleware>>);

    /// 把中间件插到已注册中间件之前（处于最外层）；只影响此后创建的订阅
    fn prepend_middleware(&self, middlewares: Vec<Arc<dyn Middleware>>);

    /// 在通道上为处理器创建消费组并启动消费任务
    async fn subscribe(&self, channel: &str, handler: Arc<dyn Handler>) -> BusResult<()>;

    /// 取消全部消费任务并等待其结束，最长等待 `timeout`；
    /// 超时提前返回时后台等待仍会继续，结束后关闭错误通道
    async fn stop(&self, timeout: Duration) -> BusResult<()>;

    /// 取走错误通道的接收端；仅首次调用返回 `Some`
    fn errors(&self) -> Option<mpsc::Receiver<ConsumeError>>;
}

/// 同时具备发布与订阅能力的总线
pub trait Bus: Publisher + Subscriber {}

impl<T> Bus for T where T: Publisher + Subscriber {}
