use super::{DurationRecorder, LogDurationRecorder, milliseconds, status};
use crate::envelope::{Additional, Envelope};
use crate::error::BusResult;
use crate::eventing::{
    ConsumeError, Handler, MessageContext, Middleware, Next, Publisher, Subscriber,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub const PUBLISH_TIME: &str = "bus.publish_time";
pub const SUBSCRIBE_TIME: &str = "bus.subscribe_time";
pub const HANDLE_TIME: &str = "bus.handle_time";

const UNIT: &str = "ms";

/// 度量装饰器
///
/// 构造时向被包裹的总线最外层注入一个计时中间件（`bus.handle_time`），
/// 并对 `publish` / `subscribe` 计时（`bus.publish_time` / `bus.subscribe_time`），
/// 返回值原样透传。
pub struct MetricsBus<B> {
    inner: B,
    recorder: Arc<dyn DurationRecorder>,
}

impl<B> MetricsBus<B>
where
    B: Publisher + Subscriber,
{
    pub fn new(inner: B, recorder: Arc<dyn DurationRecorder>) -> Self {
        // 外层装饰器的中间件先执行
        inner.prepend_middleware(vec![Arc::new(MetricsMiddleware {
            recorder: recorder.clone(),
        })]);

        Self { inner, recorder }
    }

    /// 以 `tracing` 事件输出度量
    pub fn logged(inner: B) -> Self {
        Self::new(inner, Arc::new(LogDurationRecorder))
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

#[async_trait]
impl<B> Publisher for MetricsBus<B>
where
    B: Publisher + Subscriber,
{
    async fn publish(&self, envelope: &Envelope) -> BusResult<()> {
        let start = Instant::now();
        let res = self.inner.publish(envelope).await;

        let labels = [
            ("event_id", envelope.id().to_string()),
            ("event_name", envelope.name().to_string()),
            ("status", status(&res).to_string()),
        ];
        self.recorder
            .record(PUBLISH_TIME, milliseconds(start.elapsed()), UNIT, &labels);

        res
    }
}

#[async_trait]
impl<B> Subscriber for MetricsBus<B>
where
    B: Publisher + Subscriber,
{
    fn middleware(&self, middlewares: Vec<Arc<dyn Middleware>>) {
        self.inner.middleware(middlewares);
    }

    fn prepend_middleware(&self, middlewares: Vec<Arc<dyn Middleware>>) {
        self.inner.prepend_middleware(middlewares);
    }

    async fn subscribe(&self, channel: &str, handler: Arc<dyn Handler>) -> BusResult<()> {
        let start = Instant::now();
        let handler_name = handler.handler_name().to_string();
        let res = self.inner.subscribe(channel, handler).await;

        let labels = [
            ("event_name", channel.to_string()),
            ("handler", handler_name),
            ("status", status(&res).to_string()),
        ];
        self.recorder
            .record(SUBSCRIBE_TIME, milliseconds(start.elapsed()), UNIT, &labels);

        res
    }

    async fn stop(&self, timeout: Duration) -> BusResult<()> {
        self.inner.stop(timeout).await
    }

    fn errors(&self) -> Option<mpsc::Receiver<ConsumeError>> {
        self.inner.errors()
    }
}

struct MetricsMiddleware {
    recorder: Arc<dyn DurationRecorder>,
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    async fn handle(
        &self,
        ctx: &MessageContext,
        envelope: &Envelope,
        additional: &Additional,
        next: Next<'_>,
    ) -> anyhow::Result<()> {
        let start = Instant::now();
        let res = next.run(ctx, envelope, additional).await;

        let labels = [
            ("event_id", envelope.id().to_string()),
            ("event_name", envelope.name().to_string()),
            ("status", status(&res).to_string()),
        ];
        self.recorder
            .record(HANDLE_TIME, milliseconds(start.elapsed()), UNIT, &labels);

        res
    }
}
