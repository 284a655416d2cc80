use super::{LogSpanRecorder, SpanKind, SpanRecorder};
use crate::envelope::{Additional, Envelope};
use crate::error::BusResult;
use crate::eventing::{
    ConsumeError, Handler, MessageContext, Middleware, Next, Publisher, Subscriber,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::Instrument;

/// 追踪装饰器
///
/// 构造时向被包裹的总线最外层注入一个追踪中间件，每条消息一个 `handle.Event(..)` 消费跨度；
/// `publish` 与 `subscribe` 分别包裹在生产者跨度与内部跨度中，失败时标注错误。
pub struct TracingBus<B> {
    inner: B,
    recorder: Arc<dyn SpanRecorder>,
}

impl<B> TracingBus<B>
where
    B: Publisher + Subscriber,
{
    pub fn new(inner: B, recorder: Arc<dyn SpanRecorder>) -> Self {
        // 外层装饰器的中间件先执行
        inner.prepend_middleware(vec![Arc::new(TracingMiddleware {
            recorder: recorder.clone(),
        })]);

        Self { inner, recorder }
    }

    /// 以 `tracing` 跨度承载追踪
    pub fn logged(inner: B) -> Self {
        Self::new(inner, Arc::new(LogSpanRecorder))
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

#[async_trait]
impl<B> Publisher for TracingBus<B>
where
    B: Publisher + Subscriber,
{
    async fn publish(&self, envelope: &Envelope) -> BusResult<()> {
        let mut span = self.recorder.start(
            format!("publish.Event({})", envelope.name()),
            SpanKind::Producer,
            vec![
                ("event_id", envelope.id().to_string()),
                ("event_name", envelope.name().to_string()),
            ],
        );

        let res = self
            .inner
            .publish(envelope)
            .instrument(span.tracing_span())
            .await;

        if let Err(err) = &res {
            span.record_error(err);
        }
        res
    }
}

#[async_trait]
impl<B> Subscriber for TracingBus<B>
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
        let handler_name = handler.handler_name().to_string();
        let mut span = self.recorder.start(
            format!("subscribe.Handler({handler_name})"),
            SpanKind::Internal,
            vec![
                ("event_name", channel.to_string()),
                ("handler", handler_name),
            ],
        );

        let res = self
            .inner
            .subscribe(channel, handler)
            .instrument(span.tracing_span())
            .await;

        if let Err(err) = &res {
            span.record_error(err);
        }
        res
    }

    async fn stop(&self, timeout: Duration) -> BusResult<()> {
        self.inner.stop(timeout).await
    }

    fn errors(&self) -> Option<mpsc::Receiver<ConsumeError>> {
        self.inner.errors()
    }
}

struct TracingMiddleware {
    recorder: Arc<dyn SpanRecorder>,
}

#[async_trait]
impl Middleware for TracingMiddleware {
    async fn handle(
        &self,
        ctx: &MessageContext,
        envelope: &Envelope,
        additional: &Additional,
        next: Next<'_>,
    ) -> anyhow::Result<()> {
        let mut span = self.recorder.start(
            format!("handle.Event({})", envelope.name()),
            SpanKind::Consumer,
            vec![
                ("event_id", envelope.id().to_string()),
                ("event_name", envelope.name().to_string()),
            ],
        );

        let res = next
            .run(ctx, envelope, additional)
            .instrument(span.tracing_span())
            .await;

        if let Err(err) = &res {
            span.record_error(err);
        }
        res
    }
}
