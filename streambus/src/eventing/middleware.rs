//! 中间件管道（Middleware Pipeline）
//!
//! 中间件包裹消息处理，承载横切逻辑（度量、追踪、过滤等）：
//! - 按注册顺序记录，先注册者位于最外层、最先执行；
//! - 中间件通过调用 `next.run(..)` 将处理向内传递，不调用即短路本条消息；
//! - `Pipeline` 在订阅时由中间件快照构建，构建后不可变，之后注册的中间件不影响它。
//!
use super::handler::{HandleFuture, Handler, MessageContext};
use crate::envelope::{Additional, Envelope};
use async_trait::async_trait;
use std::sync::Arc;

/// 中间件
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        ctx: &MessageContext,
        envelope: &Envelope,
        additional: &Additional,
        next: Next<'_>,
    ) -> anyhow::Result<()>;
}

/// 管道中剩余的部分：内层中间件与终端处理器
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    handler: &'a dyn Handler,
}

impl<'a> Next<'a> {
    /// 继续执行内层处理
    pub async fn run(
        self,
        ctx: &MessageContext,
        envelope: &Envelope,
        additional: &Additional,
    ) -> anyhow::Result<()> {
        match self.middlewares.split_first() {
            Some((outer, inner)) => {
                let next = Next {
                    middlewares: inner,
                    handler: self.handler,
                };
                outer.handle(ctx, envelope, additional, next).await
            }
            None => self.handler.handle(ctx, envelope, additional).await,
        }
    }
}

/// 已构建的处理管道
#[derive(Clone)]
pub struct Pipeline {
    middlewares: Arc<[Arc<dyn Middleware>]>,
    handler: Arc<dyn Handler>,
}

impl Pipeline {
    pub fn new(middlewares: &[Arc<dyn Middleware>], handler: Arc<dyn Handler>) -> Self {
        Self {
            middlewares: middlewares.into(),
            handler,
        }
    }

    pub fn handler_name(&self) -> &str {
        self.handler.handler_name()
    }

    pub async fn dispatch(
        &self,
        ctx: &MessageContext,
        envelope: &Envelope,
        additional: &Additional,
    ) -> anyhow::Result<()> {
        Next {
            middlewares: &self.middlewares,
            handler: self.handler.as_ref(),
        }
        .run(ctx, envelope, additional)
        .await
    }
}

/// 闭包形式的中间件
pub struct MiddlewareFn<F> {
    f: F,
}

pub fn middleware_fn<F>(f: F) -> MiddlewareFn<F>
where
    F: for<'a> Fn(&'a MessageContext, &'a Envelope, &'a Additional, Next<'a>) -> HandleFuture<'a>
        + Send
        + Sync,
{
    MiddlewareFn { f }
}

#[async_trait]
impl<F> Middleware for MiddlewareFn<F>
where
    F: for<'a> Fn(&'a MessageContext, &'a Envelope, &'a Additional, Next<'a>) -> HandleFuture<'a>
        + Send
        + Sync,
{
    async fn handle(
        &self,
        ctx: &MessageContext,
        envelope: &Envelope,
        additional: &Additional,
        next: Next<'_>,
    ) -> anyhow::Result<()> {
        (self.f)(ctx, envelope, additional, next).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventing::handler_fn;
    use std::sync::Mutex;

    type Calls = Arc<Mutex<Vec<String>>>;

    struct Recording {
        tag: &'static str,
        calls: Calls,
    }

    #[async_trait]
    impl Middleware for Recording {
        async fn handle(
            &self,
            ctx: &MessageContext,
            envelope: &Envelope,
            additional: &Additional,
            next: Next<'_>,
        ) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("{}:pre", self.tag));
            let res = next.run(ctx, envelope, additional).await;
            self.calls.lock().unwrap().push(format!("{}:post", self.tag));
            res
        }
    }

    struct Swallow;

    #[async_trait]
    impl Middleware for Swallow {
        async fn handle(
            &self,
            _ctx: &MessageContext,
            _envelope: &Envelope,
            _additional: &Additional,
            _next: Next<'_>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Terminal {
        calls: Calls,
        fail: bool,
    }

    #[async_trait]
    impl Handler for Terminal {
        fn handler_name(&self) -> &str {
            "terminal"
        }

        async fn handle(
            &self,
            _ctx: &MessageContext,
            _envelope: &Envelope,
            _additional: &Additional,
        ) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("handler".into());
            if self.fail {
                anyhow::bail!("terminal failed");
            }
            Ok(())
        }
    }

    fn ctx() -> MessageContext {
        MessageContext::builder()
            .channel("orders")
            .group("orders:terminal")
            .consumer("orders:terminal:c1")
            .message_id("1-0")
            .build()
    }

    fn recording(tag: &'static str, calls: &Calls) -> Arc<dyn Middleware> {
        Arc::new(Recording {
            tag,
            calls: calls.clone(),
        })
    }

    #[tokio::test]
    async fn first_registered_runs_outermost() {
        let calls = Calls::default();
        let handler = Arc::new(Terminal {
            calls: calls.clone(),
            fail: false,
        });
        let pipeline = Pipeline::new(&[recording("A", &calls), recording("B", &calls)], handler);

        let envelope = Envelope::raw("orders", Vec::new());
        pipeline
            .dispatch(&ctx(), &envelope, &Additional::new())
            .await
            .unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["A:pre", "B:pre", "handler", "B:post", "A:post"]
        );
    }

    #[tokio::test]
    async fn repeated_dispatch_is_stable() {
        let calls = Calls::default();
        let handler = Arc::new(Terminal {
            calls: calls.clone(),
            fail: false,
        });
        let pipeline = Pipeline::new(&[recording("A", &calls), recording("B", &calls)], handler);
        let envelope = Envelope::raw("orders", Vec::new());

        for _ in 0..2 {
            pipeline
                .dispatch(&ctx(), &envelope, &Additional::new())
                .await
                .unwrap();
        }

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 10);
        assert_eq!(calls[..5], calls[5..]);
    }

    #[tokio::test]
    async fn skipping_next_short_circuits() {
        let calls = Calls::default();
        let handler = Arc::new(Terminal {
            calls: calls.clone(),
            fail: false,
        });
        let pipeline = Pipeline::new(&[recording("A", &calls), Arc::new(Swallow)], handler);

        let envelope = Envelope::raw("orders", Vec::new());
        pipeline
            .dispatch(&ctx(), &envelope, &Additional::new())
            .await
            .unwrap();

        assert_eq!(*calls.lock().unwrap(), vec!["A:pre", "A:post"]);
    }

    #[tokio::test]
    async fn handler_error_propagates_through_chain() {
        let calls = Calls::default();
        let handler = Arc::new(Terminal {
            calls: calls.clone(),
            fail: true,
        });
        let pipeline = Pipeline::new(&[recording("A", &calls)], handler);

        let envelope = Envelope::raw("orders", Vec::new());
        let err = pipeline
            .dispatch(&ctx(), &envelope, &Additional::new())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "terminal failed");
        assert_eq!(*calls.lock().unwrap(), vec!["A:pre", "handler", "A:post"]);
    }

    #[tokio::test]
    async fn closures_compose() {
        let seen: Calls = Calls::default();
        let tagger = middleware_fn(|ctx, envelope, additional, next| {
            Box::pin(async move {
                let mut additional = additional.clone();
                additional.insert("tagged".into(), "yes".into());
                next.run(ctx, envelope, &additional).await
            })
        });

        let sink = seen.clone();
        let handler = handler_fn("closure", move |_ctx, _envelope, additional| {
            let sink = sink.clone();
            let tagged = additional.get("tagged").cloned().unwrap_or_default();
            Box::pin(async move {
                sink.lock().unwrap().push(tagged);
                Ok::<(), anyhow::Error>(())
            })
        });

        let pipeline = Pipeline::new(&[Arc::new(tagger)], Arc::new(handler));
        assert_eq!(pipeline.handler_name(), "closure");

        let envelope = Envelope::raw("orders", Vec::new());
        pipeline
            .dispatch(&ctx(), &envelope, &Additional::new())
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["yes"]);
    }
}
