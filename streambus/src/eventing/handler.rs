//! 消息处理器（Handler）
//!
//! 定义订阅方的处理逻辑与其稳定名称；名称参与订阅去重键与消费组命名，
//! 也用于可观测性标签，应保持稳定（不要依赖 `type_name`）。
//!
use crate::envelope::{Additional, Envelope};
use async_trait::async_trait;
use bon::Builder;
use futures_core::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// 单条消息的处理上下文
#[derive(Builder, Clone, Debug)]
pub struct MessageContext {
    #[builder(into)]
    channel: String,
    #[builder(into)]
    group: String,
    #[builder(into)]
    consumer: String,
    /// 存储分配的消息 ID
    #[builder(into)]
    message_id: String,
    /// 总线级取消令牌，关闭时被触发
    #[builder(default)]
    cancel: CancellationToken,
}

impl MessageContext {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// 消息处理器
#[async_trait]
pub trait Handler: Send + Sync {
    /// 处理器稳定名称（用于订阅键、消费组与观测标签）
    fn handler_name(&self) -> &str;

    /// 处理消息；返回 `BusError::Cancelled` 表示因关闭而中止，不会被上报
    async fn handle(
        &self,
        ctx: &MessageContext,
        envelope: &Envelope,
        additional: &Additional,
    ) -> anyhow::Result<()>;
}

pub type HandleFuture<'a> = BoxFuture<'a, anyhow::Result<()>>;

/// 闭包形式的处理器
pub struct HandlerFn<F> {
    name: String,
    f: F,
}

/// 以闭包构造处理器：
/// ```ignore
/// let h = handler_fn("order-projector", |_ctx, env, _add| {
///     Box::pin(async move { println!("{}", env.id()); Ok::<_, anyhow::Error>(()) })
/// });
/// ```
pub fn handler_fn<F>(name: impl Into<String>, f: F) -> HandlerFn<F>
where
    F: for<'a> Fn(&'a MessageContext, &'a Envelope, &'a Additional) -> HandleFuture<'a>
        + Send
        + Sync,
{
    HandlerFn {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F> Handler for HandlerFn<F>
where
    F: for<'a> Fn(&'a MessageContext, &'a Envelope, &'a Additional) -> HandleFuture<'a>
        + Send
        + Sync,
{
    fn handler_name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        ctx: &MessageContext,
        envelope: &Envelope,
        additional: &Additional,
    ) -> anyhow::Result<()> {
        (self.f)(ctx, envelope, additional).await
    }
}
