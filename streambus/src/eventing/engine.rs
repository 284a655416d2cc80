//! 订阅引擎（StreamBus）
//!
//! 基于追加日志存储实现 `Publisher` + `Subscriber`：
//! - 订阅时确保消费组存在（已存在视为成功），以中间件快照构建处理管道；
//! - 每个订阅一个独立的消费任务，先回放本消费者的积压消息，再切换到仅新消息；
//! - 处理成功即确认，失败不确认，交由存储自身的消费组重投语义；
//! - 运行期错误以失败记录投递到有界错误通道，通道满时交给兜底上报器；
//! - 所有任务共享一个取消令牌，`stop` 取消后等待任务全部退出再关闭错误通道。
//!
use super::handler::{Handler, MessageContext};
use super::middleware::{Middleware, Pipeline};
use super::report::{ErrorReporter, ErrorSink, log_reporter};
use super::{Publisher, Subscriber};
use crate::envelope::{Envelope, decode, encode};
use crate::error::{BusError, BusResult, ConsumeError, is_cancellation};
use crate::store::{AppendOptions, GroupStart, LogStore, ReadCursor, ReadRequest, StoreMessage};
use async_trait::async_trait;
use bon::bon;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// 引擎配置
#[derive(Clone, Debug)]
pub struct StreamBusConfig {
    /// 本实例的客户端标识，消费者名为 `{group}:{client_id}`
    pub client_id: String,
    /// 错误通道容量
    pub error_buffer: usize,
    /// 读取失败后的固定退避
    pub read_backoff: Duration,
    /// 单批读取条数，`None` 由存储决定
    pub read_count: Option<usize>,
    /// 无新消息时单次读取的阻塞时长，`None` 一直等到有新消息
    pub read_block: Option<Duration>,
    /// 新建消费组的起始位置
    pub group_start: GroupStart,
    /// 发布时的追加选项
    pub append: AppendOptions,
}

impl Default for StreamBusConfig {
    fn default() -> Self {
        Self {
            client_id: Uuid::new_v4().simple().to_string(),
            error_buffer: 100,
            read_backoff: Duration::from_secs(1),
            read_count: None,
            read_block: Some(Duration::from_secs(5)),
            group_start: GroupStart::Latest,
            append: AppendOptions::default(),
        }
    }
}

#[derive(Default)]
struct Registry {
    registered: HashSet<String>,
    middlewares: Vec<Arc<dyn Middleware>>,
}

struct Shared {
    store: Arc<dyn LogStore>,
    config: StreamBusConfig,
    fallback: ErrorReporter,
    registry: Mutex<Registry>,
    errors_tx: Mutex<Option<mpsc::Sender<ConsumeError>>>,
    errors_rx: Mutex<Option<mpsc::Receiver<ConsumeError>>>,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn errors_tx(&self) -> MutexGuard<'_, Option<mpsc::Sender<ConsumeError>>> {
        self.errors_tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn errors_rx(&self) -> MutexGuard<'_, Option<mpsc::Receiver<ConsumeError>>> {
        self.errors_rx.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// 基于追加日志的总线引擎，克隆后共享同一实例
#[derive(Clone)]
pub struct StreamBus {
    shared: Arc<Shared>,
}

#[bon]
impl StreamBus {
    #[builder]
    pub fn new(
        store: Arc<dyn LogStore>,
        #[builder(default)] config: StreamBusConfig,
        fallback: Option<ErrorReporter>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.error_buffer.max(1));

        Self {
            shared: Arc::new(Shared {
                store,
                config,
                fallback: fallback.unwrap_or_else(log_reporter),
                registry: Mutex::new(Registry::default()),
                errors_tx: Mutex::new(Some(tx)),
                errors_rx: Mutex::new(Some(rx)),
                token: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }
}

impl StreamBus {
    pub fn client_id(&self) -> &str {
        &self.shared.config.client_id
    }

    pub fn config(&self) -> &StreamBusConfig {
        &self.shared.config
    }

    /// 是否已调用过 `stop`
    pub fn is_stopped(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    async fn ensure_group(&self, channel: &str, group: &str) -> BusResult<()> {
        let start = self.shared.config.group_start;

        match self.shared.store.create_group(channel, group, start).await {
            Ok(()) => {
                debug!(channel, group, "consumer group created");
                Ok(())
            }
            Err(BusError::GroupAlreadyExists { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl Publisher for StreamBus {
    async fn publish(&self, envelope: &Envelope) -> BusResult<()> {
        envelope.validate()?;

        let append = &self.shared.config.append;
        let fields = encode(envelope, &append.values)?;
        let id = self
            .shared
            .store
            .append(envelope.name(), fields, append)
            .await?;

        trace!(channel = envelope.name(), id = %id, envelope_id = %envelope.id(), "envelope published");
        Ok(())
    }
}

#[async_trait]
impl Subscriber for StreamBus {
    fn middleware(&self, middlewares: Vec<Arc<dyn Middleware>>) {
        self.shared.registry().middlewares.extend(middlewares);
    }

    fn prepend_middleware(&self, middlewares: Vec<Arc<dyn Middleware>>) {
        let mut registry = self.shared.registry();
        let later = std::mem::replace(&mut registry.middlewares, middlewares);
        registry.middlewares.extend(later);
    }

    async fn subscribe(&self, channel: &str, handler: Arc<dyn Handler>) -> BusResult<()> {
        if channel.is_empty() {
            return Err(BusError::MissingName);
        }
        if handler.handler_name().is_empty() {
            return Err(BusError::MissingHandler);
        }
        if self.is_stopped() {
            return Err(BusError::Stopped);
        }

        let group = format!("{channel}:{}", handler.handler_name());

        if !self.shared.registry().registered.insert(group.clone()) {
            return Err(BusError::HandlerAlreadyAdded { key: group });
        }

        if let Err(err) = self.ensure_group(channel, &group).await {
            self.shared.registry().registered.remove(&group);
            return Err(err);
        }

        let tx = self.shared.errors_tx().clone();
        let Some(tx) = tx else {
            self.shared.registry().registered.remove(&group);
            return Err(BusError::Stopped);
        };

        let pipeline = {
            let registry = self.shared.registry();
            Pipeline::new(&registry.middlewares, handler)
        };

        let consumer = Consumer {
            store: self.shared.store.clone(),
            consumer: format!("{group}:{}", self.shared.config.client_id),
            channel: channel.to_string(),
            group,
            pipeline,
            sink: ErrorSink::new(tx, self.shared.fallback.clone()),
            token: self.shared.token.clone(),
            read_count: self.shared.config.read_count,
            read_block: self.shared.config.read_block,
            read_backoff: self.shared.config.read_backoff,
        };

        info!(
            channel = %consumer.channel,
            group = %consumer.group,
            consumer = %consumer.consumer,
            "subscription started"
        );
        self.shared.tracker.spawn(consumer.run());

        Ok(())
    }

    async fn stop(&self, timeout: Duration) -> BusResult<()> {
        self.shared.token.cancel();
        self.shared.tracker.close();

        let tx = self.shared.errors_tx().take();
        let tracker = self.shared.tracker.clone();
        let drained = tokio::spawn(async move {
            tracker.wait().await;
            drop(tx);
        });

        match tokio::time::timeout(timeout, drained).await {
            Ok(_) => info!(client_id = self.client_id(), "bus stopped"),
            Err(_) => warn!(
                client_id = self.client_id(),
                ?timeout,
                "stop deadline elapsed, consumers are still finishing"
            ),
        }

        Ok(())
    }

    fn errors(&self) -> Option<mpsc::Receiver<ConsumeError>> {
        self.shared.errors_rx().take()
    }
}

/// 单个订阅的消费任务
struct Consumer {
    store: Arc<dyn LogStore>,
    channel: String,
    group: String,
    consumer: String,
    pipeline: Pipeline,
    sink: ErrorSink,
    token: CancellationToken,
    read_count: Option<usize>,
    read_block: Option<Duration>,
    read_backoff: Duration,
}

impl Consumer {
    async fn run(self) {
        let mut cursor = ReadCursor::backlog_start();

        loop {
            if self.token.is_cancelled() {
                break;
            }

            let request = ReadRequest {
                channel: &self.channel,
                group: &self.group,
                consumer: &self.consumer,
                cursor: &cursor,
                count: self.read_count,
                block: self.read_block,
            };

            let read = tokio::select! {
                _ = self.token.cancelled() => break,
                read = self.store.read_group(&request) => read,
            };

            let messages = match read {
                Ok(messages) => messages,
                Err(err) if err.is_cancelled() => break,
                Err(err) => {
                    warn!(
                        channel = %self.channel,
                        group = %self.group,
                        consumer = %self.consumer,
                        error = %err,
                        "read failed, backing off"
                    );
                    self.sink.report(self.failure(err));

                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(self.read_backoff) => continue,
                    }
                }
            };

            if messages.is_empty() {
                if cursor.is_backlog() {
                    debug!(
                        channel = %self.channel,
                        consumer = %self.consumer,
                        "backlog drained, switching to new messages"
                    );
                    cursor = ReadCursor::New;
                } else {
                    // 存储立即返回空批次时让出执行权
                    tokio::task::yield_now().await;
                }
                continue;
            }

            for message in messages {
                if cursor.is_backlog() {
                    cursor = ReadCursor::Backlog(message.id.clone());
                }

                self.process(message).await;

                if self.token.is_cancelled() {
                    break;
                }
            }
        }

        self.store.release_consumer(&self.consumer);
        info!(
            channel = %self.channel,
            group = %self.group,
            consumer = %self.consumer,
            "subscription stopped"
        );
    }

    fn failure(&self, err: BusError) -> ConsumeError {
        ConsumeError::new(
            self.channel.as_str(),
            self.group.as_str(),
            self.consumer.as_str(),
            err,
        )
    }

    async fn process(&self, message: StoreMessage) {
        let (envelope, additional) = match decode(&message.fields) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.sink
                    .report(self.failure(err).with_message_id(message.id.as_str()));
                return;
            }
        };

        let located = |err: BusError| {
            self.failure(err)
                .with_message_id(message.id.as_str())
                .with_envelope(envelope.id(), envelope.date())
        };

        if let Err(err) = envelope.validate() {
            self.sink.report(located(BusError::InvalidEnvelope {
                source: Box::new(err),
            }));
            return;
        }

        let ctx = MessageContext::builder()
            .channel(self.channel.as_str())
            .group(self.group.as_str())
            .consumer(self.consumer.as_str())
            .message_id(message.id.as_str())
            .cancel(self.token.clone())
            .build();

        if let Err(err) = self.pipeline.dispatch(&ctx, &envelope, &additional).await {
            if !is_cancellation(&err) {
                self.sink.report(located(BusError::Handler {
                    handler: self.pipeline.handler_name().to_string(),
                    reason: err,
                }));
            }
            return;
        }

        match self
            .store
            .ack(&self.channel, &self.group, &[message.id.as_str()])
            .await
        {
            Ok(_) => trace!(channel = %self.channel, id = %message.id, "message acked"),
            Err(err) if err.is_cancelled() => {}
            Err(err) => self.sink.report(located(err)),
        }
    }
}
