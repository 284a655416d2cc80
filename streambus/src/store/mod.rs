//! 追加日志存储（LogStore）协议
//!
//! 抽象一个支持消费组语义的有序、可重放追加日志（例如 Redis Streams）：
//! - `append`：按保留/裁剪选项追加条目；
//! - `create_group`：在通道上创建消费组（已存在时返回 `GroupAlreadyExists`）；
//! - `read_group`：按游标读取下一批消息（历史积压 / 仅新消息）；
//! - `ack`：按 ID 确认消息，使其离开消费组的待确认集合。
//!
//! 存储自身的持久化、复制与重投策略不在本 crate 的职责范围内。
//!
mod inmemory;
mod options;
#[cfg(feature = "redis")]
mod redis_store;

pub use inmemory::InMemoryLogStore;
pub use options::AppendOptions;
#[cfg(feature = "redis")]
pub use redis_store::RedisLogStore;

use crate::{envelope::Fields, error::BusResult};
use async_trait::async_trait;
use std::time::Duration;

/// 新建消费组的起始位置
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GroupStart {
    /// 仅消费建组之后追加的消息（`$`）
    #[default]
    Latest,
    /// 从通道最早的消息开始（`0`）
    Earliest,
}

/// 读取游标
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadCursor {
    /// 本消费者已投递但未确认的积压消息，返回 ID 大于给定值的部分
    Backlog(String),
    /// 从未投递给组内任何消费者的新消息（`>`）
    New,
}

impl ReadCursor {
    /// 积压读取的起点
    pub fn backlog_start() -> Self {
        ReadCursor::Backlog("0-0".to_string())
    }

    pub fn is_backlog(&self) -> bool {
        matches!(self, ReadCursor::Backlog(_))
    }
}

/// 一次消费组读取请求
#[derive(Clone, Debug)]
pub struct ReadRequest<'a> {
    pub channel: &'a str,
    pub group: &'a str,
    pub consumer: &'a str,
    pub cursor: &'a ReadCursor,
    /// 单批最大条数，`None` 由存储决定
    pub count: Option<usize>,
    /// 新消息读取在无消息时的最长阻塞时长：`None` 一直等到有新条目，零表示立即返回；积压读取从不阻塞
    pub block: Option<Duration>,
}

/// 存储返回的一条消息
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreMessage {
    /// 存储分配的消息 ID（形如 `1700000000000-0`）
    pub id: String,
    /// 条目字段；条目已被裁剪时为空
    pub fields: Fields,
}

/// 追加日志存储：总线引擎依赖的最小外部协议
#[async_trait]
pub trait LogStore: Send + Sync {
    /// 追加一条条目，返回存储分配的 ID
    async fn append(&self, channel: &str, fields: Fields, options: &AppendOptions)
    -> BusResult<String>;

    /// 创建消费组（通道不存在时一并创建）；已存在时返回 `BusError::GroupAlreadyExists`
    async fn create_group(&self, channel: &str, group: &str, start: GroupStart) -> BusResult<()>;

    /// 读取下一批消息
    async fn read_group(&self, request: &ReadRequest<'_>) -> BusResult<Vec<StoreMessage>>;

    /// 确认消息，返回实际被确认的条数
    async fn ack(&self, channel: &str, group: &str, ids: &[&str]) -> BusResult<usize>;

    /// 消费者的消费任务结束，释放为其保留的资源（如独立读取连接）
    fn release_consumer(&self, _consumer: &str) {}
}
