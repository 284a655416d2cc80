//! 总线统一错误定义
//!
//! 覆盖信封校验、编解码、存储、订阅注册、处理器与关闭取消等最小必要集合，
//! 并定义消费任务内部产生的失败记录 `ConsumeError`。
//!
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BusError {
    // --- 信封校验 ---
    #[error("missing id")]
    MissingId,
    #[error("missing timestamp")]
    MissingTimestamp,
    #[error("missing name")]
    MissingName,

    // --- 编解码 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("encoding error: {reason}")]
    Encoding { reason: String },
    #[error("invalid envelope: {source}")]
    InvalidEnvelope {
        #[source]
        source: Box<BusError>,
    },

    // --- 存储 ---
    #[error("store error: op={op}, reason={reason}")]
    Store { op: &'static str, reason: String },
    #[error("consumer group already exists: channel={channel}, group={group}")]
    GroupAlreadyExists { channel: String, group: String },

    // --- 订阅注册 ---
    #[error("missing handler name")]
    MissingHandler,
    #[error("handler already added: key={key}")]
    HandlerAlreadyAdded { key: String },
    #[error("bus stopped")]
    Stopped,

    // --- 处理器 ---
    #[error("handler error: handler={handler}, reason={reason:#}")]
    Handler {
        handler: String,
        reason: anyhow::Error,
    },

    // --- 关闭 ---
    #[error("operation cancelled")]
    Cancelled,
}

impl BusError {
    pub fn store(op: &'static str, reason: impl fmt::Display) -> Self {
        BusError::Store {
            op,
            reason: reason.to_string(),
        }
    }

    pub fn encoding(reason: impl fmt::Display) -> Self {
        BusError::Encoding {
            reason: reason.to_string(),
        }
    }

    /// 由关闭流程触发的取消，不视为失败
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BusError::Cancelled)
    }
}

/// 判断处理器返回的错误是否源自关闭取消
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<BusError>()
            .is_some_and(BusError::is_cancelled)
    })
}

/// 统一 Result 类型别名
pub type BusResult<T> = Result<T, BusError>;

impl From<uuid::Error> for BusError {
    fn from(err: uuid::Error) -> Self {
        BusError::encoding(err)
    }
}

impl From<base64::DecodeError> for BusError {
    fn from(err: base64::DecodeError) -> Self {
        BusError::encoding(err)
    }
}

impl From<chrono::ParseError> for BusError {
    fn from(err: chrono::ParseError) -> Self {
        BusError::encoding(err)
    }
}

/// 消费失败记录
///
/// 在消费任务内部首次发现失败时创建，按值投递到错误通道，此后不再修改。
#[derive(Debug, Error)]
pub struct ConsumeError {
    channel: String,
    group: String,
    consumer: String,
    message_id: Option<String>,
    envelope_id: Option<Uuid>,
    envelope_timestamp: Option<DateTime<Utc>>,
    #[source]
    error: BusError,
}

impl ConsumeError {
    pub fn new(
        channel: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        error: BusError,
    ) -> Self {
        Self {
            channel: channel.into(),
            group: group.into(),
            consumer: consumer.into(),
            message_id: None,
            envelope_id: None,
            envelope_timestamp: None,
            error,
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_envelope(mut self, id: Uuid, timestamp: DateTime<Utc>) -> Self {
        if !id.is_nil() {
            self.envelope_id = Some(id);
        }
        if timestamp != DateTime::<Utc>::default() {
            self.envelope_timestamp = Some(timestamp);
        }
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// 存储层分配的消息 ID
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn envelope_id(&self) -> Option<Uuid> {
        self.envelope_id
    }

    pub fn envelope_timestamp(&self) -> Option<DateTime<Utc>> {
        self.envelope_timestamp
    }

    pub fn error(&self) -> &BusError {
        &self.error
    }

    pub fn into_error(self) -> BusError {
        self.error
    }
}

impl fmt::Display for ConsumeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus: {}", self.error)?;

        if let Some(id) = &self.message_id {
            write!(f, "; id={id}")?;
        }

        write!(
            f,
            "; channel={}; group={}; consumer={}",
            self.channel, self.group, self.consumer
        )?;

        if let Some(id) = self.envelope_id {
            write!(f, "; envelope={id}")?;
        }
        if let Some(ts) = self.envelope_timestamp {
            write!(f, "@{}", ts.to_rfc3339())?;
        }

        Ok(())
    }
}
