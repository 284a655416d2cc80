//! Redis Streams 存储实现
//!
//! - `append` → `XADD [NOMKSTREAM] [MAXLEN|MINID =|~ n [LIMIT l]] id field value ...`
//! - `create_group` → `XGROUP CREATE channel group $|0 MKSTREAM`（`BUSYGROUP` 视为已存在）
//! - `read_group` → `XREADGROUP GROUP group consumer [COUNT n] [BLOCK ms] STREAMS channel cursor`
//!   （`block` 为 `None` 时发送 `BLOCK 0`，为零时不阻塞）
//! - `ack` → `XACK channel group id ...`
//!
//! 阻塞读取会占住所在连接，因此每个消费者使用独立的读取连接，写入与确认走共享连接。
//! 读取连接在该消费者首次读取时建立，消费任务结束时由 `release_consumer` 移除。
//!
use super::{AppendOptions, GroupStart, LogStore, ReadCursor, ReadRequest, StoreMessage};
use crate::envelope::Fields;
use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamReadReply;
use std::sync::Arc;

#[derive(Clone)]
pub struct RedisLogStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    readers: Arc<DashMap<String, MultiplexedConnection>>,
}

impl RedisLogStore {
    /// 以连接串（如 `redis://127.0.0.1/`）建立存储
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = redis::Client::open(url).map_err(|e| BusError::store("connect", e))?;
        Self::from_client(client).await
    }

    pub async fn from_client(client: redis::Client) -> BusResult<Self> {
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::store("connect", e))?;

        Ok(Self {
            client,
            conn,
            readers: Arc::new(DashMap::new()),
        })
    }

    async fn reader(&self, consumer: &str) -> BusResult<MultiplexedConnection> {
        if let Some(conn) = self.readers.get(consumer) {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::store("connect", e))?;

        Ok(self
            .readers
            .entry(consumer.to_string())
            .or_insert(conn)
            .clone())
    }
}

fn xadd(channel: &str, fields: &Fields, options: &AppendOptions) -> redis::Cmd {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(channel);

    if options.no_mk_stream {
        cmd.arg("NOMKSTREAM");
    }

    let matcher = if options.approx { "~" } else { "=" };
    let trimmed = match (options.max_len, options.min_id.as_deref()) {
        (Some(max_len), _) => {
            cmd.arg("MAXLEN").arg(matcher).arg(max_len);
            true
        }
        (None, Some(min_id)) if !min_id.is_empty() => {
            cmd.arg("MINID").arg(matcher).arg(min_id);
            true
        }
        _ => false,
    };
    // LIMIT 仅允许与近似裁剪同用
    if let (true, true, Some(limit)) = (trimmed, options.approx, options.limit) {
        cmd.arg("LIMIT").arg(limit);
    }

    cmd.arg(options.explicit_id().unwrap_or("*"));
    for (key, value) in fields {
        cmd.arg(key).arg(value);
    }
    cmd
}

fn xgroup_create(channel: &str, group: &str, start: GroupStart) -> redis::Cmd {
    let start = match start {
        GroupStart::Latest => "$",
        GroupStart::Earliest => "0",
    };

    let mut cmd = redis::cmd("XGROUP");
    cmd.arg("CREATE")
        .arg(channel)
        .arg(group)
        .arg(start)
        .arg("MKSTREAM");
    cmd
}

fn xreadgroup(request: &ReadRequest<'_>) -> redis::Cmd {
    let mut cmd = redis::cmd("XREADGROUP");
    cmd.arg("GROUP").arg(request.group).arg(request.consumer);

    if let Some(count) = request.count {
        cmd.arg("COUNT").arg(count);
    }
    // 积压读取从不阻塞；`BLOCK 0` 表示无限期等待
    match (request.cursor, request.block) {
        (ReadCursor::Backlog(_), _) => {}
        (ReadCursor::New, None) => {
            cmd.arg("BLOCK").arg(0);
        }
        (ReadCursor::New, Some(block)) if !block.is_zero() => {
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        (ReadCursor::New, Some(_)) => {}
    }

    let cursor = match request.cursor {
        ReadCursor::Backlog(after) => after.as_str(),
        ReadCursor::New => ">",
    };
    cmd.arg("STREAMS").arg(request.channel).arg(cursor);
    cmd
}

fn into_messages(reply: StreamReadReply) -> BusResult<Vec<StoreMessage>> {
    reply
        .keys
        .into_iter()
        .flat_map(|key| key.ids)
        .map(|entry| {
            let fields = entry
                .map
                .iter()
                .map(|(k, v)| {
                    let v: String = redis::from_redis_value(v)
                        .map_err(|e| BusError::store("read_group", e))?;
                    Ok((k.clone(), v))
                })
                .collect::<BusResult<Fields>>()?;

            Ok(StoreMessage {
                id: entry.id,
                fields,
            })
        })
        .collect()
}

#[async_trait]
impl LogStore for RedisLogStore {
    async fn append(
        &self,
        channel: &str,
        fields: Fields,
        options: &AppendOptions,
    ) -> BusResult<String> {
        let mut conn = self.conn.clone();
        let id: Option<String> = xadd(channel, &fields, options)
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::store("append", e))?;

        id.ok_or_else(|| BusError::store("append", format!("stream {channel} does not exist")))
    }

    async fn create_group(&self, channel: &str, group: &str, start: GroupStart) -> BusResult<()> {
        let mut conn = self.conn.clone();
        let res: redis::RedisResult<String> = xgroup_create(channel, group, start)
            .query_async(&mut conn)
            .await;

        match res {
            Ok(reply) if reply == "OK" => Ok(()),
            Ok(reply) => Err(BusError::store("create_group", reply)),
            Err(err) if err.code() == Some("BUSYGROUP") => Err(BusError::GroupAlreadyExists {
                channel: channel.to_string(),
                group: group.to_string(),
            }),
            Err(err) => Err(BusError::store("create_group", err)),
        }
    }

    async fn read_group(&self, request: &ReadRequest<'_>) -> BusResult<Vec<StoreMessage>> {
        let mut conn = self.reader(request.consumer).await?;
        let reply: Option<StreamReadReply> = xreadgroup(request)
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::store("read_group", e))?;

        match reply {
            Some(reply) => into_messages(reply),
            None => Ok(Vec::new()),
        }
    }

    async fn ack(&self, channel: &str, group: &str, ids: &[&str]) -> BusResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let acked: usize = redis::cmd("XACK")
            .arg(channel)
            .arg(group)
            .arg(ids)
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::store("ack", e))?;

        Ok(acked)
    }

    fn release_consumer(&self, consumer: &str) {
        self.readers.remove(consumer);
    }
}
