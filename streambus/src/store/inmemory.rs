//! 内存版追加日志（InMemoryLogStore）
//!
//! 以进程内数据结构模拟 Redis Streams 的消费组语义，满足 `LogStore` 协议：
//! - 条目 ID 形如 `毫秒-序号`，严格递增；
//! - 每个消费组维护 `last_delivered` 与待确认列表（PEL）；
//! - `New` 游标读取在无消息时按 `block` 阻塞等待新条目，`None` 时无限期等待；
//! - 支持 `MAXLEN` / `MINID` 裁剪（近似裁剪按精确处理）。
//!
//! 典型用途：测试环境、示例与本地开发。

use super::{AppendOptions, GroupStart, LogStore, ReadCursor, ReadRequest, StoreMessage};
use crate::envelope::Fields;
use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::time::{Instant, timeout_at};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct EntryId {
    ms: u64,
    seq: u64,
}

impl EntryId {
    fn parse(op: &'static str, raw: &str) -> BusResult<Self> {
        let invalid = || BusError::store(op, format!("invalid stream id: {raw}"));

        let (ms, seq) = match raw.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (raw, "0"),
        };

        Ok(Self {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }

    fn next_after(last: EntryId) -> Self {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        if now > last.ms {
            Self { ms: now, seq: 0 }
        } else {
            Self {
                ms: last.ms,
                seq: last.seq + 1,
            }
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    deliveries: u64,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<EntryId, Fields>,
    last_id: EntryId,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn trim(&mut self, options: &AppendOptions) {
        if let Some(max_len) = options.max_len {
            while self.entries.len() > max_len {
                self.entries.pop_first();
            }
        } else if let Some(min_id) = options.min_id.as_deref() {
            if let Ok(min_id) = EntryId::parse("append", min_id) {
                self.entries = self.entries.split_off(&min_id);
            }
        }
    }
}

struct Inner {
    streams: Mutex<HashMap<String, Stream>>,
    appended: watch::Sender<u64>,
}

/// 内存追加日志，克隆后共享同一份数据
#[derive(Clone)]
pub struct InMemoryLogStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        let (appended, _rx) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                streams: Mutex::new(HashMap::new()),
                appended,
            }),
        }
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<String, Stream>> {
        self.inner
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 通道当前保留的条目数
    pub fn len(&self, channel: &str) -> usize {
        self.streams()
            .get(channel)
            .map(|s| s.entries.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self, channel: &str) -> bool {
        self.len(channel) == 0
    }

    pub fn group_exists(&self, channel: &str, group: &str) -> bool {
        self.streams()
            .get(channel)
            .is_some_and(|s| s.groups.contains_key(group))
    }

    /// 消费组中尚未确认的消息 ID（按 ID 升序）
    pub fn pending(&self, channel: &str, group: &str) -> Vec<String> {
        self.streams()
            .get(channel)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.keys().map(ToString::to_string).collect())
            .unwrap_or_default()
    }

    /// 某条待确认消息已被投递的次数
    pub fn delivery_count(&self, channel: &str, group: &str, id: &str) -> Option<u64> {
        let id = EntryId::parse("pending", id).ok()?;
        self.streams()
            .get(channel)
            .and_then(|s| s.groups.get(group))
            .and_then(|g| g.pending.get(&id))
            .map(|p| p.deliveries)
    }

    fn try_read(&self, request: &ReadRequest<'_>) -> BusResult<Vec<StoreMessage>> {
        let mut streams = self.streams();

        let no_group = || {
            BusError::store(
                "read_group",
                format!(
                    "NOGROUP no such key '{}' or consumer group '{}'",
                    request.channel, request.group
                ),
            )
        };

        let stream = streams.get_mut(request.channel).ok_or_else(no_group)?;
        let Stream {
            entries, groups, ..
        } = stream;
        let group = groups.get_mut(request.group).ok_or_else(no_group)?;
        let limit = request.count.unwrap_or(usize::MAX);

        match request.cursor {
            ReadCursor::Backlog(after) => {
                let after = EntryId::parse("read_group", after)?;

                let messages = group
                    .pending
                    .range_mut(after..)
                    .filter(|(id, p)| **id > after && p.consumer == request.consumer)
                    .take(limit)
                    .map(|(id, p)| {
                        p.deliveries += 1;
                        StoreMessage {
                            id: id.to_string(),
                            fields: entries.get(id).cloned().unwrap_or_default(),
                        }
                    })
                    .collect();

                Ok(messages)
            }
            ReadCursor::New => {
                let fresh: Vec<(EntryId, Fields)> = entries
                    .range(group.last_delivered..)
                    .filter(|(id, _)| **id > group.last_delivered)
                    .take(limit)
                    .map(|(id, fields)| (*id, fields.clone()))
                    .collect();

                let mut messages = Vec::with_capacity(fresh.len());
                for (id, fields) in fresh {
                    group.last_delivered = id;
                    group.pending.insert(
                        id,
                        PendingEntry {
                            consumer: request.consumer.to_string(),
                            deliveries: 1,
                        },
                    );
                    messages.push(StoreMessage {
                        id: id.to_string(),
                        fields,
                    });
                }

                Ok(messages)
            }
        }
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn append(
        &self,
        channel: &str,
        fields: Fields,
        options: &AppendOptions,
    ) -> BusResult<String> {
        let id = {
            let mut streams = self.streams();

            if options.no_mk_stream && !streams.contains_key(channel) {
                return Err(BusError::store(
                    "append",
                    format!("stream '{channel}' does not exist"),
                ));
            }

            let stream = streams.entry(channel.to_string()).or_default();

            let id = match options.explicit_id() {
                Some(raw) => {
                    let id = EntryId::parse("append", raw)?;
                    if id <= stream.last_id {
                        return Err(BusError::store(
                            "append",
                            "the ID specified is equal or smaller than the target stream top item",
                        ));
                    }
                    id
                }
                None => EntryId::next_after(stream.last_id),
            };

            stream.entries.insert(id, fields);
            stream.last_id = id;
            stream.trim(options);
            id
        };

        self.inner.appended.send_modify(|n| *n += 1);

        Ok(id.to_string())
    }

    async fn create_group(&self, channel: &str, group: &str, start: GroupStart) -> BusResult<()> {
        let mut streams = self.streams();
        let stream = streams.entry(channel.to_string()).or_default();

        if stream.groups.contains_key(group) {
            return Err(BusError::GroupAlreadyExists {
                channel: channel.to_string(),
                group: group.to_string(),
            });
        }

        let last_delivered = match start {
            GroupStart::Latest => stream.last_id,
            GroupStart::Earliest => EntryId::default(),
        };

        stream.groups.insert(
            group.to_string(),
            Group {
                last_delivered,
                ..Default::default()
            },
        );

        Ok(())
    }

    async fn read_group(&self, request: &ReadRequest<'_>) -> BusResult<Vec<StoreMessage>> {
        let deadline = request.block.map(|block| Instant::now() + block);
        let mut appended = self.inner.appended.subscribe();

        loop {
            let messages = self.try_read(request)?;
            if !messages.is_empty() || request.cursor.is_backlog() {
                return Ok(messages);
            }

            // 未设上限时一直等到有新条目
            let changed = match deadline {
                Some(deadline) => match timeout_at(deadline, appended.changed()).await {
                    Ok(changed) => changed,
                    Err(_) => return Ok(Vec::new()),
                },
                None => appended.changed().await,
            };
            if changed.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, channel: &str, group: &str, ids: &[&str]) -> BusResult<usize> {
        let mut streams = self.streams();

        let Some(group) = streams
            .get_mut(channel)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };

        let mut acked = 0;
        for raw in ids {
            let id = EntryId::parse("ack", raw)?;
            if group.pending.remove(&id).is_some() {
                acked += 1;
            }
        }

        Ok(acked)
    }
}
