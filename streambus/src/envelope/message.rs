use crate::error::{BusError, BusResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 信封：总线上传输的最小不可变单元
///
/// - `id`：全局唯一标识（UUID v4）；
/// - `date`：发生时间；
/// - `name`：逻辑通道名（即发布/订阅的 stream 名）；
/// - `data`：不透明载荷字节，可以为空，但与“缺失”不同。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    id: Uuid,
    #[serde(default)]
    date: DateTime<Utc>,
    #[serde(default)]
    name: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "payload_base64"
    )]
    data: Option<Vec<u8>>,
}

impl Envelope {
    /// 以类型化载荷创建信封，自动分配 ID 与当前时间
    pub fn new<T>(name: impl Into<String>, payload: &T) -> BusResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let mut envelope = Self::raw(name, Vec::new());
        envelope.set_payload(payload)?;
        Ok(envelope)
    }

    /// 以原始字节创建信封，自动分配 ID 与当前时间
    pub fn raw(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            date: Utc::now(),
            name: name.into(),
            data: Some(payload.into()),
        }
    }

    /// 由已知字段还原信封（适配层、重放等场景），不做校验
    pub fn from_parts(
        id: Uuid,
        date: DateTime<Utc>,
        name: impl Into<String>,
        data: Option<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            date,
            name: name.into(),
            data,
        }
    }

    /// 按 id → date → name 的顺序返回第一个缺失字段对应的错误
    pub fn validate(&self) -> BusResult<()> {
        if self.id.is_nil() {
            return Err(BusError::MissingId);
        }
        if self.date == DateTime::<Utc>::default() {
            return Err(BusError::MissingTimestamp);
        }
        if self.name.is_empty() {
            return Err(BusError::MissingName);
        }
        Ok(())
    }

    pub fn set_payload<T>(&mut self, payload: &T) -> BusResult<()>
    where
        T: Serialize + ?Sized,
    {
        self.data = Some(serde_json::to_vec(payload)?);
        Ok(())
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> BusResult<T> {
        let Some(data) = self.data.as_deref() else {
            return Err(BusError::encoding("payload is absent"));
        };
        Ok(serde_json::from_slice(data)?)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }
}

mod payload_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match data {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}
