use super::Envelope;
use crate::error::BusResult;
use std::collections::HashMap;

/// 存储条目中承载信封 JSON 的保留字段名
pub const DATA_KEY: &str = "data";

/// 存储条目的扁平键值字段
pub type Fields = HashMap<String, String>;

/// 随信封一起传输的附加元数据（不含保留字段 `data`）
pub type Additional = HashMap<String, String>;

/// 将信封编码为存储条目字段：`extra` 中的值原样携带，`data` 始终由信封覆盖
pub fn encode(envelope: &Envelope, extra: &Fields) -> BusResult<Fields> {
    let mut fields = extra.clone();
    fields.insert(DATA_KEY.to_string(), serde_json::to_string(envelope)?);
    Ok(fields)
}

/// 从存储条目字段解码信封与附加元数据
///
/// 缺少 `data` 字段时返回空信封，由调用方的校验给出具体缺失项；
/// 此处不做校验。
pub fn decode(fields: &Fields) -> BusResult<(Envelope, Additional)> {
    let envelope = match fields.get(DATA_KEY) {
        Some(data) => serde_json::from_str(data)?,
        None => Envelope::default(),
    };

    let mut additional = fields.clone();
    additional.remove(DATA_KEY);

    Ok((envelope, additional))
}
