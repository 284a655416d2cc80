//! 信封（Envelope）与线上格式
//!
//! 定义总线传输的不可变单元 `Envelope` 及其校验、载荷编解码，
//! 以及信封与存储条目字段之间的转换（保留字段 `data` + 附加元数据）。

mod message;
mod wire;

pub use message::Envelope;
pub use wire::{Additional, DATA_KEY, Fields, decode, encode};
