//! 解码线程的消息协议
//!
//! 线程内部直接传递 Rust 枚举；序列化形式与浏览器 worker 的 `postMessage` 约定一致，
//! 每条消息是一个以 tag 开头的数组:
//! - `["progress", fraction]`
//! - `["data", pixel_bytes, width, height]`，pixel_bytes 为 little-endian f32
//! - `["error", detail]`
//!
//! 请求的序列化形式只是资源路径字符串；关联 id 在 channel 的信封 ([`crate::worker::WorkerEvent`]) 里传递。

use crate::hdr::CHANNELS;
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

const TAG_PROGRESS: &str = "progress";
const TAG_DATA: &str = "data";
/// 旧版 worker 使用的 tag，反序列化时兼容
const TAG_DATA_LEGACY: &str = "hdrData";
const TAG_ERROR: &str = "error";

/// 解码线程发回的消息
///
/// 每次提交对应零个或多个 `Progress` (非递减)，以及恰好一个终止消息 (`Data` 或 `Error`)。
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Progress { fraction: f32 },
    Data { pixels: Vec<f32>, width: u32, height: u32 },
    Error { detail: String },
}

impl WorkerMessage {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkerMessage::Progress { .. })
    }

    pub fn tag(&self) -> &'static str {
        match self {
            WorkerMessage::Progress { .. } => TAG_PROGRESS,
            WorkerMessage::Data { .. } => TAG_DATA,
            WorkerMessage::Error { .. } => TAG_ERROR,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// 请求的序列化形式: 资源路径字符串
pub fn request_to_json(path: &str) -> serde_json::Result<String> {
    serde_json::to_string(path)
}

pub fn request_from_json(text: &str) -> serde_json::Result<String> {
    serde_json::from_str(text)
}

impl Serialize for WorkerMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            WorkerMessage::Progress { fraction } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element(TAG_PROGRESS)?;
                seq.serialize_element(fraction)?;
                seq.end()
            }
            WorkerMessage::Data { pixels, width, height } => {
                let bytes: Vec<u8> = pixels.iter().flat_map(|v| v.to_le_bytes()).collect();
                let mut seq = serializer.serialize_seq(Some(4))?;
                seq.serialize_element(TAG_DATA)?;
                seq.serialize_element(&bytes)?;
                seq.serialize_element(width)?;
                seq.serialize_element(height)?;
                seq.end()
            }
            WorkerMessage::Error { detail } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element(TAG_ERROR)?;
                seq.serialize_element(detail)?;
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for WorkerMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(MessageVisitor)
    }
}

struct MessageVisitor;

impl MessageVisitor {
    fn element<'de, T: Deserialize<'de>, A: SeqAccess<'de>>(&self, seq: &mut A, index: usize) -> Result<T, A::Error> {
        seq.next_element()?.ok_or_else(|| de::Error::invalid_length(index, self))
    }
}

impl<'de> Visitor<'de> for MessageVisitor {
    type Value = WorkerMessage;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a worker message array starting with a tag")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let tag: String = self.element(&mut seq, 0)?;
        match tag.as_str() {
            TAG_PROGRESS => {
                let fraction: f32 = self.element(&mut seq, 1)?;
                Ok(WorkerMessage::Progress { fraction })
            }
            TAG_DATA | TAG_DATA_LEGACY => {
                let bytes: Vec<u8> = self.element(&mut seq, 1)?;
                let width: u32 = self.element(&mut seq, 2)?;
                let height: u32 = self.element(&mut seq, 3)?;

                let expected = width as usize * height as usize * CHANNELS * size_of::<f32>();
                if bytes.len() != expected {
                    return Err(de::Error::custom(format!(
                        "pixel buffer has {} bytes, {width}x{height} needs {expected}",
                        bytes.len()
                    )));
                }
                let pixels = bytes
                    .chunks_exact(size_of::<f32>())
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect();
                Ok(WorkerMessage::Data { pixels, width, height })
            }
            TAG_ERROR => {
                let detail: String = self.element(&mut seq, 1)?;
                Ok(WorkerMessage::Error { detail })
            }
            other => Err(de::Error::unknown_variant(other, &[TAG_PROGRESS, TAG_DATA, TAG_ERROR])),
        }
    }
}
