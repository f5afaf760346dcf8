// hcp_ws_utils/src/packet.rs

//! HCP 报文的数据结构与编解码。
//!
//! 每条 WebSocket 消息承载一个 HCP 报文，帧格式如下（二进制安全）：
//!
//! ```text
//! <key1>: <value1>\n
//! <key2>: <value2>\n
//! \n
//! <原始报文体字节>
//! ```
//!
//! 其中 `channel` 头部是必需的，格式为 `"<channelId>,<proc>"`。
//! 编解码器本身不强制报文体的内容类型，消费者可以按需把报文体解读为 UTF-8 文本或 JSON。

use std::collections::BTreeMap;

use common_models::enums::ContentType;
use common_models::ws_payloads::{HEADER_CHANNEL, HEADER_CONTENT_TYPE, HEADER_HW_ID, HEADER_REQUEST_ID};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{PacketParseError, WsError};

/// 报文头部集合。键唯一，顺序无关。
pub type HeaderMap = BTreeMap<String, String>;

/// 一条 HCP 协议报文。
///
/// 解析得到的 `Packet` 保证 `channel_id` 与 `proc_name` 都非空。
/// 入站报文在每一帧到达时构造一次，处理函数返回后即被丢弃。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// 通道 ID，例如 `"meta"`、`"hw"`。
    pub channel_id: String,
    /// 过程名，例如 `"hello"`、`"control"`。
    pub proc_name: String,
    /// 全部头部（解码得到的报文同样包含 `channel` 与 `contentType`）。
    pub headers: HeaderMap,
    /// 原始报文体；空报文体表示为 `None`。
    ///
    /// 线上格式无法区分“没有报文体”与“零长度报文体”，因此 `Some(vec![])`
    /// 编码后再解码会得到 `None`，与 `contentType` 无关。需要字节时用 [`Packet::body_bytes`]。
    pub body: Option<Vec<u8>>,
}

impl Packet {
    /// 创建一个没有额外头部、没有报文体的报文。
    pub fn new(channel_id: impl Into<String>, proc_name: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            proc_name: proc_name.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// 追加（或覆盖）一个头部。
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// 以 UTF-8 文本作为报文体，并标记 `contentType: text`。
    pub fn with_text_body(mut self, text: impl Into<String>) -> Self {
        self.headers
            .insert(HEADER_CONTENT_TYPE.to_string(), ContentType::Text.as_str().to_string());
        self.body = Some(text.into().into_bytes());
        self
    }

    /// 将 `payload` 序列化为 JSON 作为报文体，并标记 `contentType: json`。
    pub fn with_json_body<T: Serialize>(mut self, payload: &T) -> Result<Self, WsError> {
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| WsError::SerializationError(format!("序列化报文体失败: {}", e)))?;
        self.headers
            .insert(HEADER_CONTENT_TYPE.to_string(), ContentType::Json.as_str().to_string());
        self.body = Some(bytes);
        Ok(self)
    }

    /// 按名称读取头部。
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// `requestId` 头部。
    pub fn request_id(&self) -> Option<&str> {
        self.header(HEADER_REQUEST_ID)
    }

    /// `hwId` 头部。
    pub fn hw_id(&self) -> Option<&str> {
        self.header(HEADER_HW_ID)
    }

    /// `contentType` 头部；缺失或取值未知时返回 `None`。
    pub fn content_type(&self) -> Option<ContentType> {
        self.header(HEADER_CONTENT_TYPE).and_then(ContentType::parse)
    }

    /// 报文体字节，缺失时为空切片。
    pub fn body_bytes(&self) -> &[u8] {
        self.body.as_deref().unwrap_or_default()
    }

    /// 把报文体解读为 UTF-8 文本。
    pub fn body_text(&self) -> Result<&str, WsError> {
        std::str::from_utf8(self.body_bytes())
            .map_err(|e| WsError::DeserializationError(format!("报文体不是合法的 UTF-8 文本: {}", e)))
    }

    /// 把报文体解读为 JSON 并反序列化为目标类型 `T`。
    pub fn body_json<T: DeserializeOwned>(&self) -> Result<T, WsError> {
        serde_json::from_slice(self.body_bytes()).map_err(|e| {
            WsError::DeserializationError(format!(
                "报文体反序列化失败: {}, 原始报文体: '{}'",
                e,
                String::from_utf8_lossy(self.body_bytes())
            ))
        })
    }

    /// 编码为线上字节。
    ///
    /// 合成的 `contentType` 默认为 `text`；通过 `with_json_body` 设置的值会覆盖它。
    pub fn encode(&self) -> Vec<u8> {
        encode(
            &self.channel_id,
            &self.proc_name,
            &self.headers,
            self.body.as_deref(),
            ContentType::Text,
        )
    }

    /// 从线上字节解析报文。
    pub fn decode(bytes: &[u8]) -> Result<Packet, PacketParseError> {
        decode(bytes)
    }
}

/// 把通道、过程、头部与报文体编码为一帧。
///
/// 合成的 `channel` 与 `contentType` 头部排在调用方头部之前；
/// 若调用方提供了同名头部，则以调用方的值为准。
/// 输出顺序：`channel`、`contentType`，其余头部按键名排序。
pub fn encode(
    channel_id: &str,
    proc_name: &str,
    headers: &HeaderMap,
    body: Option<&[u8]>,
    content_type: ContentType,
) -> Vec<u8> {
    let channel_value = headers
        .get(HEADER_CHANNEL)
        .cloned()
        .unwrap_or_else(|| format!("{},{}", channel_id, proc_name));
    let content_type_value = headers
        .get(HEADER_CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| content_type.as_str().to_string());

    let body = body.unwrap_or_default();
    let mut out = Vec::with_capacity(64 + body.len());
    push_header_line(&mut out, HEADER_CHANNEL, &channel_value);
    push_header_line(&mut out, HEADER_CONTENT_TYPE, &content_type_value);
    for (key, value) in headers {
        if key == HEADER_CHANNEL || key == HEADER_CONTENT_TYPE {
            continue;
        }
        push_header_line(&mut out, key, value);
    }
    out.push(b'\n');
    out.extend_from_slice(body);
    out
}

fn push_header_line(out: &mut Vec<u8>, key: &str, value: &str) {
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.push(b'\n');
}

/// 解析一帧 HCP 报文。
///
/// 按 `\n` 逐行收集头部，直到遇到空行；空行之后的全部字节原样作为报文体。
/// 每个头部行在第一个冒号处拆分为键和值并去除首尾空白，没有冒号的行被忽略。
pub fn decode(bytes: &[u8]) -> Result<Packet, PacketParseError> {
    let mut headers = HeaderMap::new();
    let mut cursor = 0usize;

    loop {
        let rest = &bytes[cursor..];
        let newline = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(PacketParseError::MissingSeparator)?;
        let mut line = &rest[..newline];
        cursor += newline + 1;

        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        if line.is_empty() {
            break;
        }

        let line = String::from_utf8_lossy(line);
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if !key.is_empty() {
                headers.insert(key.to_string(), value.trim().to_string());
            }
        }
    }

    let channel = headers
        .get(HEADER_CHANNEL)
        .ok_or(PacketParseError::MissingChannel)?;
    let (channel_id, proc_name) = channel
        .split_once(',')
        .map(|(c, p)| (c.trim(), p.trim()))
        .filter(|(c, p)| !c.is_empty() && !p.is_empty())
        .ok_or_else(|| PacketParseError::InvalidChannel(channel.clone()))?;
    let (channel_id, proc_name) = (channel_id.to_string(), proc_name.to_string());

    let body = &bytes[cursor..];
    Ok(Packet {
        channel_id,
        proc_name,
        headers,
        body: (!body.is_empty()).then(|| body.to_vec()),
    })
}
