// hcp_ws_utils/src/error.rs

//! 定义 HCP 传输库相关的错误类型。

use thiserror::Error;

/// 报文解析失败的原因。
///
/// 解析失败的报文只会被记录日志并丢弃，不会作为异常传播到传输层，
/// 也不会导致连接被关闭。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketParseError {
    /// 找不到分隔头部与报文体的空行。
    #[error("缺少头部与报文体之间的空行分隔符")]
    MissingSeparator,

    /// 缺少必需的 `channel` 头部。
    #[error("缺少 channel 头部")]
    MissingChannel,

    /// `channel` 头部无法拆分为两个非空部分 (`<channelId>,<proc>`)。
    #[error("无效的 channel 头部: '{0}'")]
    InvalidChannel(String),
}

/// HCP 传输库的统一错误类型。
#[derive(Error, Debug)]
pub enum WsError {
    /// 收到的帧不是合法的 HCP 报文。
    #[error("报文解析错误: {0}")]
    Parse(#[from] PacketParseError),

    /// 当 serde 序列化报文体失败时返回。
    #[error("序列化错误: {0}")]
    SerializationError(String),

    /// 报文体无法按调用方期望的格式（UTF-8 文本或 JSON）解读。
    #[error("反序列化错误: {0}")]
    DeserializationError(String),

    /// WebSocket 协议相关的错误，例如连接中断、握手失败。
    #[error("WebSocket协议错误: {0}")]
    WebSocketProtocolError(#[from] tokio_tungstenite::tungstenite::Error),

    /// 底层 I/O 错误（例如监听端口绑定失败）。
    #[error("I/O错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 当尝试发送消息到一个已关闭的通道时发生。
    #[error("发送错误: 通道已关闭")]
    SendErrorClosed,

    /// 无效的 URL 格式。
    #[error("无效的URL: {0}")]
    InvalidUrl(String),
}
