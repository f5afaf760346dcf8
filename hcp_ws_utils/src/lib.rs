//! `hcp_ws_utils` 提供 HCP 协议在 WebSocket 上传输所需的实用功能。
//!
//! 主要模块包括：
//! - `packet`: HCP 报文结构 `Packet` 及其编解码（头部行 + 空行 + 原始报文体）。
//! - `io`: 在任意 WebSocket 流上收发 `Packet` 的通用函数。
//! - `error`: 库中使用的错误类型 `WsError` 与 `PacketParseError`。
//! - `server`: WebSocket 服务端监听与连接接受。
//! - `client`: WebSocket 客户端连接（供集成测试与调试工具使用）。

pub mod client;
pub mod error;
pub mod io;
pub mod packet;
pub mod server;

pub use error::{PacketParseError, WsError};
pub use packet::{HeaderMap, Packet};
