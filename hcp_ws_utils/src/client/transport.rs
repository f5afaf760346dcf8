// hcp_ws_utils/src/client/transport.rs

//! 客户端 WebSocket 传输层。
//!
//! 提供连接到 HCP 桥接服务、收发 `Packet` 的最小客户端实现。
//! 浏览器端的积木编程客户端不使用它；它服务于集成测试与命令行调试。

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{WebSocketStream, connect_async};
use url::Url;
use uuid::Uuid;

use crate::error::WsError;
use crate::io::{receive_packet, send_packet};
use crate::packet::Packet;

/// `ClientWsStream` 类型别名，代表一个可能经过 TLS 加密的 TCP WebSocket 流。
pub type ClientWsStream = WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// `ClientConnection` 代表一个活动的客户端 WebSocket 连接。
pub struct ClientConnection {
    /// 发送端。
    pub ws_sender: SplitSink<ClientWsStream, Message>,
    /// 接收端（设为 `pub` 以便测试中直接配合 `timeout` 轮询）。
    pub ws_receiver: SplitStream<ClientWsStream>,
}

impl ClientConnection {
    /// 发送一条 HCP 报文。
    pub async fn send_packet(&mut self, packet: &Packet) -> Result<(), WsError> {
        send_packet(&mut self.ws_sender, packet).await
    }

    /// 接收下一条 HCP 报文，语义同 [`crate::io::receive_packet`]。
    pub async fn receive_packet(&mut self) -> Option<Result<Packet, WsError>> {
        receive_packet(&mut self.ws_receiver).await
    }

    /// 关闭连接（底层会发送 Close 帧）。
    pub async fn close(mut self) -> Result<(), WsError> {
        self.ws_sender.close().await?;
        Ok(())
    }
}

/// 异步连接到指定的 WebSocket 服务器，例如 `"ws://127.0.0.1:23518"`。
pub async fn connect_client(url_str: &str) -> Result<ClientConnection, WsError> {
    info!("客户端：开始尝试连接到 WebSocket 服务器，URL: {}", url_str);
    let parsed_url = Url::parse(url_str)
        .map_err(|e| WsError::InvalidUrl(format!("无效的 WebSocket URL '{}': {}", url_str, e)))?;

    match connect_async(parsed_url.as_str()).await {
        Ok((ws_stream, response)) => {
            info!("客户端：已成功连接到 {} (HTTP 状态码: {})", url_str, response.status());
            debug!("客户端：WebSocket 连接响应头: {:?}", response.headers());
            let (ws_sender, ws_receiver) = ws_stream.split();
            Ok(ClientConnection { ws_sender, ws_receiver })
        }
        Err(e) => {
            error!("客户端：连接到 {} 失败，错误: {}", url_str, e);
            Err(WsError::WebSocketProtocolError(e))
        }
    }
}

/// 生成一个新的 `requestId`。
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_client_rejects_invalid_url() {
        match connect_client("not a url").await {
            Err(WsError::InvalidUrl(_)) => {}
            Err(other) => panic!("预期 InvalidUrl，实际收到: {:?}", other),
            Ok(_) => panic!("无效 URL 不应连接成功"),
        }
    }

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(new_request_id(), new_request_id());
    }
}
