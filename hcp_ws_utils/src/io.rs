// hcp_ws_utils/src/io.rs

//! 在 WebSocket 流上收发 HCP 报文的通用函数。
//!
//! 服务端与客户端的流类型不同（`TcpStream` 与 `MaybeTlsStream<TcpStream>`），
//! 这里的函数对 `Sink` / `Stream` 泛型化，两端共用同一套收发逻辑。

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use log::debug;
use tokio_tungstenite::tungstenite::{Error as TungsteniteError, protocol::Message};

use crate::error::WsError;
use crate::packet::Packet;

/// 把报文编码后作为二进制 WebSocket 消息发送。
pub async fn send_packet<S>(sink: &mut S, packet: &Packet) -> Result<(), WsError>
where
    S: Sink<Message, Error = TungsteniteError> + Unpin,
{
    debug!(
        "发送报文: channel={},{} 头部数={} 报文体长度={}",
        packet.channel_id,
        packet.proc_name,
        packet.headers.len(),
        packet.body_bytes().len()
    );
    sink.send(Message::Binary(packet.encode())).await?;
    Ok(())
}

/// 从 WebSocket 接收流中读取下一条 HCP 报文。
///
/// 文本帧与二进制帧都按 HCP 帧格式解析；Ping/Pong 等控制帧被跳过（由底层库自动应答）。
///
/// # Returns
/// * `Some(Ok(packet))`：成功解析一条报文。
/// * `Some(Err(WsError::Parse(_)))`：收到的帧不是合法报文，调用方应记录日志并丢弃，连接仍可继续使用。
/// * `Some(Err(_))`：其他协议错误，通常意味着连接已不可用。
/// * `None`：对端关闭了连接或流已结束。
pub async fn receive_packet<S>(stream: &mut S) -> Option<Result<Packet, WsError>>
where
    S: Stream<Item = Result<Message, TungsteniteError>> + Unpin,
{
    loop {
        match stream.next().await? {
            Ok(Message::Binary(bytes)) => {
                break Some(Packet::decode(&bytes).map_err(WsError::from));
            }
            Ok(Message::Text(text)) => {
                break Some(Packet::decode(text.as_bytes()).map_err(WsError::from));
            }
            Ok(Message::Close(frame)) => {
                debug!("收到 Close 帧: {:?}", frame);
                break None;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
            Err(TungsteniteError::ConnectionClosed) | Err(TungsteniteError::AlreadyClosed) => {
                break None;
            }
            Err(e) => break Some(Err(WsError::WebSocketProtocolError(e))),
        }
    }
}
