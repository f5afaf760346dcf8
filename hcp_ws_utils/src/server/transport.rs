// hcp_ws_utils/src/server/transport.rs

//! 包含服务端 WebSocket 监听、接受连接和握手逻辑。

use std::future::Future;
use std::net::SocketAddr;

use futures_util::stream::{SplitSink, SplitStream};
use log::{error, info};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

use crate::error::WsError;

/// `WsStream` 是一个类型别名，代表经过 WebSocket 握手后的 TCP 流。
pub type WsStream = WebSocketStream<TcpStream>;
/// 服务端连接的发送端。
pub type WsSender = SplitSink<WsStream, Message>;
/// 服务端连接的接收端。
pub type WsReceiver = SplitStream<WsStream>;

/// `ServerTransport` 负责 WebSocket 服务端的监听和连接接受。
///
/// 先 `bind` 再 `serve`：分成两步是为了让调用方（以及测试）在开始接受连接之前
/// 就能拿到实际监听的地址（例如绑定 `127.0.0.1:0` 时由系统分配的端口）。
pub struct ServerTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ServerTransport {
    /// 绑定 TCP 监听器到指定地址（例如 `"127.0.0.1:23518"`）。
    pub async fn bind(addr: &str) -> Result<Self, WsError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("WebSocket 服务器正在监听地址: {}", local_addr);
        Ok(Self { listener, local_addr })
    }

    /// 实际监听的地址。
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 持续接受连接，直到 `shutdown` 完成。
    ///
    /// 每个 TCP 连接在独立的 Tokio 任务中完成 WebSocket 握手，
    /// 握手成功后调用 `on_connect(ws_stream, peer_addr)`。
    /// 握手失败或单次 accept 失败只记录日志，服务器继续运行。
    pub async fn serve<F, Fut, S>(self, on_connect: F, shutdown: S)
    where
        F: Fn(WsStream, SocketAddr) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => {
                    info!("WebSocket 服务器 {} 收到停止信号，不再接受新连接", self.local_addr);
                    break;
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((tcp_stream, peer_addr)) => {
                    info!("从 {} 接受了新的 TCP 连接", peer_addr);
                    let on_connect_callback = on_connect.clone();
                    tokio::spawn(async move {
                        match accept_async(tcp_stream).await {
                            Ok(ws_stream) => {
                                info!("与 {} 的 WebSocket 握手成功", peer_addr);
                                on_connect_callback(ws_stream, peer_addr).await;
                            }
                            Err(e) => {
                                error!("与 {} 的 WebSocket 握手失败: {}", peer_addr, e);
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("接受 TCP 连接失败: {}。服务器将继续运行。", e);
                }
            }
        }
    }

    /// 绑定地址并无限期地接受连接。
    pub async fn start<F, Fut>(addr: &str, on_connect: F) -> Result<(), WsError>
    where
        F: Fn(WsStream, SocketAddr) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let transport = Self::bind(addr).await?;
        transport.serve(on_connect, std::future::pending::<()>()).await;
        Ok(())
    }
}
