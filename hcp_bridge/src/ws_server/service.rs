//! WebSocket 服务端核心服务：监听、为每个连接建立会话、收发报文。

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use hcp_ws_utils::error::WsError;
use hcp_ws_utils::io::{receive_packet, send_packet};
use hcp_ws_utils::packet::Packet;
use hcp_ws_utils::server::transport::{ServerTransport, WsStream};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::config::WebSocketConfig;
use crate::ws_server::channel_router::{self, RouterContext};
use crate::ws_server::connection_manager::ConnectionManager;
use crate::ws_server::device_session_manager::DeviceSessionManager;

/// 每个连接出站报文队列的容量
const OUTBOUND_QUEUE_CAPACITY: usize = 32;

/// WebSocket 服务结构体，封装了配置、连接管理器与设备会话管理器。
pub struct WsService {
    config: WebSocketConfig,
    open_wait_timeout: Duration,
    connection_manager: Arc<ConnectionManager>,
    device_manager: Arc<DeviceSessionManager>,
}

impl WsService {
    pub fn new(
        config: WebSocketConfig,
        open_wait_timeout: Duration,
        connection_manager: Arc<ConnectionManager>,
        device_manager: Arc<DeviceSessionManager>,
    ) -> Self {
        info!("[WsService] New instance created.");
        Self {
            config,
            open_wait_timeout,
            connection_manager,
            device_manager,
        }
    }

    /// 绑定配置中的地址并运行，直到 `shutdown` 完成。
    pub async fn start<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let addr = self.config.listen_addr();
        info!("[WsService] Starting WebSocket service on {}...", addr);
        let transport = ServerTransport::bind(&addr)
            .await
            .with_context(|| format!("无法绑定 WebSocket 监听地址 {}", addr))?;
        self.run(transport, shutdown).await;
        Ok(())
    }

    /// 在已绑定的传输上接受连接。停止后关闭所有仍然存活的会话。
    pub async fn run<S>(&self, transport: ServerTransport, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let on_connect = {
            let connection_manager = Arc::clone(&self.connection_manager);
            let ctx = RouterContext {
                device_manager: Arc::clone(&self.device_manager),
                open_wait_timeout: self.open_wait_timeout,
            };
            move |ws_stream: WsStream, addr: SocketAddr| {
                let connection_manager = Arc::clone(&connection_manager);
                let ctx = ctx.clone();
                async move {
                    handle_connection(ws_stream, addr, connection_manager, ctx).await;
                }
            }
        };

        info!("[WsService] Listening on {}", transport.local_addr());
        transport.serve(on_connect, shutdown).await;
        self.close_all_sessions().await;
        info!("[WsService] Service stopped.");
    }

    /// 关闭所有会话；各连接任务随后自行从连接管理器中移除。
    pub async fn close_all_sessions(&self) {
        for session in self.connection_manager.all_sessions() {
            session.close(&self.device_manager).await;
        }
    }
}

async fn handle_connection(
    ws_stream: WsStream,
    addr: SocketAddr,
    connection_manager: Arc<ConnectionManager>,
    ctx: RouterContext,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<Packet>(OUTBOUND_QUEUE_CAPACITY);
    let session = connection_manager.add_client(addr, tx);
    info!(
        "[WsService] New client connected: SessionID={}, Addr={}",
        session.client_id, session.addr
    );
    let device_watcher = session.watch_device(Arc::clone(&ctx.device_manager));

    let sender_task = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            loop {
                let packet = tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    packet = rx.recv() => packet,
                };
                let Some(packet) = packet else {
                    break;
                };
                if let Err(e) = send_packet(&mut ws_sender, &packet).await {
                    error!(
                        "[SenderTask {}] Failed to send packet to client: {}. Assuming connection is broken.",
                        session.client_id, e
                    );
                    break;
                }
            }
            debug!("[SenderTask {}] Loop exited.", session.client_id);
        })
    };

    loop {
        let received = tokio::select! {
            _ = session.cancel.cancelled() => {
                info!("[WsService] SessionID {}: Session cancelled.", session.client_id);
                break;
            }
            received = receive_packet(&mut ws_receiver) => received,
        };
        match received {
            Some(Ok(packet)) => {
                if let Err(e) = channel_router::handle_packet(Arc::clone(&session), packet, &ctx).await {
                    error!(
                        "[WsService] SessionID {}: Error handling packet: {:#}",
                        session.client_id, e
                    );
                }
            }
            Some(Err(WsError::Parse(e))) => {
                warn!(
                    "[WsService] SessionID {}: Malformed packet dropped: {}",
                    session.client_id, e
                );
            }
            Some(Err(e)) => {
                warn!(
                    "[WsService] SessionID {}: Receive error: {}. Closing connection.",
                    session.client_id, e
                );
                break;
            }
            None => {
                info!("[WsService] SessionID {}: Client connection closed by peer.", session.client_id);
                break;
            }
        }
    }

    session.close(&ctx.device_manager).await;
    connection_manager.remove_client(&session.client_id);
    if let Err(e) = sender_task.await {
        error!(
            "[WsService] SessionID {}: Sender task panicked: {:?}",
            session.client_id, e
        );
    }
    if let Err(e) = device_watcher.await {
        error!(
            "[WsService] SessionID {}: Device watcher panicked: {:?}",
            session.client_id, e
        );
    }
    info!("[WsService] SessionID {}: Connection handling finished.", session.client_id);
}
