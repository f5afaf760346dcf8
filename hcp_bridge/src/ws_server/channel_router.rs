//! 负责处理从客户端接收到的 HCP 报文，并按通道 (`meta` / `hw`) 与过程名进行分发。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common_models::ws_payloads::{
    self, ControlReplyPayload, ControlRequestPayload, InfoPayload, MetaCmdPayload,
};
use hcp_ws_utils::packet::Packet;
use log::{debug, error, info, warn};

use super::client_session::{ClientSession, GateFlag};
use super::device_session_manager::DeviceSessionManager;
use crate::error::ControlError;

/// 路由所需的共享依赖。
#[derive(Clone)]
pub struct RouterContext {
    pub device_manager: Arc<DeviceSessionManager>,
    /// `hw,control` 等待设备打开的最长时间
    pub open_wait_timeout: Duration,
}

/// 异步处理从客户端接收到的一条报文。
///
/// `hw,control` 在独立任务中执行，本函数不会等待它完成，
/// 这样会话可以继续读取后续报文（例如在第一条 `control` 之后才到达的 `hello`）。
pub async fn handle_packet(session: Arc<ClientSession>, packet: Packet, ctx: &RouterContext) -> Result<()> {
    debug!(
        "[路由] 会话 {}: 收到报文 {},{} 头部: {:?}",
        session.client_id, packet.channel_id, packet.proc_name, packet.headers
    );

    match (packet.channel_id.as_str(), packet.proc_name.as_str()) {
        (ws_payloads::META_CHANNEL, ws_payloads::PROC_HELLO) => {
            handle_hello(&session, ctx).await?;
        }
        (ws_payloads::META_CHANNEL, ws_payloads::PROC_CMD) => {
            handle_meta_cmd(&session, &packet).await?;
        }
        (ws_payloads::HW_CHANNEL, ws_payloads::PROC_CONTROL) => {
            handle_control(session, packet, ctx);
        }
        (channel, proc_name) => {
            warn!(
                "[路由] 会话 {}: 未知的通道或过程 '{},{}'，已丢弃",
                session.client_id, channel, proc_name
            );
        }
    }
    Ok(())
}

async fn send(session: &ClientSession, packet: Packet) {
    if let Err(e) = session.sender.send(packet).await {
        error!("[路由] 会话 {}: 发送应答失败: {}", session.client_id, e);
    }
}

async fn handle_hello(session: &ClientSession, ctx: &RouterContext) -> Result<()> {
    info!("[路由] 会话 {}: 收到 hello", session.client_id);
    send(session, Packet::new(ws_payloads::META_CHANNEL, ws_payloads::PROC_WELCOME)).await;
    session.mark(GateFlag::Hello, &ctx.device_manager);
    Ok(())
}

async fn handle_meta_cmd(session: &ClientSession, packet: &Packet) -> Result<()> {
    let payload: MetaCmdPayload = match packet.body_json() {
        Ok(payload) => payload,
        Err(e) => {
            warn!("[路由] 会话 {}: 无效的 meta cmd 报文体: {}", session.client_id, e);
            return Ok(());
        }
    };
    if payload.cmd != ws_payloads::META_CMD_INFO {
        warn!("[路由] 会话 {}: 不支持的 meta cmd '{}'，已丢弃", session.client_id, payload.cmd);
        return Ok(());
    }
    let reply = Packet::new(ws_payloads::META_CHANNEL, ws_payloads::PROC_INFO).with_json_body(&InfoPayload::default())?;
    send(session, reply).await;
    Ok(())
}

fn handle_control(session: Arc<ClientSession>, packet: Packet, ctx: &RouterContext) {
    let (Some(request_id), Some(hw_id)) = (packet.request_id(), packet.hw_id()) else {
        warn!(
            "[路由] 会话 {}: control 请求缺少 requestId 或 hwId 头部，已丢弃",
            session.client_id
        );
        return;
    };
    let request_id = request_id.to_string();
    let hw_id = hw_id.to_string();

    let bound = ctx.device_manager.selected_hw_id();
    if bound.as_deref() != Some(hw_id.as_str()) {
        warn!(
            "[路由] 会话 {}: control 请求的 hwId '{}' 与当前硬件 {:?} 不符，已丢弃 (requestId={})",
            session.client_id, hw_id, bound, request_id
        );
        return;
    }

    let ctx = ctx.clone();
    let cancel = session.cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("[路由] 会话 {}: 连接已关闭，放弃 control 请求 {}", session.client_id, request_id);
            }
            _ = run_control(&session, &packet, &request_id, &hw_id, &ctx) => {}
        }
    });
}

async fn run_control(session: &ClientSession, packet: &Packet, request_id: &str, hw_id: &str, ctx: &RouterContext) {
    let reply = match execute_control(session, packet, ctx).await {
        Ok(data) => ControlReplyPayload::ok(data),
        Err(e) => {
            warn!(
                "[路由] 会话 {}: control 请求 {} 失败: {}",
                session.client_id, request_id, e
            );
            ControlReplyPayload::fail(e.error_code(), e.to_string())
        }
    };

    let packet = Packet::new(ws_payloads::HW_CHANNEL, ws_payloads::PROC_CONTROL)
        .with_header(ws_payloads::HEADER_REQUEST_ID, request_id)
        .with_header(ws_payloads::HEADER_HW_ID, hw_id)
        .with_json_body(&reply);
    match packet {
        Ok(packet) => send(session, packet).await,
        Err(e) => error!("[路由] 会话 {}: 构造 control 应答失败: {}", session.client_id, e),
    }
}

async fn execute_control(
    session: &ClientSession,
    packet: &Packet,
    ctx: &RouterContext,
) -> Result<serde_json::Value, ControlError> {
    let request: ControlRequestPayload = packet
        .body_json()
        .map_err(|e| ControlError::InvalidBody(e.to_string()))?;

    session.mark(GateFlag::FirstHwCommand, &ctx.device_manager);

    if !ctx.device_manager.wait_device_opened(ctx.open_wait_timeout).await {
        return Err(ControlError::DeviceOpenTimeout);
    }
    session.mark(GateFlag::DeviceConnected, &ctx.device_manager);

    session.gate.wait_ready().await;

    debug!(
        "[路由] 会话 {}: 执行命令 {} 参数 {:?}",
        session.client_id, request.cmd, request.args
    );
    ctx.device_manager.run_command(&request.cmd, request.args).await
}
