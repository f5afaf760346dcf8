//! WebSocket 连接管理。

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use hcp_ws_utils::packet::Packet;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ws_server::client_session::ClientSession;

/// 管理所有活动的 WebSocket 客户端会话
#[derive(Debug, Clone, Default)]
pub struct ConnectionManager {
    /// 存储所有活动的 ClientSession，使用 DashMap 实现线程安全
    /// Key: client_id (Uuid)
    /// Value: Arc<ClientSession>
    pub clients: Arc<DashMap<Uuid, Arc<ClientSession>>>,
}

impl ConnectionManager {
    /// 创建一个新的 ConnectionManager 实例
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加一个新的客户端会话到管理器中。
    ///
    /// # Arguments
    /// * `addr` - 新连接客户端的 SocketAddr。
    /// * `sender` - 用于向该客户端发送报文的 mpsc::Sender。
    ///
    /// # Returns
    /// 返回新创建的 `Arc<ClientSession>`。
    pub fn add_client(&self, addr: SocketAddr, sender: mpsc::Sender<Packet>) -> Arc<ClientSession> {
        let client_session = Arc::new(ClientSession::new(addr, sender));
        self.clients.insert(client_session.client_id, Arc::clone(&client_session));

        info!(
            "新客户端连接成功: id={}, addr={}",
            client_session.client_id, client_session.addr
        );
        debug!("当前活动客户端总数: {}", self.clients.len());
        client_session
    }

    /// 根据 client_id 获取一个客户端会话。
    pub fn get_client(&self, client_id: &Uuid) -> Option<Arc<ClientSession>> {
        self.clients.get(client_id).map(|entry| Arc::clone(entry.value()))
    }

    /// 从管理器中移除一个客户端会话，返回被移除的会话（若存在）。
    ///
    /// 此方法应在客户端连接断开时调用。会话本身的关闭（取消挂起的命令、断开回调）
    /// 由调用方通过 [`ClientSession::close`] 完成。
    pub fn remove_client(&self, client_id: &Uuid) -> Option<Arc<ClientSession>> {
        match self.clients.remove(client_id) {
            Some((_, session)) => {
                info!("客户端会话已移除: id={}, addr={}", session.client_id, session.addr);
                debug!("当前活动客户端总数: {}", self.clients.len());
                Some(session)
            }
            None => {
                warn!("尝试移除不存在的客户端会话: id={}", client_id);
                None
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// 当前所有会话的快照。
    pub fn all_sessions(&self) -> Vec<Arc<ClientSession>> {
        self.clients.iter().map(|entry| Arc::clone(entry.value())).collect()
    }
}
