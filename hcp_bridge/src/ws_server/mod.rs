//! WebSocket 服务端：连接与会话管理、HCP 报文路由，以及当前硬件的设备会话管理。

pub mod channel_router;
pub mod client_session;
pub mod connection_manager;
pub mod device_session_manager;
pub mod service;
