// hcp_ws_utils/src/client/mod.rs

//! WebSocket 客户端模块。
//!
//! 负责连接到 HCP 桥接服务并收发 `Packet`，主要用于集成测试与调试。

pub mod transport;
