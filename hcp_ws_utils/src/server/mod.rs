// hcp_ws_utils/src/server/mod.rs

//! WebSocket 服务端模块。
//!
//! 负责在指定地址上监听、完成 WebSocket 握手，并把每个建立好的连接
//! 通过回调交给上层（`hcp_bridge` 的 `WsService`）处理。
//! 报文的收发使用 `crate::io` 中的通用函数。

pub mod transport;
