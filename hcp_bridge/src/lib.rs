//! `hcp_bridge` 桥接服务核心库。
//!
//! 本 Crate 把浏览器端积木编程环境通过 WebSocket 发来的 HCP 报文，
//! 转换为对本机串口外设的控制命令，并把结果回传给客户端。
//!
//! 主要模块包括：
//! - `config`: 管理应用的配置信息加载与访问。
//! - `device`: 串口传输、分帧与设备状态机。
//! - `error`: 定义应用特定的错误类型。
//! - `hardware`: 硬件驱动契约、注册表与内置驱动。
//! - `ws_server`: WebSocket 服务端，处理客户端连接、报文路由与会话就绪。

pub mod config;
pub mod device;
pub mod error;
pub mod hardware;
pub mod ws_server;
