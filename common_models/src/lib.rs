//! `common_models` 公共模型库 crate。
//!
//! 本 crate 集中定义了 HCP 桥接服务各个 Rust 组件（`hcp_ws_utils` 传输库、
//! `hcp_bridge` 桥接服务）以及浏览器端积木编程客户端之间共享的数据结构和常量。
//!
//! 主要包含：
//! - **WebSocket 消息负载 (`ws_payloads`)**: `meta` / `hw` 通道上各个过程 (proc) 的 JSON 载荷，
//!   以及保留头部名、通道名、错误码等协议常量。
//! - **通用枚举 (`enums`)**: 串口设备状态 (`DeviceState`)、报文内容类型 (`ContentType`)。
//!
//! 所有模型都派生 `Serialize`/`Deserialize`/`Debug`/`Clone`，
//! 字段命名与客户端的 JSON 约定（camelCase）保持一致。

pub mod enums;
pub mod ws_payloads;
