//! 通用枚举模块。
//!
//! 本模块定义了桥接服务多个组件之间共享的枚举类型：
//! 串口设备的生命周期状态，以及 HCP 报文 `contentType` 头部的取值。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 串口设备的生命周期状态。
///
/// 状态只能按 `Opening → Opened → Closing → Closed` 的顺序前进，
/// 打开失败时允许从 `Opening` 直接进入 `Closed`。
/// 一旦进入 `Closed`，该设备实例不会再被重新打开。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceState {
    /// 正在调用平台接口打开串口。
    Opening,
    /// 串口已打开，可以读写。
    Opened,
    /// 正在关闭：停止接收循环并释放底层句柄。
    Closing,
    /// 已关闭（终态）。
    Closed,
}

impl DeviceState {
    /// 状态在生命周期中的序号，用于校验状态迁移只会前进。
    pub fn ordinal(self) -> u8 {
        match self {
            DeviceState::Opening => 0,
            DeviceState::Opened => 1,
            DeviceState::Closing => 2,
            DeviceState::Closed => 3,
        }
    }

    /// 是否已经处于关闭流程中（`Closing` 或 `Closed`）。
    pub fn is_closing_or_closed(self) -> bool {
        matches!(self, DeviceState::Closing | DeviceState::Closed)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// HCP 报文 `contentType` 头部的取值。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    /// 报文体为 JSON 文本。
    Json,
    /// 报文体为普通文本（或为空）。
    Text,
}

impl ContentType {
    /// 头部中使用的字符串形式。
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Json => "json",
            ContentType::Text => "text",
        }
    }

    /// 从头部字符串解析；未知取值返回 `None`。
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "json" => Some(ContentType::Json),
            "text" => Some(ContentType::Text),
            _ => None,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
