// common_models/src/ws_payloads.rs

//! HCP 协议中使用的常量与各类 JSON 载荷结构体定义。
//!
//! 报文的帧格式（头部行 + 空行 + 报文体）由 `hcp_ws_utils::packet` 负责；
//! 本模块只描述报文体里的 JSON 结构，以及各方共享的通道名、过程名、头部名和错误码。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 元数据通道：握手与服务信息查询。
pub const META_CHANNEL: &str = "meta";
/// 硬件通道：把客户端的控制命令转发给当前硬件驱动。
pub const HW_CHANNEL: &str = "hw";

/// `meta,hello`：客户端发起的握手。
pub const PROC_HELLO: &str = "hello";
/// `meta,welcome`：服务端对 hello 的应答。
pub const PROC_WELCOME: &str = "welcome";
/// `meta,cmd`：客户端的元命令（目前只有 `info`）。
pub const PROC_CMD: &str = "cmd";
/// `meta,info`：服务端对 `info` 元命令的应答。
pub const PROC_INFO: &str = "info";
/// `hw,control`：硬件控制请求与应答共用的过程名。
pub const PROC_CONTROL: &str = "control";

/// 必需头部，格式为 `"<channelId>,<proc>"`。
pub const HEADER_CHANNEL: &str = "channel";
/// 报文体类型头部，取值 `json` / `text`。
pub const HEADER_CONTENT_TYPE: &str = "contentType";
/// 客户端生成的请求关联 ID，应答时原样回传。
pub const HEADER_REQUEST_ID: &str = "requestId";
/// `hw` 通道请求的目标硬件 ID。
pub const HEADER_HW_ID: &str = "hwId";

/// `meta,cmd` 中查询服务信息的命令名。
pub const META_CMD_INFO: &str = "info";

/// `hw,control` 失败时统一返回的错误码。
pub const E1_HW_CONTROL_FAIL: &str = "E1_HW_CONTROL_FAIL";

/// `meta,cmd` 请求体，例如 `{"cmd":"info"}`。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MetaCmdPayload {
    /// 元命令名称。
    pub cmd: String,
}

/// `meta,info` 应答体。
///
/// 目前只是一个占位结构，为以后扩展服务信息查询预留。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InfoPayload {
    pub success: bool,
    pub foo: String,
}

impl Default for InfoPayload {
    fn default() -> Self {
        Self {
            success: true,
            foo: "bar".to_string(),
        }
    }
}

/// `hw,control` 请求体：`{"cmd": "...", "args": [...]}`。
///
/// `args` 为位置参数列表，其含义由具体驱动的命令决定；缺省时视为空列表。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ControlRequestPayload {
    /// 驱动命令名，例如 `"setOutput"`。
    pub cmd: String,
    /// 命令的位置参数。
    #[serde(default)]
    pub args: Vec<Value>,
}

/// `hw,control` 应答体。
///
/// 成功时为 `{"success":true,"data":...}`，
/// 失败时为 `{"success":false,"errorCode":"E1_HW_CONTROL_FAIL","message":"..."}`。
/// 内部错误细节只以 `message` 的可读文本形式跨越网络边界。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlReplyPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ControlReplyPayload {
    /// 构造成功应答。
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error_code: None,
            message: None,
        }
    }

    /// 构造失败应答。
    pub fn fail(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error_code: Some(error_code.into()),
            message: Some(message.into()),
        }
    }
}
