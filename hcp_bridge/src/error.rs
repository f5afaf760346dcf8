//! 桥接服务的错误类型。
//!
//! 只有 `ControlError` 会以 `errorCode` + 可读 `message` 的形式跨越网络边界，
//! 其余错误都停留在进程内部，用于日志与控制流。

use common_models::ws_payloads::E1_HW_CONTROL_FAIL;
use thiserror::Error;

/// 选择硬件与打开串口时的错误
#[derive(Error, Debug)]
pub enum AppError {
    #[error("尚未选择硬件")]
    NoHardwareSelected,

    #[error("未知硬件: {0}")]
    UnknownHardware(String),

    #[error("设备错误: {0}")]
    Device(#[from] DeviceError),
}

/// 串口设备错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// 设备不在 Opened 状态，不能写入
    #[error("设备未打开")]
    NotOpen,

    /// 设备实例已经打开过（或已关闭），不能再次打开
    #[error("设备实例已被使用，不能重复打开")]
    AlreadyUsed,

    #[error("打开串口 {path} 失败: {reason}")]
    OpenFailed { path: String, reason: String },

    #[error("串口 I/O 错误: {0}")]
    Io(String),

    /// 在规定时间内没有收到设备数据
    #[error("等待设备数据超时")]
    Timeout,

    /// 设备的数据流已结束（设备已关闭）
    #[error("设备数据流已关闭")]
    StreamClosed,
}

/// 驱动命令执行错误
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("参数无效: {0}")]
    InvalidArgs(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("{0}")]
    Failed(String),
}

/// `hw,control` 处理失败的原因。
#[derive(Error, Debug)]
pub enum ControlError {
    /// 当前没有选中硬件，或者没有绑定设备
    #[error("hardware connect fail(1)")]
    NotConnected,

    /// 等待设备打开超时
    #[error("hardware connect fail(2)")]
    DeviceOpenTimeout,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid control body: {0}")]
    InvalidBody(String),

    #[error("{0}")]
    CommandFailed(String),
}

impl ControlError {
    /// 应答里使用的错误码。
    pub fn error_code(&self) -> &'static str {
        E1_HW_CONTROL_FAIL
    }
}

impl From<CommandError> for ControlError {
    fn from(e: CommandError) -> Self {
        ControlError::CommandFailed(e.to_string())
    }
}
