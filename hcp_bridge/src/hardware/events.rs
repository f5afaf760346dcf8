//! 驱动事件与按驱动区分的日志记录器。

use log::Level;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// 驱动对外发布的事件，由宿主界面等订阅者消费。没有订阅者也是合法的。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DriverEvent {
    #[serde(rename_all = "camelCase")]
    Log {
        hw_id: String,
        level: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Data {
        hw_id: String,
        value: Value,
    },
}

/// 每个驱动实例一份的日志记录器：同时写入 `log` 与驱动事件通道。
#[derive(Debug, Clone)]
pub struct DriverLogger {
    hw_id: String,
    events: broadcast::Sender<DriverEvent>,
}

impl DriverLogger {
    pub fn new(hw_id: impl Into<String>, events: broadcast::Sender<DriverEvent>) -> Self {
        Self {
            hw_id: hw_id.into(),
            events,
        }
    }

    pub fn hw_id(&self) -> &str {
        &self.hw_id
    }

    pub fn log(&self, level: Level, message: impl Into<String>) {
        let message = message.into();
        log::log!(level, "[驱动 {}] {}", self.hw_id, message);
        let _ = self.events.send(DriverEvent::Log {
            hw_id: self.hw_id.clone(),
            level: level.as_str().to_string(),
            message,
        });
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(Level::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(Level::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(Level::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(Level::Error, message);
    }
}
