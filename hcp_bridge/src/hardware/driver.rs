//! 硬件驱动契约。
//!
//! 每种硬件实现一个 `HardwareDriver`：四个生命周期钩子，外加一张按名称查找的命令表。
//! 命令表在驱动被选中时构建一次；客户端的 `hw,control` 请求按 `cmd` 名称分发到这里。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::broadcast;

use super::events::{DriverEvent, DriverLogger};
use crate::device::SerialDevice;
use crate::error::CommandError;

/// 生命周期钩子的返回值。钩子失败只会被记录，状态迁移照常完成。
pub type HookResult = anyhow::Result<()>;

pub type CommandFuture = BoxFuture<'static, Result<Value, CommandError>>;

/// 命令处理函数：接收会话上下文与位置参数。
pub type CommandHandler = Arc<dyn Fn(SessionContext, Vec<Value>) -> CommandFuture + Send + Sync>;

/// 每次命令或钩子调用时传给驱动的上下文。
#[derive(Clone)]
pub struct SessionContext {
    device: Option<Arc<SerialDevice>>,
    pub logger: DriverLogger,
    notifier: Option<broadcast::Sender<DriverEvent>>,
}

impl SessionContext {
    pub fn new(
        device: Option<Arc<SerialDevice>>,
        logger: DriverLogger,
        notifier: Option<broadcast::Sender<DriverEvent>>,
    ) -> Self {
        Self {
            device,
            logger,
            notifier,
        }
    }

    /// 当前绑定的设备；没有设备时返回 `NotOpen`。
    pub fn device(&self) -> Result<&Arc<SerialDevice>, CommandError> {
        self.device.as_ref().ok_or(CommandError::Device(crate::error::DeviceError::NotOpen))
    }

    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    /// 发布一条数据事件（例如新的传感器读数）。
    pub fn notify(&self, value: Value) {
        if let Some(notifier) = &self.notifier {
            let _ = notifier.send(DriverEvent::Data {
                hw_id: self.logger.hw_id().to_string(),
                value,
            });
        }
    }
}

/// 驱动的命令表。
#[derive(Clone, Default)]
pub struct CommandTable {
    handlers: HashMap<String, CommandHandler>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个命令；同名命令会被覆盖。
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(SessionContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CommandError>> + Send + 'static,
    {
        let handler: CommandHandler = Arc::new(move |ctx, args| handler(ctx, args).boxed());
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<CommandHandler> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// 已注册的命令名（排序后）。
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// 每种硬件的控制器。
///
/// 驱动的私有状态放在实例内部，每次选中硬件都会通过注册表的工厂创建一个新实例。
/// 钩子默认什么都不做。
#[async_trait]
pub trait HardwareDriver: Send + Sync {
    fn hw_id(&self) -> &str;

    /// 设备进入 Opened 后调用一次。
    async fn on_device_opened(&self, _ctx: &SessionContext) -> HookResult {
        Ok(())
    }

    /// 设备即将关闭时调用；设备已在关闭中或已关闭时不会调用。
    async fn on_device_will_close(&self, _ctx: &SessionContext) -> HookResult {
        Ok(())
    }

    /// 某个客户端会话进入 Ready 时调用一次。
    async fn on_web_socket_connected(&self, _ctx: &SessionContext) -> HookResult {
        Ok(())
    }

    /// 已连接（或已获得设备）的客户端会话关闭时调用一次。
    async fn on_web_socket_disconnected(&self, _ctx: &SessionContext) -> HookResult {
        Ok(())
    }

    /// 构建命令表。
    fn commands(self: Arc<Self>) -> CommandTable;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> SessionContext {
        let (tx, _) = broadcast::channel(8);
        SessionContext::new(None, DriverLogger::new("test", tx.clone()), Some(tx))
    }

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let mut table = CommandTable::new();
        table.register("add", |_ctx, args: Vec<Value>| async move {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(json!(sum))
        });
        assert!(table.contains("add"));
        assert!(!table.contains("sub"));
        assert!(table.get("sub").is_none());

        let handler = table.get("add").unwrap();
        assert_eq!(handler(ctx(), vec![json!(2), json!(3)]).await.unwrap(), json!(5));
    }

    #[test]
    fn test_names_sorted() {
        let mut table = CommandTable::new();
        table
            .register("b", |_, _| async { Ok(Value::Null) })
            .register("a", |_, _| async { Ok(Value::Null) });
        assert_eq!(table.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_context_without_device() {
        let ctx = ctx();
        assert!(!ctx.has_device());
        assert!(matches!(
            ctx.device(),
            Err(CommandError::Device(crate::error::DeviceError::NotOpen))
        ));
    }

    #[test]
    fn test_notify_publishes_data_event() {
        let (tx, mut rx) = broadcast::channel(8);
        let ctx = SessionContext::new(None, DriverLogger::new("hw", tx.clone()), Some(tx));
        ctx.notify(json!([1, 2]));
        assert_eq!(
            rx.try_recv().unwrap(),
            DriverEvent::Data {
                hw_id: "hw".into(),
                value: json!([1, 2])
            }
        );
    }
}
