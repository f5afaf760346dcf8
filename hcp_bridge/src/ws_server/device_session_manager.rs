//! 当前选中硬件的驱动与设备管理。
//!
//! 同一时刻只有一组"驱动 + 设备"处于活动状态，由一把 `tokio::sync::Mutex` 保护；
//! 选择硬件、打开与关闭串口都在这把锁下串行执行。只读方通过 `watch` 快照观察当前设备，
//! 快照总是在旧设备的关闭回调执行完之后才更新。

use std::sync::Arc;
use std::time::Duration;

use common_models::enums::DeviceState;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};

use crate::device::transport::tokio_serial_factory;
use crate::device::{SerialDevice, TransportFactory};
use crate::error::{AppError, ControlError};
use crate::hardware::{CommandTable, DriverEvent, DriverLogger, HardwareDescriptor, HardwareDriver, HardwareRegistry, SessionContext};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 当前活动硬件与设备的只读快照。
#[derive(Clone, Default)]
pub struct ActiveSnapshot {
    pub hw_id: Option<String>,
    pub device: Option<Arc<SerialDevice>>,
}

struct ActivePair {
    descriptor: HardwareDescriptor,
    driver: Arc<dyn HardwareDriver>,
    commands: CommandTable,
    device: Option<Arc<SerialDevice>>,
}

pub struct DeviceSessionManager {
    registry: HardwareRegistry,
    transport_factory: TransportFactory,
    active: Mutex<Option<ActivePair>>,
    snapshot_tx: watch::Sender<ActiveSnapshot>,
    events: broadcast::Sender<DriverEvent>,
}

impl DeviceSessionManager {
    /// 使用真实串口创建管理器。
    pub fn new(registry: HardwareRegistry) -> Self {
        Self::with_transport_factory(registry, tokio_serial_factory())
    }

    pub fn with_transport_factory(registry: HardwareRegistry, transport_factory: TransportFactory) -> Self {
        let (snapshot_tx, _) = watch::channel(ActiveSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry,
            transport_factory,
            active: Mutex::new(None),
            snapshot_tx,
            events,
        }
    }

    pub fn registry(&self) -> &HardwareRegistry {
        &self.registry
    }

    /// 订阅驱动事件（日志与数据）。
    pub fn subscribe_events(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> ActiveSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<ActiveSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn selected_hw_id(&self) -> Option<String> {
        self.snapshot_tx.borrow().hw_id.clone()
    }

    pub fn current_device(&self) -> Option<Arc<SerialDevice>> {
        self.snapshot_tx.borrow().device.clone()
    }

    fn publish(&self, pair: Option<&ActivePair>) {
        self.snapshot_tx.send_replace(ActiveSnapshot {
            hw_id: pair.map(|p| p.descriptor.hw_id.clone()),
            device: pair.and_then(|p| p.device.clone()),
        });
    }

    fn context(&self, hw_id: &str, device: Option<Arc<SerialDevice>>) -> SessionContext {
        SessionContext::new(
            device,
            DriverLogger::new(hw_id, self.events.clone()),
            Some(self.events.clone()),
        )
    }

    /// 调用 will-close 回调（设备已在关闭中或已关闭时跳过），然后关闭设备。回调错误只记录。
    async fn close_pair_device(&self, pair: &mut ActivePair) {
        let Some(device) = pair.device.take() else {
            return;
        };
        let closing = device.state().map(DeviceState::is_closing_or_closed).unwrap_or(false);
        if !closing {
            let ctx = self.context(&pair.descriptor.hw_id, Some(device.clone()));
            if let Err(e) = pair.driver.on_device_will_close(&ctx).await {
                warn!("[设备会话] 驱动 {} 的 on_device_will_close 失败: {:#}", pair.descriptor.hw_id, e);
            }
        }
        device.close().await;
        info!("[设备会话] 已关闭设备 {}", device.path());
    }

    /// 选择硬件：关闭当前设备，从注册表创建新的驱动实例并构建命令表。
    pub async fn select_hardware(&self, hw_id: &str) -> Result<(), AppError> {
        let descriptor = self
            .registry
            .get(hw_id)
            .cloned()
            .ok_or_else(|| AppError::UnknownHardware(hw_id.to_string()))?;

        let mut active = self.active.lock().await;
        if let Some(mut old) = active.take() {
            self.close_pair_device(&mut old).await;
        }

        let driver = descriptor.create_driver();
        let commands = driver.clone().commands();
        info!(
            "[设备会话] 已选择硬件 {} ({})，命令: {:?}",
            descriptor.hw_id,
            descriptor.name,
            commands.names()
        );
        *active = Some(ActivePair {
            descriptor,
            driver,
            commands,
            device: None,
        });
        self.publish(active.as_ref());
        Ok(())
    }

    /// 打开串口。
    ///
    /// 已绑定到其他路径的设备会先被关闭；同一路径的设备正在打开或已打开时不做任何事。
    /// 打开成功后调用一次驱动的 `on_device_opened`。
    pub async fn open(&self, path: &str) -> Result<Arc<SerialDevice>, AppError> {
        let mut active = self.active.lock().await;
        let Some(pair) = active.as_mut() else {
            return Err(AppError::NoHardwareSelected);
        };

        if let Some(device) = &pair.device {
            let same_path = device.path() == path;
            let alive = matches!(device.state(), Some(DeviceState::Opening) | Some(DeviceState::Opened));
            if same_path && alive {
                debug!("[设备会话] 设备 {} 已经打开，忽略重复的 open", path);
                return Ok(device.clone());
            }
        }
        self.close_pair_device(pair).await;
        self.publish(Some(&*pair));

        let options = pair.descriptor.open_options(path);
        let transport = (self.transport_factory)(&options);
        let device = Arc::new(SerialDevice::new(options, pair.descriptor.delimiter.clone(), transport));
        pair.device = Some(device.clone());
        self.publish(Some(&*pair));

        device.open().await?;

        let ctx = self.context(&pair.descriptor.hw_id, Some(device.clone()));
        if let Err(e) = pair.driver.on_device_opened(&ctx).await {
            warn!("[设备会话] 驱动 {} 的 on_device_opened 失败: {:#}", pair.descriptor.hw_id, e);
        }
        Ok(device)
    }

    /// 关闭当前设备。
    pub async fn close(&self) {
        let mut active = self.active.lock().await;
        if let Some(pair) = active.as_mut() {
            self.close_pair_device(pair).await;
        }
        self.publish(active.as_ref());
    }

    /// 执行当前驱动的命令。
    ///
    /// 没有驱动或设备时返回 `NotConnected`；命令不存在时返回 `UnknownCommand`，不会调用任何东西。
    pub async fn run_command(&self, name: &str, args: Vec<Value>) -> Result<Value, ControlError> {
        let (hw_id, handler, device) = {
            let active = self.active.lock().await;
            let pair = active.as_ref().ok_or(ControlError::NotConnected)?;
            let device = pair.device.clone().ok_or(ControlError::NotConnected)?;
            let handler = pair
                .commands
                .get(name)
                .ok_or_else(|| ControlError::UnknownCommand(name.to_string()))?;
            (pair.descriptor.hw_id.clone(), handler, device)
        };

        debug!("[设备会话] 执行命令 {}.{} 参数: {:?}", hw_id, name, args);
        let ctx = self.context(&hw_id, Some(device));
        handler(ctx, args).await.map_err(|e| {
            warn!("[设备会话] 命令 {}.{} 失败: {}", hw_id, name, e);
            ControlError::from(e)
        })
    }

    /// 等待当前设备进入 Opened；期间设备被替换时继续等待新设备。超时返回 `false`。
    pub async fn wait_device_opened(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.device_opened()).await.unwrap_or(false)
    }

    /// 不设超时地等待当前设备进入 Opened，规则同 [`Self::wait_device_opened`]。
    pub async fn device_opened(&self) -> bool {
        let mut snapshot_rx = self.snapshot_tx.subscribe();
        loop {
            let device = snapshot_rx.borrow_and_update().device.clone();
            match device {
                Some(device) => {
                    if device.is_opened() {
                        return true;
                    }
                    let mut state_rx = device.watch_state();
                    let opened = async {
                        state_rx
                            .wait_for(|s| *s == Some(DeviceState::Opened))
                            .await
                            .is_ok()
                    };
                    tokio::select! {
                        changed = snapshot_rx.changed() => {
                            if changed.is_err() {
                                return false;
                            }
                        }
                        opened = opened => return opened,
                    }
                }
                None => {
                    if snapshot_rx.changed().await.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    async fn driver_and_context(&self) -> Option<(Arc<dyn HardwareDriver>, SessionContext)> {
        let active = self.active.lock().await;
        let pair = active.as_ref()?;
        let ctx = self.context(&pair.descriptor.hw_id, pair.device.clone());
        Some((pair.driver.clone(), ctx))
    }

    /// 通知当前驱动：有客户端会话就绪。
    pub async fn notify_web_socket_connected(&self) {
        if let Some((driver, ctx)) = self.driver_and_context().await {
            if let Err(e) = driver.on_web_socket_connected(&ctx).await {
                warn!("[设备会话] 驱动 {} 的 on_web_socket_connected 失败: {:#}", driver.hw_id(), e);
            }
        }
    }

    /// 通知当前驱动：客户端会话已断开。
    pub async fn notify_web_socket_disconnected(&self) {
        if let Some((driver, ctx)) = self.driver_and_context().await {
            if let Err(e) = driver.on_web_socket_disconnected(&ctx).await {
                warn!("[设备会话] 驱动 {} 的 on_web_socket_disconnected 失败: {:#}", driver.hw_id(), e);
            }
        }
    }

    /// 退出前关闭设备。
    pub async fn shutdown(&self) {
        info!("[设备会话] 正在关闭...");
        self.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::transport::simulated_factory;
    use crate::device::{Delimiter, SimulatedTransport};
    use crate::error::CommandError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    /// 记录钩子调用顺序的驱动。
    struct RecordingDriver {
        calls: Arc<StdMutex<Vec<String>>>,
        fail_hooks: bool,
    }

    #[async_trait]
    impl HardwareDriver for RecordingDriver {
        fn hw_id(&self) -> &str {
            "recorder"
        }

        async fn on_device_opened(&self, ctx: &SessionContext) -> crate::hardware::HookResult {
            let path = ctx.device().map(|d| d.path().to_string()).unwrap_or_default();
            self.calls.lock().unwrap().push(format!("opened:{}", path));
            if self.fail_hooks {
                anyhow::bail!("boom");
            }
            Ok(())
        }

        async fn on_device_will_close(&self, ctx: &SessionContext) -> crate::hardware::HookResult {
            let path = ctx.device().map(|d| d.path().to_string()).unwrap_or_default();
            self.calls.lock().unwrap().push(format!("will_close:{}", path));
            if self.fail_hooks {
                anyhow::bail!("boom");
            }
            Ok(())
        }

        async fn on_web_socket_connected(&self, _ctx: &SessionContext) -> crate::hardware::HookResult {
            self.calls.lock().unwrap().push("connected".into());
            Ok(())
        }

        async fn on_web_socket_disconnected(&self, _ctx: &SessionContext) -> crate::hardware::HookResult {
            self.calls.lock().unwrap().push("disconnected".into());
            Ok(())
        }

        fn commands(self: Arc<Self>) -> CommandTable {
            let mut table = CommandTable::new();
            table.register("echo", |_ctx, args: Vec<Value>| async move { Ok(json!(args)) });
            table.register("fail", |_ctx, _args| async move {
                Err(CommandError::Failed("motor jammed".into()))
            });
            table
        }
    }

    fn manager(fail_hooks: bool) -> (DeviceSessionManager, Arc<SimulatedTransport>, Arc<StdMutex<Vec<String>>>) {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let mut registry = HardwareRegistry::new();
        let calls_for_factory = calls.clone();
        registry.register(HardwareDescriptor::new("recorder", "Recorder", 9600, Delimiter::None, move || {
            Arc::new(RecordingDriver {
                calls: calls_for_factory.clone(),
                fail_hooks,
            }) as Arc<dyn HardwareDriver>
        }));
        let sim = SimulatedTransport::new();
        let manager = DeviceSessionManager::with_transport_factory(registry, simulated_factory(sim.clone()));
        (manager, sim, calls)
    }

    fn calls_of(calls: &Arc<StdMutex<Vec<String>>>) -> Vec<String> {
        calls.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_select_unknown_hardware_fails() {
        let (manager, _, _) = manager(false);
        assert!(matches!(
            manager.select_hardware("nope").await,
            Err(AppError::UnknownHardware(_))
        ));
        assert!(manager.selected_hw_id().is_none());
    }

    #[tokio::test]
    async fn test_open_requires_selection() {
        let (manager, _, _) = manager(false);
        assert!(matches!(manager.open("SIM0").await, Err(AppError::NoHardwareSelected)));
    }

    #[tokio::test]
    async fn test_open_invokes_opened_hook_once_and_same_path_is_noop() {
        let (manager, sim, calls) = manager(false);
        manager.select_hardware("recorder").await.unwrap();
        let first = manager.open("SIM0").await.unwrap();
        let second = manager.open("SIM0").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(sim.open_count(), 1);
        assert_eq!(calls_of(&calls), vec!["opened:SIM0"]);
        assert!(manager.current_device().unwrap().is_opened());
    }

    #[tokio::test]
    async fn test_switching_port_closes_previous_first() {
        let (manager, _, calls) = manager(false);
        manager.select_hardware("recorder").await.unwrap();
        let first = manager.open("SIM0").await.unwrap();
        let second = manager.open("SIM1").await.unwrap();

        assert_eq!(first.state(), Some(DeviceState::Closed));
        assert!(second.is_opened());
        assert_eq!(calls_of(&calls), vec!["opened:SIM0", "will_close:SIM0", "opened:SIM1"]);
        assert_eq!(manager.current_device().unwrap().path(), "SIM1");
    }

    #[tokio::test]
    async fn test_hook_failures_are_swallowed() {
        let (manager, _, calls) = manager(true);
        manager.select_hardware("recorder").await.unwrap();
        let device = manager.open("SIM0").await.unwrap();
        manager.close().await;
        assert_eq!(device.state(), Some(DeviceState::Closed));
        assert_eq!(calls_of(&calls), vec!["opened:SIM0", "will_close:SIM0"]);
        assert!(manager.current_device().is_none());
    }

    #[tokio::test]
    async fn test_close_skips_will_close_for_dead_device() {
        let (manager, _, calls) = manager(false);
        manager.select_hardware("recorder").await.unwrap();
        let device = manager.open("SIM0").await.unwrap();
        device.close().await;
        manager.close().await;
        assert_eq!(calls_of(&calls), vec!["opened:SIM0"]);
    }

    #[tokio::test]
    async fn test_open_failure_reports_error_without_hook() {
        let (manager, sim, calls) = manager(false);
        sim.set_fail_open(true);
        manager.select_hardware("recorder").await.unwrap();
        assert!(matches!(manager.open("SIM0").await, Err(AppError::Device(_))));
        assert!(calls_of(&calls).is_empty());
        assert!(!manager.wait_device_opened(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_run_command_paths() {
        let (manager, _, _) = manager(false);
        assert!(matches!(
            manager.run_command("echo", vec![]).await,
            Err(ControlError::NotConnected)
        ));

        manager.select_hardware("recorder").await.unwrap();
        assert!(matches!(
            manager.run_command("echo", vec![]).await,
            Err(ControlError::NotConnected)
        ));

        manager.open("SIM0").await.unwrap();
        assert_eq!(manager.run_command("echo", vec![json!(1)]).await.unwrap(), json!([1]));
        match manager.run_command("fly", vec![]).await {
            Err(ControlError::UnknownCommand(name)) => assert_eq!(name, "fly"),
            other => panic!("预期 UnknownCommand，实际: {:?}", other),
        }
        match manager.run_command("fail", vec![]).await {
            Err(ControlError::CommandFailed(msg)) => assert_eq!(msg, "motor jammed"),
            other => panic!("预期 CommandFailed，实际: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_device_opened_across_swap() {
        let (manager, sim, _) = manager(false);
        let manager = Arc::new(manager);
        manager.select_hardware("recorder").await.unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.wait_device_opened(Duration::from_secs(2)).await })
        };
        sim.set_open_delay(Duration::from_millis(30));
        manager.open("SIM0").await.unwrap();
        assert!(waiter.await.unwrap());
        assert!(manager.wait_device_opened(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn test_reselect_creates_fresh_driver_and_closes_device() {
        let (manager, _, calls) = manager(false);
        manager.select_hardware("recorder").await.unwrap();
        let device = manager.open("SIM0").await.unwrap();
        manager.select_hardware("recorder").await.unwrap();
        assert_eq!(device.state(), Some(DeviceState::Closed));
        assert!(manager.current_device().is_none());
        assert_eq!(manager.selected_hw_id().as_deref(), Some("recorder"));
        assert_eq!(calls_of(&calls), vec!["opened:SIM0", "will_close:SIM0"]);
    }

    #[tokio::test]
    async fn test_socket_hooks_forward_to_driver() {
        let (manager, _, calls) = manager(false);
        manager.notify_web_socket_connected().await;
        manager.select_hardware("recorder").await.unwrap();
        manager.notify_web_socket_connected().await;
        manager.notify_web_socket_disconnected().await;
        assert_eq!(calls_of(&calls), vec!["connected", "disconnected"]);
    }
}
