use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use hcp_ws_utils::packet::Packet;
use log::{debug, error, info};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::device_session_manager::DeviceSessionManager;

/// 会话就绪所需的三个条件。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateFlag {
    /// 收到了 `meta,hello`
    Hello,
    /// 设备已打开
    DeviceConnected,
    /// 收到了第一条 `hw,control`
    FirstHwCommand,
}

/// 标记一个条件后的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// 条件尚未全部满足
    Pending,
    /// 本次标记使三个条件首次全部满足；只会返回一次
    BecameReady,
    /// 之前已经全部满足
    AlreadyReady,
}

#[derive(Debug, Default)]
struct GateFlags {
    hello: bool,
    device_connected: bool,
    first_hw_command: bool,
    ready: bool,
}

/// 三个条件以任意顺序全部满足后，会话才算就绪。
///
/// 拿到 `BecameReady` 的一方负责让驱动的连接回调跑完，然后调用 `release`
/// 放行所有在 `wait_ready` 上等待的控制命令。
#[derive(Debug)]
pub struct SessionGate {
    flags: Mutex<GateFlags>,
    released: watch::Sender<bool>,
}

impl Default for SessionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionGate {
    pub fn new() -> Self {
        let (released, _) = watch::channel(false);
        Self {
            flags: Mutex::new(GateFlags::default()),
            released,
        }
    }

    pub fn mark(&self, flag: GateFlag) -> GateOutcome {
        let Ok(mut flags) = self.flags.lock() else {
            return GateOutcome::Pending;
        };
        match flag {
            GateFlag::Hello => flags.hello = true,
            GateFlag::DeviceConnected => flags.device_connected = true,
            GateFlag::FirstHwCommand => flags.first_hw_command = true,
        }
        if flags.ready {
            GateOutcome::AlreadyReady
        } else if flags.hello && flags.device_connected && flags.first_hw_command {
            flags.ready = true;
            GateOutcome::BecameReady
        } else {
            GateOutcome::Pending
        }
    }

    pub fn is_set(&self, flag: GateFlag) -> bool {
        self.flags
            .lock()
            .map(|flags| match flag {
                GateFlag::Hello => flags.hello,
                GateFlag::DeviceConnected => flags.device_connected,
                GateFlag::FirstHwCommand => flags.first_hw_command,
            })
            .unwrap_or(false)
    }

    pub fn is_ready(&self) -> bool {
        self.flags.lock().map(|flags| flags.ready).unwrap_or(false)
    }

    /// 放行等待者。
    pub fn release(&self) {
        self.released.send_replace(true);
    }

    pub fn is_released(&self) -> bool {
        *self.released.borrow()
    }

    /// 等待 `release`。不设超时，由调用方通过取消来终止。
    pub async fn wait_ready(&self) {
        let mut rx = self.released.subscribe();
        let _ = rx.wait_for(|released| *released).await;
    }
}

/// 断开回调的一次性门闩：`Armed → Fired`。
#[derive(Debug, Default)]
pub struct DisconnectLatch {
    fired: AtomicBool,
}

impl DisconnectLatch {
    /// 第一次调用返回 `true`，之后都返回 `false`。
    pub fn fire(&self) -> bool {
        !self.fired.swap(true, Ordering::SeqCst)
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// 代表一个已连接到服务器的 WebSocket 客户端的会话状态及相关句柄。
///
/// 每个成功建立的 WebSocket 连接在服务端对应一个 `ClientSession`。
/// 除了身份与发送通道外，它还持有就绪门（`SessionGate`）、断开门闩，以及一个
/// `CancellationToken`：连接关闭时取消它，所有挂起的控制命令随之结束。
///
/// 驱动的连接回调在独立任务中运行，不受取消影响；`close` 会先等它跑完，
/// 再决定是否调用断开回调。
#[derive(Debug)]
pub struct ClientSession {
    /// 会话创建时生成的唯一标识符 (UUID v4)
    pub client_id: Uuid,

    /// 客户端的源网络地址
    pub addr: SocketAddr,

    /// 会话创建时间 (UTC)
    pub creation_time: DateTime<Utc>,

    /// 出站报文队列的发送端；连接的发送任务从另一端取出报文写入 WebSocket
    pub sender: mpsc::Sender<Packet>,

    pub gate: Arc<SessionGate>,

    /// 连接关闭时取消
    pub cancel: CancellationToken,

    disconnect_latch: DisconnectLatch,
    connected_fired: AtomicBool,
    /// 连接回调任务；`close` 取走并等待它
    connected_hook: Mutex<Option<JoinHandle<()>>>,
}

impl ClientSession {
    pub fn new(addr: SocketAddr, sender: mpsc::Sender<Packet>) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            addr,
            creation_time: Utc::now(),
            sender,
            gate: Arc::new(SessionGate::new()),
            cancel: CancellationToken::new(),
            disconnect_latch: DisconnectLatch::default(),
            connected_fired: AtomicBool::new(false),
            connected_hook: Mutex::new(None),
        }
    }

    /// 标记一个就绪条件；若会话因此就绪，在独立任务中调用驱动的连接回调，回调结束后放行等待者。
    ///
    /// 会话已关闭时不再启动连接回调。
    pub fn mark(&self, flag: GateFlag, manager: &Arc<DeviceSessionManager>) -> GateOutcome {
        let outcome = self.gate.mark(flag);
        debug!("[会话 {}] 标记 {:?} -> {:?}", self.client_id, flag, outcome);
        if outcome == GateOutcome::BecameReady {
            self.spawn_connected_hook(manager);
        }
        outcome
    }

    fn spawn_connected_hook(&self, manager: &Arc<DeviceSessionManager>) {
        let Ok(mut slot) = self.connected_hook.lock() else {
            return;
        };
        // close 先取消再取句柄；持锁检查保证两者不会错过彼此
        if self.cancel.is_cancelled() {
            debug!("[会话 {}] 会话已关闭，不再通知驱动客户端已连接", self.client_id);
            return;
        }
        info!("[会话 {}] 会话已就绪，通知驱动客户端已连接", self.client_id);
        self.connected_fired.store(true, Ordering::SeqCst);
        let manager = Arc::clone(manager);
        let gate = Arc::clone(&self.gate);
        *slot = Some(tokio::spawn(async move {
            manager.notify_web_socket_connected().await;
            gate.release();
        }));
    }

    /// 在会话存续期间监视当前设备，设备一旦进入 Opened 就标记 `DeviceConnected`。
    ///
    /// 会话关闭时监视任务随之结束。
    pub fn watch_device(self: &Arc<Self>, manager: Arc<DeviceSessionManager>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = session.cancel.cancelled() => {}
                opened = manager.device_opened() => {
                    if opened {
                        session.mark(GateFlag::DeviceConnected, &manager);
                    }
                }
            }
        })
    }

    pub fn connected_fired(&self) -> bool {
        self.connected_fired.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 关闭会话：先取消所有挂起的等待与控制任务，再至多调用一次驱动的断开回调。
    ///
    /// 连接回调正在运行时先等它结束。只有连接回调触发过，或者本会话曾经看到设备打开时，
    /// 才会调用断开回调。
    pub async fn close(&self, manager: &DeviceSessionManager) {
        self.cancel.cancel();
        if !self.disconnect_latch.fire() {
            return;
        }
        let connected_hook = self.connected_hook.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = connected_hook {
            if let Err(e) = handle.await {
                error!("[会话 {}] 连接回调任务异常结束: {:?}", self.client_id, e);
            }
        }
        if self.connected_fired() || self.gate.is_set(GateFlag::DeviceConnected) {
            info!("[会话 {}] 会话关闭，通知驱动客户端已断开", self.client_id);
            manager.notify_web_socket_disconnected().await;
        } else {
            debug!("[会话 {}] 会话关闭，未曾连接过硬件，跳过断开回调", self.client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::transport::simulated_factory;
    use crate::device::{Delimiter, SimulatedTransport};
    use crate::hardware::{CommandTable, HardwareDescriptor, HardwareDriver, HardwareRegistry, HookResult, SessionContext};
    use async_trait::async_trait;
    use std::time::Duration;

    const ALL: [GateFlag; 3] = [GateFlag::Hello, GateFlag::DeviceConnected, GateFlag::FirstHwCommand];

    /// 连接回调要睡一会儿的驱动，记录两个套接字回调的进出。
    struct SlowConnectDriver {
        calls: Arc<Mutex<Vec<&'static str>>>,
        connect_delay: Duration,
    }

    #[async_trait]
    impl HardwareDriver for SlowConnectDriver {
        fn hw_id(&self) -> &str {
            "slow"
        }

        async fn on_web_socket_connected(&self, _ctx: &SessionContext) -> HookResult {
            self.calls.lock().unwrap().push("connected:start");
            tokio::time::sleep(self.connect_delay).await;
            self.calls.lock().unwrap().push("connected:end");
            Ok(())
        }

        async fn on_web_socket_disconnected(&self, _ctx: &SessionContext) -> HookResult {
            self.calls.lock().unwrap().push("disconnected");
            Ok(())
        }

        fn commands(self: Arc<Self>) -> CommandTable {
            CommandTable::new()
        }
    }

    async fn selected_manager(connect_delay: Duration) -> (Arc<DeviceSessionManager>, Arc<Mutex<Vec<&'static str>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_for_factory = calls.clone();
        let mut registry = HardwareRegistry::new();
        registry.register(HardwareDescriptor::new("slow", "Slow", 9600, Delimiter::None, move || {
            Arc::new(SlowConnectDriver {
                calls: calls_for_factory.clone(),
                connect_delay,
            }) as Arc<dyn HardwareDriver>
        }));
        let manager = Arc::new(DeviceSessionManager::with_transport_factory(
            registry,
            simulated_factory(SimulatedTransport::new()),
        ));
        manager.select_hardware("slow").await.unwrap();
        (manager, calls)
    }

    fn session() -> Arc<ClientSession> {
        let (tx, _rx) = mpsc::channel(4);
        Arc::new(ClientSession::new("127.0.0.1:40000".parse().unwrap(), tx))
    }

    fn calls_of(calls: &Arc<Mutex<Vec<&'static str>>>) -> Vec<&'static str> {
        calls.lock().unwrap().clone()
    }

    #[test]
    fn test_gate_ready_in_any_order_exactly_once() {
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for order in orders {
            let gate = SessionGate::new();
            let outcomes: Vec<GateOutcome> = order.iter().map(|&i| gate.mark(ALL[i])).collect();
            assert_eq!(
                outcomes,
                vec![GateOutcome::Pending, GateOutcome::Pending, GateOutcome::BecameReady],
                "顺序 {:?}",
                order
            );
            for flag in ALL {
                assert_eq!(gate.mark(flag), GateOutcome::AlreadyReady);
            }
            assert!(gate.is_ready());
        }
    }

    #[test]
    fn test_gate_repeated_flag_does_not_complete() {
        let gate = SessionGate::new();
        assert_eq!(gate.mark(GateFlag::Hello), GateOutcome::Pending);
        assert_eq!(gate.mark(GateFlag::Hello), GateOutcome::Pending);
        assert_eq!(gate.mark(GateFlag::FirstHwCommand), GateOutcome::Pending);
        assert!(!gate.is_ready());
        assert!(gate.is_set(GateFlag::Hello));
        assert!(!gate.is_set(GateFlag::DeviceConnected));
    }

    #[tokio::test]
    async fn test_wait_ready_resolves_after_release() {
        let gate = std::sync::Arc::new(SessionGate::new());
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_ready().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        gate.release();
        waiter.await.unwrap();
        assert!(gate.is_released());
    }

    #[test]
    fn test_disconnect_latch_fires_once() {
        let latch = DisconnectLatch::default();
        assert!(!latch.has_fired());
        assert!(latch.fire());
        assert!(!latch.fire());
        assert!(latch.has_fired());
    }

    #[tokio::test]
    /// 连接回调还在运行时关闭会话：回调必须跑完，断开回调排在它之后且只有一次。
    async fn test_close_waits_for_running_connected_hook() {
        let (manager, calls) = selected_manager(Duration::from_millis(100)).await;
        let session = session();
        for flag in ALL {
            session.mark(flag, &manager);
        }
        assert!(session.connected_fired());

        session.close(&manager).await;
        assert_eq!(calls_of(&calls), vec!["connected:start", "connected:end", "disconnected"]);
        assert!(session.gate.is_released());
    }

    #[tokio::test]
    async fn test_concurrent_close_fires_disconnect_once() {
        let (manager, calls) = selected_manager(Duration::from_millis(50)).await;
        let session = session();
        for flag in ALL {
            session.mark(flag, &manager);
        }

        tokio::join!(session.close(&manager), session.close(&manager));
        session.close(&manager).await;
        assert_eq!(calls_of(&calls), vec!["connected:start", "connected:end", "disconnected"]);
    }

    #[tokio::test]
    async fn test_ready_after_close_skips_connected_hook() {
        let (manager, calls) = selected_manager(Duration::ZERO).await;
        let session = session();
        session.mark(GateFlag::Hello, &manager);
        session.mark(GateFlag::FirstHwCommand, &manager);
        session.close(&manager).await;

        assert_eq!(session.mark(GateFlag::DeviceConnected, &manager), GateOutcome::BecameReady);
        assert!(!session.connected_fired());
        tokio::task::yield_now().await;
        assert!(calls_of(&calls).is_empty());
    }

    #[tokio::test]
    /// 只发了 hello 的会话看到设备打开后同样有资格收到断开回调。
    async fn test_device_watcher_marks_device_connected() {
        let (manager, calls) = selected_manager(Duration::ZERO).await;
        let session = session();
        let watcher = session.watch_device(manager.clone());
        session.mark(GateFlag::Hello, &manager);
        assert!(!session.gate.is_set(GateFlag::DeviceConnected));

        manager.open("SIM0").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .expect("设备打开后监视任务应结束")
            .unwrap();
        assert!(session.gate.is_set(GateFlag::DeviceConnected));
        assert!(!session.gate.is_ready());

        session.close(&manager).await;
        assert_eq!(calls_of(&calls), vec!["disconnected"]);
    }

    #[tokio::test]
    async fn test_device_watcher_stops_on_close() {
        let (manager, calls) = selected_manager(Duration::ZERO).await;
        let session = session();
        let watcher = session.watch_device(manager.clone());

        session.close(&manager).await;
        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .expect("会话关闭后监视任务应结束")
            .unwrap();
        assert!(!session.gate.is_set(GateFlag::DeviceConnected));
        assert!(calls_of(&calls).is_empty());
    }
}
