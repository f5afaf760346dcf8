//! 单个物理串口连接的封装。
//!
//! `SerialDevice` 持有串口的生命周期状态，并提供两路互相独立的广播流：
//! 状态变化流与接收数据流（按分帧器切分、带时间戳）。
//! 状态只会沿 `Opening → Opened → Closing → Closed` 前进；打开失败时 `Opening → Closed`。
//! 一个实例只能打开一次，关闭后即作废。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common_models::enums::DeviceState;
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::delimiter::{Delimiter, FrameSplitter};
use super::transport::{SerialOpenOptions, SerialTransport};
use crate::error::DeviceError;

const DATA_CHANNEL_CAPACITY: usize = 256;
const STATE_CHANNEL_CAPACITY: usize = 16;
const RX_BUFFER_SIZE: usize = 1024;

/// 一帧接收数据。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxFrame {
    pub bytes: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

pub struct SerialDevice {
    options: SerialOpenOptions,
    delimiter: Delimiter,
    transport: Arc<dyn SerialTransport>,
    /// `None` 表示尚未调用过 `open()`
    state_tx: watch::Sender<Option<DeviceState>>,
    state_events: broadcast::Sender<DeviceState>,
    data_tx: broadcast::Sender<RxFrame>,
    /// 串行化 open / close
    op_lock: Mutex<()>,
    last_error: std::sync::Mutex<Option<String>>,
    rx_cancel: CancellationToken,
    rx_task: Mutex<Option<JoinHandle<()>>>,
}

impl SerialDevice {
    /// 创建设备对象。构造时不会打开串口。
    pub fn new(options: SerialOpenOptions, delimiter: Delimiter, transport: Arc<dyn SerialTransport>) -> Self {
        let (state_tx, _) = watch::channel(None);
        let (state_events, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let (data_tx, _) = broadcast::channel(DATA_CHANNEL_CAPACITY);
        Self {
            options,
            delimiter,
            transport,
            state_tx,
            state_events,
            data_tx,
            op_lock: Mutex::new(()),
            last_error: std::sync::Mutex::new(None),
            rx_cancel: CancellationToken::new(),
            rx_task: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.options.path
    }

    pub fn options(&self) -> &SerialOpenOptions {
        &self.options
    }

    /// 当前状态；尚未打开过时为 `None`。
    pub fn state(&self) -> Option<DeviceState> {
        *self.state_tx.borrow()
    }

    pub fn is_opened(&self) -> bool {
        self.state() == Some(DeviceState::Opened)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }

    /// 订阅状态变化（每次迁移推送一次）。
    pub fn subscribe_state(&self) -> broadcast::Receiver<DeviceState> {
        self.state_events.subscribe()
    }

    /// 观察当前状态。
    pub fn watch_state(&self) -> watch::Receiver<Option<DeviceState>> {
        self.state_tx.subscribe()
    }

    /// 订阅接收数据。每个订阅者都会收到每一帧；处理过慢的订阅者会丢帧。
    pub fn subscribe_data(&self) -> broadcast::Receiver<RxFrame> {
        self.data_tx.subscribe()
    }

    fn record_error(&self, message: String) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(message);
        }
    }

    /// 迁移到新状态；不允许后退或停留。
    fn transition(&self, next: DeviceState) -> bool {
        let advanced = self.state_tx.send_if_modified(|current| match current {
            Some(prev) if next.ordinal() <= prev.ordinal() => false,
            _ => {
                *current = Some(next);
                true
            }
        });
        if advanced {
            debug!("[串口设备 {}] 状态 -> {}", self.options.path, next);
            let _ = self.state_events.send(next);
        } else {
            warn!(
                "[串口设备 {}] 忽略非法的状态迁移: {:?} -> {}",
                self.options.path,
                self.state(),
                next
            );
        }
        advanced
    }

    /// 打开串口。
    ///
    /// 成功后进入 `Opened` 并启动接收循环；失败时直接进入 `Closed`。
    /// 已经打开过（或已关闭）的实例返回 `AlreadyUsed`。
    pub async fn open(&self) -> Result<(), DeviceError> {
        let _op = self.op_lock.lock().await;
        if self.state().is_some() {
            return Err(DeviceError::AlreadyUsed);
        }
        self.transition(DeviceState::Opening);

        if let Err(e) = self.transport.open(&self.options).await {
            error!("[串口设备 {}] 打开失败: {}", self.options.path, e);
            self.record_error(e.to_string());
            self.transition(DeviceState::Closed);
            return Err(e);
        }

        let handle = tokio::spawn(rx_loop(
            self.transport.clone(),
            self.delimiter.splitter(),
            self.data_tx.clone(),
            self.rx_cancel.clone(),
            self.options.path.clone(),
        ));
        *self.rx_task.lock().await = Some(handle);

        self.transition(DeviceState::Opened);
        info!("[串口设备 {}] 已打开", self.options.path);
        Ok(())
    }

    /// 关闭串口。
    ///
    /// 已处于 Closing/Closed 时不做任何事；从未打开过的实例直接进入 Closed。
    /// 与 `open()` 串行执行：打开过程中发起的关闭会在打开结束后才执行。
    pub async fn close(&self) {
        let _op = self.op_lock.lock().await;
        match self.state() {
            None => {
                self.transition(DeviceState::Closed);
            }
            Some(DeviceState::Closing) | Some(DeviceState::Closed) => {}
            Some(DeviceState::Opening) | Some(DeviceState::Opened) => {
                self.transition(DeviceState::Closing);
                self.rx_cancel.cancel();
                if let Some(handle) = self.rx_task.lock().await.take() {
                    if let Err(e) = handle.await {
                        warn!("[串口设备 {}] 接收任务异常结束: {}", self.options.path, e);
                    }
                }
                if let Err(e) = self.transport.close().await {
                    warn!("[串口设备 {}] 关闭底层串口失败: {}", self.options.path, e);
                    self.record_error(e.to_string());
                }
                self.transition(DeviceState::Closed);
                info!("[串口设备 {}] 已关闭", self.options.path);
            }
        }
    }

    /// 写入字节。只有在 Opened 状态下有效。
    pub async fn write(&self, bytes: &[u8]) -> Result<(), DeviceError> {
        if !self.is_opened() {
            return Err(DeviceError::NotOpen);
        }
        self.transport.write(bytes).await.map_err(|e| {
            self.record_error(e.to_string());
            e
        })
    }

    /// 等待设备进入 Opened。
    ///
    /// 进入 Opened 时返回 `true`；超时或设备先进入 Closing/Closed 时返回 `false`。
    pub async fn wait_until_open(&self, timeout: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        let settled = async {
            rx.wait_for(|state| matches!(state, Some(s) if *s != DeviceState::Opening))
                .await
                .map(|state| *state == Some(DeviceState::Opened))
                .unwrap_or(false)
        };
        tokio::time::timeout(timeout, settled).await.unwrap_or(false)
    }
}

impl Drop for SerialDevice {
    fn drop(&mut self) {
        self.rx_cancel.cancel();
    }
}

/// 从订阅中读取下一帧；超时返回 `Timeout`，设备已销毁返回 `StreamClosed`。
pub async fn next_frame(rx: &mut broadcast::Receiver<RxFrame>, timeout: Duration) -> Result<RxFrame, DeviceError> {
    let recv = async {
        loop {
            match rx.recv().await {
                Ok(frame) => break Ok(frame),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("[串口设备] 订阅者落后，丢弃了 {} 帧", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break Err(DeviceError::StreamClosed),
            }
        }
    };
    tokio::time::timeout(timeout, recv).await.map_err(|_| DeviceError::Timeout)?
}

async fn rx_loop(
    transport: Arc<dyn SerialTransport>,
    mut splitter: Box<dyn FrameSplitter>,
    data_tx: broadcast::Sender<RxFrame>,
    cancel: CancellationToken,
    path: String,
) {
    let mut buf = vec![0u8; RX_BUFFER_SIZE];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = transport.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                warn!("[串口设备 {}] 串口数据流已结束，接收循环退出", path);
                break;
            }
            Ok(n) => {
                let timestamp = Utc::now();
                for bytes in splitter.push(&buf[..n]) {
                    // 没有订阅者时发送失败是正常情况
                    let _ = data_tx.send(RxFrame { bytes, timestamp });
                }
            }
            Err(e) => {
                error!("[串口设备 {}] 读取失败，接收循环退出: {}", path, e);
                break;
            }
        }
    }
    splitter.reset();
    debug!("[串口设备 {}] 接收循环已结束", path);
}
