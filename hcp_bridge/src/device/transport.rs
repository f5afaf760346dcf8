//! 串口的平台接入层。
//!
//! `SerialDevice` 只通过 `SerialTransport` 访问底层串口：真实硬件使用
//! `TokioSerialTransport`（基于 `tokio-serial`），测试与演示使用内存中的 `SimulatedTransport`。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Notify};
use tokio_serial::{SerialPortBuilderExt, SerialPortType, SerialStream};

use crate::error::DeviceError;

/// 默认波特率
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// 打开串口所需的参数。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialOpenOptions {
    pub path: String,
    pub baud_rate: u32,
    /// 是否独占串口。桥接服务总是以非独占方式打开。
    pub exclusive: bool,
}

impl SerialOpenOptions {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            exclusive: false,
        }
    }
}

/// 串口平台接口。
///
/// `read` 在没有数据时阻塞；返回 `Ok(0)` 表示数据流已结束（串口被拔出或已关闭）。
/// 调用方通过取消 future 来停止读取。
#[async_trait]
pub trait SerialTransport: Send + Sync {
    async fn open(&self, options: &SerialOpenOptions) -> Result<(), DeviceError>;

    async fn read(&self, buf: &mut [u8]) -> Result<usize, DeviceError>;

    async fn write(&self, data: &[u8]) -> Result<(), DeviceError>;

    /// 刷新未写出的数据并释放底层句柄。对未打开的传输调用是无操作。
    async fn close(&self) -> Result<(), DeviceError>;
}

/// 为每个新设备创建一个传输实例的工厂。
pub type TransportFactory = Arc<dyn Fn(&SerialOpenOptions) -> Arc<dyn SerialTransport> + Send + Sync>;

/// 默认工厂：每个设备使用一个新的 `TokioSerialTransport`。
pub fn tokio_serial_factory() -> TransportFactory {
    Arc::new(|_options: &SerialOpenOptions| Arc::new(TokioSerialTransport::new()) as Arc<dyn SerialTransport>)
}

// ---------------------------------------------------------------------------
// tokio-serial
// ---------------------------------------------------------------------------

/// 基于 `tokio-serial` 的真实串口。
#[derive(Default)]
pub struct TokioSerialTransport {
    reader: Mutex<Option<ReadHalf<SerialStream>>>,
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
}

impl TokioSerialTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SerialTransport for TokioSerialTransport {
    async fn open(&self, options: &SerialOpenOptions) -> Result<(), DeviceError> {
        let open_failed = |reason: String| DeviceError::OpenFailed {
            path: options.path.clone(),
            reason,
        };

        #[allow(unused_mut)]
        let mut stream = tokio_serial::new(options.path.as_str(), options.baud_rate)
            .open_native_async()
            .map_err(|e| open_failed(e.to_string()))?;

        #[cfg(unix)]
        stream
            .set_exclusive(options.exclusive)
            .map_err(|e| open_failed(e.to_string()))?;

        let (reader, writer) = tokio::io::split(stream);
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        info!("[串口] 已打开 {} @ {} baud", options.path, options.baud_rate);
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(DeviceError::NotOpen)?;
        reader.read(buf).await.map_err(|e| DeviceError::Io(e.to_string()))
    }

    async fn write(&self, data: &[u8]) -> Result<(), DeviceError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(DeviceError::NotOpen)?;
        writer.write_all(data).await.map_err(|e| DeviceError::Io(e.to_string()))
    }

    async fn close(&self) -> Result<(), DeviceError> {
        let writer = self.writer.lock().await.take();
        let reader = self.reader.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.flush().await {
                warn!("[串口] 关闭前刷新缓冲区失败: {}", e);
            }
        }
        drop(reader);
        Ok(())
    }
}

/// 可用串口的描述信息。
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PortInfo {
    pub path: String,
    pub description: String,
}

/// 枚举系统中可用的串口。
pub fn list_ports() -> Result<Vec<PortInfo>, DeviceError> {
    let ports = tokio_serial::available_ports().map_err(|e| DeviceError::Io(e.to_string()))?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let description = match p.port_type {
                SerialPortType::UsbPort(usb) => format!(
                    "USB {:04x}:{:04x} {}",
                    usb.vid,
                    usb.pid,
                    usb.product.unwrap_or_default()
                ),
                SerialPortType::PciPort => "PCI".to_string(),
                SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                SerialPortType::Unknown => "Unknown".to_string(),
            };
            PortInfo {
                path: p.port_name,
                description: description.trim_end().to_string(),
            }
        })
        .collect())
}

// ---------------------------------------------------------------------------
// 内存模拟
// ---------------------------------------------------------------------------

/// 完全在内存中的串口，用于测试与离线演示。
///
/// - `inject_rx` 模拟设备发来的数据；
/// - `drain_tx` 取出写入设备的数据；
/// - `fail_open` 让下一次 `open` 失败；
/// - `open_delay` 让 `open` 在返回前等待一段时间。
#[derive(Default)]
pub struct SimulatedTransport {
    open: AtomicBool,
    fail_open: AtomicBool,
    open_delay_ms: AtomicUsize,
    open_count: AtomicUsize,
    rx_buf: Mutex<VecDeque<u8>>,
    tx_buf: Mutex<Vec<u8>>,
    rx_notify: Notify,
}

impl SimulatedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.open_delay_ms.store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// `open` 被成功调用的次数。
    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    /// 模拟设备发来数据。
    pub async fn inject_rx(&self, data: &[u8]) {
        self.rx_buf.lock().await.extend(data);
        self.rx_notify.notify_waiters();
    }

    /// 取出并清空已写入设备的数据。
    pub async fn drain_tx(&self) -> Vec<u8> {
        std::mem::take(&mut *self.tx_buf.lock().await)
    }
}

/// 把同一个 `SimulatedTransport` 交给所有新设备的工厂。
pub fn simulated_factory(transport: Arc<SimulatedTransport>) -> TransportFactory {
    Arc::new(move |_options: &SerialOpenOptions| transport.clone() as Arc<dyn SerialTransport>)
}

#[async_trait]
impl SerialTransport for SimulatedTransport {
    async fn open(&self, options: &SerialOpenOptions) -> Result<(), DeviceError> {
        let delay_ms = self.open_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
        }
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(DeviceError::OpenFailed {
                path: options.path.clone(),
                reason: "simulated open failure".to_string(),
            });
        }
        self.open.store(true, Ordering::SeqCst);
        self.open_count.fetch_add(1, Ordering::SeqCst);
        debug!("[模拟串口] 已打开 {}", options.path);
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        if !self.is_open() {
            return Err(DeviceError::NotOpen);
        }
        loop {
            // 先登记等待，再检查缓冲区，避免错过 inject_rx / close 的通知
            let notified = self.rx_notify.notified();
            {
                let mut rx = self.rx_buf.lock().await;
                if !rx.is_empty() {
                    let count = buf.len().min(rx.len());
                    for (slot, byte) in buf.iter_mut().zip(rx.drain(..count)) {
                        *slot = byte;
                    }
                    return Ok(count);
                }
            }
            if !self.is_open() {
                return Ok(0);
            }
            notified.await;
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), DeviceError> {
        if !self.is_open() {
            return Err(DeviceError::NotOpen);
        }
        self.tx_buf.lock().await.extend_from_slice(data);
        Ok(())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        self.open.store(false, Ordering::SeqCst);
        self.rx_notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_transport_read_write() {
        let transport = SimulatedTransport::new();
        transport.open(&SerialOpenOptions::new("SIM0", DEFAULT_BAUD_RATE)).await.unwrap();

        transport.write(b"abc").await.unwrap();
        assert_eq!(transport.drain_tx().await, b"abc");
        assert!(transport.drain_tx().await.is_empty());

        transport.inject_rx(&[1, 2, 3, 4]).await;
        let mut buf = [0u8; 3];
        assert_eq!(transport.read(&mut buf).await.unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(transport.read(&mut buf).await.unwrap(), 1);
        assert_eq!(buf[0], 4);
    }

    #[tokio::test]
    async fn test_simulated_read_blocks_until_close_then_reports_eof() {
        let transport = SimulatedTransport::new();
        transport.open(&SerialOpenOptions::new("SIM0", DEFAULT_BAUD_RATE)).await.unwrap();

        let reader = {
            let transport = transport.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                transport.read(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!reader.is_finished(), "没有数据时 read 应保持阻塞");

        transport.close().await.unwrap();
        assert_eq!(reader.await.unwrap(), Ok(0));
    }

    #[tokio::test]
    async fn test_simulated_transport_rejects_io_when_closed() {
        let transport = SimulatedTransport::new();
        let mut buf = [0u8; 4];
        assert_eq!(transport.read(&mut buf).await, Err(DeviceError::NotOpen));
        assert_eq!(transport.write(b"x").await, Err(DeviceError::NotOpen));
    }

    #[tokio::test]
    async fn test_simulated_transport_open_failure() {
        let transport = SimulatedTransport::new();
        transport.set_fail_open(true);
        let result = transport.open(&SerialOpenOptions::new("SIM0", 9600)).await;
        assert!(matches!(result, Err(DeviceError::OpenFailed { .. })));
        assert!(!transport.is_open());
        assert_eq!(transport.open_count(), 0);
    }

    #[test]
    fn test_open_options_are_non_exclusive() {
        let options = SerialOpenOptions::new("/dev/ttyUSB0", 9600);
        assert!(!options.exclusive);
        assert_eq!(options.baud_rate, 9600);
    }
}
