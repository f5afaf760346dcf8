//! 示例驱动：四路输出、四路传感器的通用传感器板。
//!
//! 串口协议（全部帧使用异或校验，校验窗口为校验字节之前的所有字节）：
//!
//! | 方向 | 帧 |
//! |---|---|
//! | PC → 板 | `[0xA5, opcode, ...payload, xor]` |
//! | 板 → PC | `[0x5A, opcode | 0x80, d0, d1, d2, d3, d4, xor]`（定长 8 字节） |
//!
//! 输出状态由发送循环周期性下发，`setOutput` 只修改待发送的状态。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::device::SerialDevice;
use crate::error::{CommandError, DeviceError};
use crate::hardware::checksum::{request_frame, ChecksumKind, ChecksumLayout};
use crate::hardware::driver::{CommandTable, HardwareDriver, HookResult, SessionContext};
use crate::hardware::pipeline::DistinctUntilChanged;
use crate::hardware::tx_loop::TxLoop;

pub const HW_ID: &str = "sensor_board";
pub const BAUD_RATE: u32 = 115_200;
pub const RESPONSE_LEN: usize = 8;
pub const OUTPUT_PINS: usize = 4;

pub const REQUEST_MARKER: u8 = 0xA5;
pub const RESPONSE_MARKER: u8 = 0x5A;

pub const OP_OUTPUT_STATE: u8 = 0x01;
pub const OP_READ_SENSORS: u8 = 0x02;
pub const OP_STOP: u8 = 0x03;
pub const OP_GET_FIRMWARE: u8 = 0x04;

pub const LAYOUT: ChecksumLayout = ChecksumLayout::new(ChecksumKind::Xor, 0);

const TX_PERIOD: Duration = Duration::from_millis(50);
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(300);

/// 待下发的输出状态。
#[derive(Default)]
struct OutputState {
    values: Mutex<[u8; OUTPUT_PINS]>,
    dirty: AtomicBool,
}

impl OutputState {
    fn set(&self, pin: usize, value: u8) {
        if let Ok(mut values) = self.values.lock() {
            values[pin] = value;
        }
        self.dirty.store(true, Ordering::SeqCst);
    }

    fn clear(&self) {
        if let Ok(mut values) = self.values.lock() {
            *values = [0; OUTPUT_PINS];
        }
        self.dirty.store(false, Ordering::SeqCst);
    }

    fn snapshot(&self) -> [u8; OUTPUT_PINS] {
        self.values.lock().map(|values| *values).unwrap_or_default()
    }

    /// 把待发送状态写到设备；写入失败时保留脏标记，下一拍重试。
    async fn flush(&self, device: &SerialDevice) {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        let frame = LAYOUT.build(REQUEST_MARKER, OP_OUTPUT_STATE, &self.snapshot());
        if let Err(e) = device.write(&frame).await {
            log::warn!("[驱动 {}] 下发输出状态失败: {}", HW_ID, e);
            self.dirty.store(true, Ordering::SeqCst);
        }
    }
}

pub struct SensorBoardDriver {
    outputs: Arc<OutputState>,
    sensors: Mutex<DistinctUntilChanged<Vec<u8>>>,
    tx_loop: tokio::sync::Mutex<Option<TxLoop>>,
    cancel: CancellationToken,
}

impl Default for SensorBoardDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorBoardDriver {
    pub fn new() -> Self {
        Self {
            outputs: Arc::new(OutputState::default()),
            sensors: Mutex::new(DistinctUntilChanged::new()),
            tx_loop: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// 当前待下发的输出值。
    pub fn outputs(&self) -> [u8; OUTPUT_PINS] {
        self.outputs.snapshot()
    }

    async fn stop_tx_loop(&self) {
        if let Some(tx_loop) = self.tx_loop.lock().await.take() {
            tx_loop.stop().await;
        }
    }

    async fn send_stop(device: &SerialDevice) -> Result<(), DeviceError> {
        device.write(&LAYOUT.build(REQUEST_MARKER, OP_STOP, &[])).await
    }

    async fn query(ctx: &SessionContext, opcode: u8) -> Result<Vec<u8>, CommandError> {
        let device = ctx.device()?;
        let request = LAYOUT.build(REQUEST_MARKER, opcode, &[]);
        let frame = request_frame(device, &request, LAYOUT, RESPONSE_LEN, RESPONSE_TIMEOUT).await?;
        Ok(frame[2..RESPONSE_LEN - 1].to_vec())
    }

    fn set_output(&self, ctx: &SessionContext, args: &[Value]) -> Result<Value, CommandError> {
        ctx.device()?;
        let pin = arg_u64(args, 0, "pin")?;
        let value = arg_u64(args, 1, "value")?;
        if pin as usize >= OUTPUT_PINS {
            return Err(CommandError::InvalidArgs(format!("pin 超出范围 0..{}: {}", OUTPUT_PINS, pin)));
        }
        let value = u8::try_from(value).map_err(|_| CommandError::InvalidArgs(format!("value 超出范围 0..=255: {}", value)))?;
        self.outputs.set(pin as usize, value);
        Ok(json!({ "pin": pin, "value": value }))
    }

    async fn read_sensors(&self, ctx: &SessionContext) -> Result<Value, CommandError> {
        let data = Self::query(ctx, OP_READ_SENSORS).await?;
        let values = data[..OUTPUT_PINS].to_vec();
        let changed = self.sensors.lock().ok().and_then(|mut step| step.push(values.clone()));
        if let Some(changed) = changed {
            ctx.notify(json!({ "sensors": changed }));
        }
        Ok(json!(values))
    }

    async fn stop(&self, ctx: &SessionContext) -> Result<Value, CommandError> {
        let device = ctx.device()?;
        self.outputs.clear();
        Self::send_stop(device).await?;
        ctx.logger.info("已停止全部输出");
        Ok(Value::Null)
    }

    async fn get_firmware(&self, ctx: &SessionContext) -> Result<Value, CommandError> {
        let data = Self::query(ctx, OP_GET_FIRMWARE).await?;
        Ok(json!(format!("{}.{}.{}", data[0], data[1], data[2])))
    }
}

fn arg_u64(args: &[Value], index: usize, name: &str) -> Result<u64, CommandError> {
    args.get(index)
        .and_then(Value::as_u64)
        .ok_or_else(|| CommandError::InvalidArgs(format!("参数 {} 缺失或不是非负整数", name)))
}

#[async_trait]
impl HardwareDriver for SensorBoardDriver {
    fn hw_id(&self) -> &str {
        HW_ID
    }

    async fn on_device_opened(&self, ctx: &SessionContext) -> HookResult {
        let device = ctx.device().context("设备打开回调中没有设备")?.clone();
        self.stop_tx_loop().await;

        let outputs = self.outputs.clone();
        let tx_loop = TxLoop::spawn(
            format!("{} {}", HW_ID, device.path()),
            TX_PERIOD,
            self.cancel.child_token(),
            move || {
                let outputs = outputs.clone();
                let device = device.clone();
                async move { outputs.flush(&device).await }
            },
        );
        *self.tx_loop.lock().await = Some(tx_loop);
        ctx.logger.info("设备已打开，发送循环已启动");
        Ok(())
    }

    async fn on_device_will_close(&self, ctx: &SessionContext) -> HookResult {
        self.stop_tx_loop().await;
        self.outputs.clear();
        if let Ok(device) = ctx.device() {
            if device.is_opened() {
                Self::send_stop(device).await.context("关闭前发送停止命令失败")?;
            }
        }
        Ok(())
    }

    async fn on_web_socket_connected(&self, ctx: &SessionContext) -> HookResult {
        ctx.logger.info("客户端已就绪");
        Ok(())
    }

    async fn on_web_socket_disconnected(&self, ctx: &SessionContext) -> HookResult {
        // 客户端离开后不应让输出保持在最后的状态
        self.outputs.clear();
        if let Ok(mut step) = self.sensors.lock() {
            step.reset();
        }
        if let Ok(device) = ctx.device() {
            if device.is_opened() {
                Self::send_stop(device).await.context("断开后发送停止命令失败")?;
            }
        }
        ctx.logger.info("客户端已断开，输出已清零");
        Ok(())
    }

    fn commands(self: Arc<Self>) -> CommandTable {
        let mut table = CommandTable::new();

        let driver = self.clone();
        table.register("setOutput", move |ctx, args| {
            let result = driver.set_output(&ctx, &args);
            async move { result }
        });

        let driver = self.clone();
        table.register("readSensors", move |ctx, _args| {
            let driver = driver.clone();
            async move { driver.read_sensors(&ctx).await }
        });

        let driver = self.clone();
        table.register("stop", move |ctx, _args| {
            let driver = driver.clone();
            async move { driver.stop(&ctx).await }
        });

        let driver = self;
        table.register("getFirmware", move |ctx, _args| {
            let driver = driver.clone();
            async move { driver.get_firmware(&ctx).await }
        });

        table
    }
}

impl Drop for SensorBoardDriver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
