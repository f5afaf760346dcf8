//! 带校验和的设备帧。
//!
//! 出站帧格式为 `[marker, opcode, ...payload, checksum]`，校验和在写入前计算并放在最后一个字节。
//! 入站帧为定长帧，用同样的算法、同样的字节窗口重新计算后与最后一个字节比较；
//! 校验失败时最多重试一次，仍失败则返回全零结果而不是错误。

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};

use crate::device::{next_frame, SerialDevice};
use crate::error::DeviceError;

/// 校验和算法。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    /// 逐字节异或
    Xor,
    /// 8 位累加和的二进制补码，使窗口内所有字节与校验和之和为 0
    TwosComplementSum,
}

impl ChecksumKind {
    pub fn compute(self, window: &[u8]) -> u8 {
        match self {
            ChecksumKind::Xor => window.iter().fold(0u8, |acc, b| acc ^ b),
            ChecksumKind::TwosComplementSum => {
                let sum = window.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
                sum.wrapping_neg()
            }
        }
    }
}

/// 帧的校验规则：算法，以及参与计算的窗口起点（终点总是校验和字节之前）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumLayout {
    pub kind: ChecksumKind,
    pub window_start: usize,
}

impl ChecksumLayout {
    pub const fn new(kind: ChecksumKind, window_start: usize) -> Self {
        Self { kind, window_start }
    }

    fn window<'a>(&self, frame: &'a [u8]) -> &'a [u8] {
        let end = frame.len().saturating_sub(1);
        &frame[self.window_start.min(end)..end]
    }

    /// 计算校验和并写入最后一个字节。
    pub fn seal(&self, frame: &mut [u8]) {
        if frame.is_empty() {
            return;
        }
        let checksum = self.kind.compute(self.window(frame));
        if let Some(last) = frame.last_mut() {
            *last = checksum;
        }
    }

    /// 校验一帧。
    pub fn verify(&self, frame: &[u8]) -> bool {
        match frame.last() {
            Some(&received) => self.kind.compute(self.window(frame)) == received,
            None => false,
        }
    }

    /// 构造出站帧 `[marker, opcode, ...payload, checksum]`。
    pub fn build(&self, marker: u8, opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(payload.len() + 3);
        frame.push(marker);
        frame.push(opcode);
        frame.extend_from_slice(payload);
        frame.push(0);
        self.seal(&mut frame);
        frame
    }
}

/// 读取一帧定长校验帧，失败时重试一次，仍失败则返回 `frame_len` 个零字节。
///
/// `attempt` 每调用一次就完成一次完整的请求/应答。超时与校验失败都会触发重试；
/// 其他设备错误（例如设备未打开）直接返回给调用方。
pub async fn read_with_retry<F, Fut>(layout: ChecksumLayout, frame_len: usize, mut attempt: F) -> Result<Vec<u8>, DeviceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<u8>, DeviceError>>,
{
    for round in 1..=2 {
        match attempt().await {
            Ok(frame) if frame.len() == frame_len && layout.verify(&frame) => return Ok(frame),
            Ok(frame) => {
                warn!("[校验帧] 第 {} 次读取校验失败: {:02x?}", round, frame);
            }
            Err(DeviceError::Timeout) => {
                warn!("[校验帧] 第 {} 次读取超时", round);
            }
            Err(e) => return Err(e),
        }
    }
    debug!("[校验帧] 两次读取均失败，返回全零结果");
    Ok(vec![0u8; frame_len])
}

/// 向设备发送请求帧并读取定长应答，带一次重试。
pub async fn request_frame(
    device: &SerialDevice,
    request: &[u8],
    layout: ChecksumLayout,
    frame_len: usize,
    timeout: Duration,
) -> Result<Vec<u8>, DeviceError> {
    read_with_retry(layout, frame_len, || async move {
        // 先订阅再写入，避免错过应答
        let mut rx = device.subscribe_data();
        device.write(request).await?;
        next_frame(&mut rx, timeout).await.map(|frame| frame.bytes)
    })
    .await
}
