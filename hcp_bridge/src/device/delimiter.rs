//! 接收数据的分帧器。
//!
//! 串口读到的字节块大小是任意的，分帧器把它们重新切分成设备协议意义上的完整帧，
//! 然后才打时间戳并广播给订阅者。

use std::fmt;
use std::sync::Arc;

/// 把连续的字节流切分成帧。
pub trait FrameSplitter: Send {
    /// 送入新读到的字节，返回其中所有已完整的帧。
    fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>>;

    /// 清空内部缓冲。
    fn reset(&mut self);
}

/// 自定义分帧器的构造函数；每个设备实例调用一次。
pub type SplitterFactory = Arc<dyn Fn() -> Box<dyn FrameSplitter> + Send + Sync>;

/// 设备接收路径上使用的分帧方式。
#[derive(Clone, Default)]
pub enum Delimiter {
    /// 不分帧：每次读到的字节块原样作为一帧
    #[default]
    None,
    /// 以固定字节序列结尾，帧内容不包含分隔符本身
    ByteSequence(Vec<u8>),
    /// 每帧固定长度
    FixedLength(usize),
    Custom(SplitterFactory),
}

impl fmt::Debug for Delimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delimiter::None => write!(f, "None"),
            Delimiter::ByteSequence(seq) => write!(f, "ByteSequence({:02x?})", seq),
            Delimiter::FixedLength(len) => write!(f, "FixedLength({})", len),
            Delimiter::Custom(_) => write!(f, "Custom"),
        }
    }
}

impl Delimiter {
    /// 为一个设备实例创建新的分帧器。
    pub fn splitter(&self) -> Box<dyn FrameSplitter> {
        match self {
            Delimiter::None => Box::new(RawSplitter),
            Delimiter::ByteSequence(seq) => Box::new(ByteSequenceSplitter::new(seq.clone())),
            Delimiter::FixedLength(len) => Box::new(FixedLengthSplitter::new(*len)),
            Delimiter::Custom(factory) => factory(),
        }
    }
}

/// 不做任何切分。
pub struct RawSplitter;

impl FrameSplitter for RawSplitter {
    fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        if bytes.is_empty() {
            Vec::new()
        } else {
            vec![bytes.to_vec()]
        }
    }

    fn reset(&mut self) {}
}

/// 按分隔字节序列切分，输出的帧不含分隔符，空帧被丢弃。
pub struct ByteSequenceSplitter {
    delimiter: Vec<u8>,
    buffer: Vec<u8>,
}

impl ByteSequenceSplitter {
    pub fn new(delimiter: Vec<u8>) -> Self {
        Self {
            delimiter,
            buffer: Vec::with_capacity(256),
        }
    }
}

impl FrameSplitter for ByteSequenceSplitter {
    fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        if self.delimiter.is_empty() {
            return RawSplitter.push(bytes);
        }
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let delim_len = self.delimiter.len();
        let mut start = 0;
        let mut i = 0;
        while i + delim_len <= self.buffer.len() {
            if self.buffer[i..i + delim_len] == self.delimiter[..] {
                if i > start {
                    frames.push(self.buffer[start..i].to_vec());
                }
                i += delim_len;
                start = i;
            } else {
                i += 1;
            }
        }
        self.buffer.drain(..start);
        frames
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// 每凑满 `len` 个字节输出一帧。
pub struct FixedLengthSplitter {
    len: usize,
    buffer: Vec<u8>,
}

impl FixedLengthSplitter {
    pub fn new(len: usize) -> Self {
        Self {
            len: len.max(1),
            buffer: Vec::with_capacity(len.max(1)),
        }
    }
}

impl FrameSplitter for FixedLengthSplitter {
    fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);
        let complete = self.buffer.len() / self.len * self.len;
        self.buffer
            .drain(..complete)
            .collect::<Vec<u8>>()
            .chunks(self.len)
            .map(<[u8]>::to_vec)
            .collect()
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}
