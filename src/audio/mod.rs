//! 音频核心模块
//!
//! 包含：
//! - Ring Buffer: Lock-free 非交织帧传递
//! - Format: 流格式与设备格式
//! - Convert: render 回调里的声道映射与音量
//! - Stats: 播放统计
//! - Output: 输出设备接口及参考实现（null / offline / cpal）

pub mod convert;
pub mod format;
pub mod null;
pub mod offline;
pub mod output;
pub mod ring_buffer;
pub mod stats;

#[cfg(feature = "cpal")]
pub mod cpal_output;

pub use convert::{ChannelMapConverter, Converter, VolumeControl};
pub use format::{DeviceFormat, StreamFormat};
pub use null::NullOutput;
pub use offline::{OfflineHandle, OfflineOutput};
pub use output::{OutputDevice, OutputError, RenderCallback};
pub use ring_buffer::RingBuffer;
pub use stats::{PlaybackStats, StatsReport};

#[cfg(feature = "cpal")]
pub use cpal_output::CpalOutput;
