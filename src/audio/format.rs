//! 音频格式
//!
//! 流水线内部统一使用非交织 f64 样本（[-1, 1)），
//! 因此格式只需描述采样率和声道数；
//! 设备侧格式额外携带每次 render 回调的帧数（quantum）。

use std::fmt;

/// 解码源 / 环形缓冲区的格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl StreamFormat {
    /// 创建新的流格式
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// 每帧的样本数（= 声道数）
    #[inline]
    pub fn samples_per_frame(&self) -> usize {
        self.channels as usize
    }

    /// 帧数 → 秒
    #[inline]
    pub fn frames_to_secs(&self, frames: u64) -> f64 {
        frames as f64 / self.sample_rate as f64
    }

    /// 秒 → 帧数（向下取整，负数按 0 处理）
    #[inline]
    pub fn secs_to_frames(&self, secs: f64) -> u64 {
        (secs.max(0.0) * self.sample_rate as f64) as u64
    }
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self::new(44100, 2)
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz {}ch", self.sample_rate, self.channels)
    }
}

/// 输出设备格式
///
/// 输出固定为交织 f32，`buffer_frames` 为设备期望的 render quantum
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub buffer_frames: u32,
}

impl DeviceFormat {
    pub fn new(sample_rate: u32, channels: u16, buffer_frames: u32) -> Self {
        Self {
            sample_rate,
            channels,
            buffer_frames,
        }
    }

    /// 单次回调的时长（纳秒）
    #[inline]
    pub fn quantum_ns(&self) -> u64 {
        self.buffer_frames as u64 * 1_000_000_000 / self.sample_rate.max(1) as u64
    }

    /// 单次回调需要的交织样本数
    #[inline]
    pub fn samples_per_quantum(&self) -> usize {
        self.buffer_frames as usize * self.channels as usize
    }
}

impl Default for DeviceFormat {
    fn default() -> Self {
        Self::new(44100, 2, 512)
    }
}

impl fmt::Display for DeviceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz {}ch f32, {} frames/callback",
            self.sample_rate, self.channels, self.buffer_frames
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_time_conversion() {
        let format = StreamFormat::new(48000, 2);
        assert_eq!(format.secs_to_frames(1.5), 72000);
        assert_eq!(format.secs_to_frames(-2.0), 0);
        assert!((format.frames_to_secs(24000) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_device_quantum() {
        let format = DeviceFormat::new(48000, 2, 480);
        assert_eq!(format.quantum_ns(), 10_000_000);
        assert_eq!(format.samples_per_quantum(), 960);
    }
}
