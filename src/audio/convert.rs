//! 格式转换阶段
//!
//! 把环形缓冲区中的非交织 f64 帧转换为设备需要的交织 f32 样本。
//! 转换器在 render 回调里运行：不分配、不加锁，
//! 音量等可调参数全部通过原子量读取。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::format::StreamFormat;

/// 可独立设置音量的输出声道上限
pub const MAX_VOLUME_CHANNELS: usize = 32;

/// render 回调使用的转换接口
///
/// 对 render 而言转换器是无状态的：同样的输入总是得到同样的输出
pub trait Converter: Send {
    /// 把 `input[ch][..frames]` 写成 `output[..frames * output_channels]`
    fn convert(
        &mut self,
        input: &[Vec<f64>],
        frames: usize,
        input_format: StreamFormat,
        output: &mut [f32],
        output_channels: usize,
    );
}

/// 主音量和逐声道音量
///
/// f32 以位模式存放在 AtomicU32 中，render 线程只做 Relaxed 读
pub struct VolumeControl {
    master: AtomicU32,
    channels: [AtomicU32; MAX_VOLUME_CHANNELS],
}

impl VolumeControl {
    pub fn new() -> Self {
        Self {
            master: AtomicU32::new(1.0f32.to_bits()),
            channels: std::array::from_fn(|_| AtomicU32::new(1.0f32.to_bits())),
        }
    }

    #[inline]
    pub fn master(&self) -> f32 {
        f32::from_bits(self.master.load(Ordering::Relaxed))
    }

    /// 设置主音量，范围 [0.0, 1.0]
    pub fn set_master(&self, volume: f32) {
        let clamped = sanitize(volume);
        self.master.store(clamped.to_bits(), Ordering::Relaxed);
    }

    /// 读取某个输出声道的音量；超出范围的声道为 None
    #[inline]
    pub fn channel(&self, channel: usize) -> Option<f32> {
        self.channels
            .get(channel)
            .map(|v| f32::from_bits(v.load(Ordering::Relaxed)))
    }

    /// 设置某个输出声道的音量；返回声道是否存在
    pub fn set_channel(&self, channel: usize, volume: f32) -> bool {
        match self.channels.get(channel) {
            Some(slot) => {
                slot.store(sanitize(volume).to_bits(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// 某声道的最终增益 = 主音量 × 声道音量
    #[inline]
    fn gain(&self, channel: usize) -> f32 {
        self.master() * self.channel(channel).unwrap_or(1.0)
    }
}

impl Default for VolumeControl {
    fn default() -> Self {
        Self::new()
    }
}

fn sanitize(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

/// 默认转换器：声道映射 + 音量 + 限幅
///
/// 映射规则：
/// - 同号声道直接对应
/// - 单声道源复制到前两个输出声道
/// - 单声道设备取前两个源声道的平均
/// - 其余输出声道填零
///
/// 不做采样率转换
pub struct ChannelMapConverter {
    volume: Arc<VolumeControl>,
}

impl ChannelMapConverter {
    pub fn new(volume: Arc<VolumeControl>) -> Self {
        Self { volume }
    }
}

impl Converter for ChannelMapConverter {
    fn convert(
        &mut self,
        input: &[Vec<f64>],
        frames: usize,
        input_format: StreamFormat,
        output: &mut [f32],
        output_channels: usize,
    ) {
        let in_channels = (input_format.channels as usize).min(input.len());
        let output = &mut output[..frames * output_channels];

        for out_ch in 0..output_channels {
            let gain = self.volume.gain(out_ch) as f64;

            // 选择来源
            let source: Source = if in_channels == 0 {
                Source::Silent
            } else if output_channels == 1 && in_channels >= 2 {
                Source::Downmix
            } else if out_ch < in_channels {
                Source::Plane(out_ch)
            } else if in_channels == 1 && out_ch < 2 {
                Source::Plane(0)
            } else {
                Source::Silent
            };

            for frame in 0..frames {
                let sample = match source {
                    Source::Plane(ch) => input[ch][frame],
                    Source::Downmix => (input[0][frame] + input[1][frame]) * 0.5,
                    Source::Silent => 0.0,
                };
                output[frame * output_channels + out_ch] =
                    (sample * gain).clamp(-1.0, 1.0) as f32;
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Source {
    Plane(usize),
    Downmix,
    Silent,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converter() -> (ChannelMapConverter, Arc<VolumeControl>) {
        let volume = Arc::new(VolumeControl::new());
        (ChannelMapConverter::new(Arc::clone(&volume)), volume)
    }

    #[test]
    fn test_stereo_interleave() {
        let (mut conv, _) = converter();
        let input = vec![vec![0.25, 0.5], vec![-0.25, -0.5]];
        let mut out = vec![9.0f32; 4];

        conv.convert(&input, 2, StreamFormat::new(44100, 2), &mut out, 2);
        assert_eq!(out, vec![0.25, -0.25, 0.5, -0.5]);
    }

    #[test]
    fn test_mono_upmix_and_extra_channels() {
        let (mut conv, _) = converter();
        let input = vec![vec![0.5, 0.125]];
        let mut out = vec![9.0f32; 8];

        conv.convert(&input, 2, StreamFormat::new(44100, 1), &mut out, 4);
        assert_eq!(out, vec![0.5, 0.5, 0.0, 0.0, 0.125, 0.125, 0.0, 0.0]);
    }

    #[test]
    fn test_stereo_to_mono_downmix() {
        let (mut conv, _) = converter();
        let input = vec![vec![0.5], vec![0.25]];
        let mut out = vec![0.0f32; 1];

        conv.convert(&input, 1, StreamFormat::new(48000, 2), &mut out, 1);
        assert_eq!(out, vec![0.375]);
    }

    #[test]
    fn test_volume_and_clipping() {
        let (mut conv, volume) = converter();
        volume.set_master(0.5);
        assert!(volume.set_channel(1, 0.5));
        assert!(!volume.set_channel(MAX_VOLUME_CHANNELS, 0.5));

        let input = vec![vec![4.0], vec![1.0]];
        let mut out = vec![0.0f32; 2];
        conv.convert(&input, 1, StreamFormat::new(44100, 2), &mut out, 2);

        // 4.0 * 0.5 超出范围被限幅
        assert_eq!(out, vec![1.0, 0.25]);
    }

    #[test]
    fn test_volume_sanitized() {
        let volume = VolumeControl::new();
        volume.set_master(3.0);
        assert_eq!(volume.master(), 1.0);
        volume.set_master(f32::NAN);
        assert_eq!(volume.master(), 0.0);
        assert_eq!(volume.channel(0), Some(1.0));
    }
}
