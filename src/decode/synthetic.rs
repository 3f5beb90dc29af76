//! 合成音源
//!
//! 确定性的解码器实现：斜坡（每帧样本值编码帧号）、正弦、静音。
//! 可注入慢解码、卡顿和解码失败，供流水线测试和 `tone` 命令使用。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{DecodeError, SourceDecoder};
use crate::audio::StreamFormat;

/// 斜坡周期（帧）：2^16 个不同取值，f32 可精确表示
const RAMP_PERIOD: u64 = 1 << 16;

/// 帧号 → 斜坡样本值，范围 [0, 1)
#[inline]
pub fn ramp_value(index: u64) -> f64 {
    (index % RAMP_PERIOD) as f64 / RAMP_PERIOD as f64
}

/// 斜坡样本值 → 帧号（对 2^16 取模）
#[inline]
pub fn ramp_index(sample: f32) -> u64 {
    (sample as f64 * RAMP_PERIOD as f64).round() as u64
}

/// 波形
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Waveform {
    /// 第 i 帧的样本值为 `ramp_value(offset + i)`，所有声道相同
    Ramp { offset: u64 },
    Sine { frequency: f64, amplitude: f64 },
    Silence,
}

pub struct SyntheticSource {
    format: StreamFormat,
    waveform: Waveform,
    total: u64,
    length_known: bool,
    position: u64,
    seekable: bool,
    decode_delay: Option<Duration>,
    seek_delay: Option<Duration>,
    stall: Option<Arc<AtomicBool>>,
    fail_at: Option<u64>,
    description: String,
}

impl SyntheticSource {
    pub fn new(format: StreamFormat, waveform: Waveform, total_frames: u64) -> Self {
        let description = match waveform {
            Waveform::Ramp { offset } => format!("ramp+{} ({} frames)", offset, total_frames),
            Waveform::Sine { frequency, .. } => {
                format!("sine {:.1}Hz ({} frames)", frequency, total_frames)
            }
            Waveform::Silence => format!("silence ({} frames)", total_frames),
        };

        Self {
            format,
            waveform,
            total: total_frames,
            length_known: true,
            position: 0,
            seekable: true,
            decode_delay: None,
            seek_delay: None,
            stall: None,
            fail_at: None,
            description,
        }
    }

    /// 斜坡源
    pub fn ramp(format: StreamFormat, offset: u64, total_frames: u64) -> Self {
        Self::new(format, Waveform::Ramp { offset }, total_frames)
    }

    /// 正弦源，时长按秒计
    pub fn sine(format: StreamFormat, frequency: f64, amplitude: f64, secs: f64) -> Self {
        let frames = format.secs_to_frames(secs);
        Self::new(format, Waveform::Sine { frequency, amplitude }, frames)
    }

    /// 禁止定位
    pub fn non_seekable(mut self) -> Self {
        self.seekable = false;
        self
    }

    /// 不报告总长度
    pub fn unknown_length(mut self) -> Self {
        self.length_known = false;
        self
    }

    /// 每次解码调用前休眠
    pub fn with_decode_delay(mut self, delay: Duration) -> Self {
        self.decode_delay = Some(delay);
        self
    }

    /// 每次定位前休眠，模拟慢速 I/O
    pub fn with_seek_delay(mut self, delay: Duration) -> Self {
        self.seek_delay = Some(delay);
        self
    }

    /// 开关为 true 时解码调用阻塞，模拟 I/O 卡顿
    pub fn with_stall(mut self, stall: Arc<AtomicBool>) -> Self {
        self.stall = Some(stall);
        self
    }

    /// 解码到第 `frame` 帧时报错
    pub fn fail_after(mut self, frame: u64) -> Self {
        self.fail_at = Some(frame);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[inline]
    fn sample(&self, index: u64) -> f64 {
        match self.waveform {
            Waveform::Ramp { offset } => ramp_value(offset + index),
            Waveform::Sine {
                frequency,
                amplitude,
            } => {
                let t = index as f64 / self.format.sample_rate as f64;
                amplitude * (2.0 * std::f64::consts::PI * frequency * t).sin()
            }
            Waveform::Silence => 0.0,
        }
    }
}

impl SourceDecoder for SyntheticSource {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn decode_frames(
        &mut self,
        output: &mut [Vec<f64>],
        max_frames: usize,
    ) -> Result<usize, DecodeError> {
        if let Some(delay) = self.decode_delay {
            std::thread::sleep(delay);
        }
        if let Some(stall) = &self.stall {
            while stall.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        let limit = match self.fail_at {
            Some(fail_at) if self.position >= fail_at => {
                return Err(DecodeError::DecodeFailed(format!(
                    "{}: injected failure at frame {}",
                    self.description, self.position
                )));
            }
            Some(fail_at) => fail_at.min(self.total),
            None => self.total,
        };

        let frames = (limit - self.position.min(limit)).min(max_frames as u64) as usize;
        let channels = self.format.channels as usize;
        for i in 0..frames {
            let value = self.sample(self.position + i as u64);
            for plane in output.iter_mut().take(channels) {
                plane[i] = value;
            }
        }

        self.position += frames as u64;
        Ok(frames)
    }

    fn seek_to_frame(&mut self, frame: u64) -> Result<u64, DecodeError> {
        if !self.seekable {
            return Err(DecodeError::SeekUnsupported);
        }
        if let Some(delay) = self.seek_delay {
            std::thread::sleep(delay);
        }
        if frame > self.total {
            return Err(DecodeError::SeekFailed(format!(
                "frame {} beyond end ({} frames)",
                frame, self.total
            )));
        }
        self.position = frame;
        Ok(frame)
    }

    fn supports_seeking(&self) -> bool {
        self.seekable
    }

    fn total_frames(&self) -> Option<u64> {
        self.length_known.then_some(self.total)
    }

    fn description(&self) -> &str {
        &self.description
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(source: &mut SyntheticSource, quantum: usize) -> Vec<f64> {
        let mut planes = vec![vec![0.0; quantum]; source.format().channels as usize];
        let mut out = Vec::new();
        loop {
            let n = source.decode_frames(&mut planes, quantum).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&planes[0][..n]);
        }
    }

    #[test]
    fn test_ramp_encodes_frame_index() {
        let mut source = SyntheticSource::ramp(StreamFormat::new(44100, 2), 10, 100);
        let samples = decode_all(&mut source, 32);

        assert_eq!(samples.len(), 100);
        for (i, &s) in samples.iter().enumerate() {
            assert_eq!(ramp_index(s as f32), 10 + i as u64);
        }
    }

    #[test]
    fn test_seek_and_non_seekable() {
        let format = StreamFormat::new(44100, 1);
        let mut source = SyntheticSource::ramp(format, 0, 100);
        assert_eq!(source.seek_to_frame(40).unwrap(), 40);
        let samples = decode_all(&mut source, 16);
        assert_eq!(samples.len(), 60);
        assert_eq!(ramp_index(samples[0] as f32), 40);
        assert!(source.seek_to_frame(101).is_err());

        let mut fixed = SyntheticSource::ramp(format, 0, 100).non_seekable();
        assert!(!fixed.supports_seeking());
        assert!(matches!(
            fixed.seek_to_frame(10),
            Err(DecodeError::SeekUnsupported)
        ));
    }

    #[test]
    fn test_injected_failure() {
        let mut source = SyntheticSource::ramp(StreamFormat::new(44100, 1), 0, 100).fail_after(30);
        let mut planes = vec![vec![0.0; 64]];

        assert_eq!(source.decode_frames(&mut planes, 64).unwrap(), 30);
        assert!(source.decode_frames(&mut planes, 64).is_err());
    }

    #[test]
    fn test_unknown_length() {
        let source = SyntheticSource::ramp(StreamFormat::default(), 0, 10).unknown_length();
        assert_eq!(source.total_frames(), None);
    }

    #[test]
    fn test_sine_amplitude() {
        let format = StreamFormat::new(8000, 1);
        let mut source = SyntheticSource::sine(format, 1000.0, 0.5, 0.01);
        let samples = decode_all(&mut source, 20);
        assert_eq!(samples.len(), 80);
        assert!(samples.iter().all(|s| s.abs() <= 0.5 + 1e-12));
        assert!(samples.iter().any(|s| s.abs() > 0.4));
    }
}
