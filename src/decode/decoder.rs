//! 音频文件解码器
//!
//! 使用 symphonia 库解码音频文件
//! 支持：FLAC, WAV, AIFF, MP3
//!
//! 所有样本格式统一转换为非交织 f64；
//! 一个 packet 解出的帧可能多于调用方一次需要的帧，剩余部分暂存在平面缓冲中。

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::conv::IntoSample;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;
use symphonia::core::units::{Time, TimeBase};

use super::{DecodeError, SourceDecoder};
use crate::audio::StreamFormat;

/// 暂存平面的初始容量（帧），覆盖常见 packet 大小
const PENDING_CAPACITY: usize = 16384;

/// 音频文件信息
#[derive(Debug, Clone)]
pub struct AudioInfo {
    /// 采样率
    pub sample_rate: u32,
    /// 声道数
    pub channels: u32,
    /// 位深度（原始格式）
    pub bit_depth: Option<u32>,
    /// 总帧数（如果已知）
    pub total_frames: Option<u64>,
    /// 总时长（秒）
    pub duration_secs: Option<f64>,
    /// 格式名称
    pub format: String,
    /// 编解码器名称
    pub codec: String,
}

/// 基于 symphonia 的文件解码器
pub struct SymphoniaDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    info: AudioInfo,
    format: StreamFormat,
    description: String,
    /// 已解码未交付的帧
    pending: Vec<Vec<f64>>,
    pending_pos: usize,
    /// seek 后需要丢弃的帧数（packet 边界到目标帧）
    skip_frames: u64,
    eof: bool,
}

impl SymphoniaDecoder {
    /// 打开音频文件
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DecodeError> {
        let path = path.as_ref();

        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        // 提示文件扩展名
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        // 开启 gapless：去掉编码器延迟和尾部填充
        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let metadata_opts = MetadataOptions::default();

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &metadata_opts)
            .map_err(|_| DecodeError::UnsupportedFormat)?;

        let reader = probed.format;
        let format_name = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|s| s.to_uppercase())
            .unwrap_or_else(|| "Unknown".to_string());

        // 查找第一个音频轨道
        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecodeError::NoAudioTrack)?;

        let track_id = track.id;
        let codec_params = &track.codec_params;

        let sample_rate = codec_params.sample_rate.ok_or(DecodeError::NoAudioTrack)?;
        let channels = codec_params
            .channels
            .map(|c| c.count() as u32)
            .unwrap_or(2);
        let total_frames = codec_params.n_frames;
        let duration_secs = total_frames.map(|f| f as f64 / sample_rate as f64);

        let codec_name = symphonia::default::get_codecs()
            .get_codec(codec_params.codec)
            .map(|c| c.short_name.to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        let info = AudioInfo {
            sample_rate,
            channels,
            bit_depth: codec_params.bits_per_sample,
            total_frames,
            duration_secs,
            format: format_name,
            codec: codec_name,
        };

        let decoder = symphonia::default::get_codecs()
            .make(codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::DecoderCreation(e.to_string()))?;

        let time_base = codec_params.time_base;
        let pending = (0..channels)
            .map(|_| Vec::with_capacity(PENDING_CAPACITY))
            .collect();

        log::debug!(
            "Opened {}: {} | {}Hz {}ch | {} frames",
            path.display(),
            info.codec,
            sample_rate,
            channels,
            total_frames.map_or_else(|| "?".to_string(), |f| f.to_string())
        );

        Ok(Self {
            reader,
            decoder,
            track_id,
            time_base,
            info,
            format: StreamFormat::new(sample_rate, channels as u16),
            description: path.display().to_string(),
            pending,
            pending_pos: 0,
            skip_frames: 0,
            eof: false,
        })
    }

    /// 获取音频信息
    pub fn info(&self) -> &AudioInfo {
        &self.info
    }

    #[inline]
    fn pending_frames(&self) -> usize {
        self.pending.first().map_or(0, |p| p.len()) - self.pending_pos
    }

    /// 解码下一个 packet 到暂存平面；返回 false 表示文件结束
    fn refill(&mut self) -> Result<bool, DecodeError> {
        for plane in self.pending.iter_mut() {
            plane.clear();
        }
        self.pending_pos = 0;

        loop {
            let packet = match self.reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.eof = true;
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => {
                    log::warn!("{}: stream reset required, ending track", self.description);
                    self.eof = true;
                    return Ok(false);
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            // 跳过非目标轨道
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(e)) => {
                    // 跳过损坏的帧
                    log::warn!("{}: skipping corrupt packet: {}", self.description, e);
                    continue;
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            let frames = decoded.frames();
            let skip = self.skip_frames.min(frames as u64) as usize;
            self.skip_frames -= skip as u64;
            if skip == frames {
                continue;
            }

            let pending = &mut self.pending;
            match decoded {
                AudioBufferRef::U8(buf) => append_planes(&*buf, pending, skip),
                AudioBufferRef::U16(buf) => append_planes(&*buf, pending, skip),
                AudioBufferRef::U24(buf) => append_planes(&*buf, pending, skip),
                AudioBufferRef::U32(buf) => append_planes(&*buf, pending, skip),
                AudioBufferRef::S8(buf) => append_planes(&*buf, pending, skip),
                AudioBufferRef::S16(buf) => append_planes(&*buf, pending, skip),
                AudioBufferRef::S24(buf) => append_planes(&*buf, pending, skip),
                AudioBufferRef::S32(buf) => append_planes(&*buf, pending, skip),
                AudioBufferRef::F32(buf) => append_planes(&*buf, pending, skip),
                AudioBufferRef::F64(buf) => append_planes(&*buf, pending, skip),
            }
            return Ok(true);
        }
    }

    /// time base 是否恰好为 1/采样率（时间戳即帧号）
    fn frame_time_base(&self) -> bool {
        self.time_base
            .map_or(false, |tb| tb.numer == 1 && tb.denom == self.format.sample_rate)
    }

    /// 时间戳（time base 单位）→ 帧
    fn ts_to_frames(&self, ts: u64) -> u64 {
        if self.frame_time_base() {
            return ts;
        }
        match self.time_base {
            Some(tb) => {
                let time = tb.calc_time(ts);
                let rate = self.format.sample_rate as u64;
                time.seconds * rate + (time.frac * rate as f64).round() as u64
            }
            None => ts,
        }
    }
}

/// 把 `buf[skip..]` 追加到各声道平面
///
/// 源声道少于平面数时，多出的平面补零，保证所有平面等长
fn append_planes<S>(buf: &AudioBuffer<S>, planes: &mut [Vec<f64>], skip: usize)
where
    S: Sample + IntoSample<f64>,
{
    let channels = buf.spec().channels.count();
    let frames = buf.frames();

    for (ch, plane) in planes.iter_mut().enumerate() {
        if ch < channels {
            plane.extend(buf.chan(ch)[skip..frames].iter().map(|&s| s.into_sample()));
        } else {
            plane.resize(plane.len() + frames - skip, 0.0);
        }
    }
}

impl SourceDecoder for SymphoniaDecoder {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn decode_frames(
        &mut self,
        output: &mut [Vec<f64>],
        max_frames: usize,
    ) -> Result<usize, DecodeError> {
        let channels = self.pending.len().min(output.len());
        let mut written = 0;

        while written < max_frames {
            let available = self.pending_frames();
            if available > 0 {
                let n = available.min(max_frames - written);
                let start = self.pending_pos;
                for (out, plane) in output.iter_mut().zip(&self.pending).take(channels) {
                    out[written..written + n].copy_from_slice(&plane[start..start + n]);
                }
                self.pending_pos += n;
                written += n;
                continue;
            }

            if self.eof || !self.refill()? {
                break;
            }
        }

        Ok(written)
    }

    fn seek_to_frame(&mut self, frame: u64) -> Result<u64, DecodeError> {
        if let Some(total) = self.info.total_frames {
            if frame > total {
                return Err(DecodeError::SeekFailed(format!(
                    "frame {} beyond end ({} frames)",
                    frame, total
                )));
            }
        }

        let rate = self.format.sample_rate as u64;
        let seek_to = if self.frame_time_base() {
            SeekTo::TimeStamp {
                ts: frame,
                track_id: self.track_id,
            }
        } else {
            SeekTo::Time {
                time: Time::new(frame / rate, (frame % rate) as f64 / rate as f64),
                track_id: Some(self.track_id),
            }
        };

        let seeked = self
            .reader
            .seek(SeekMode::Accurate, seek_to)
            .map_err(|e| DecodeError::SeekFailed(e.to_string()))?;

        // 重置解码器状态
        self.decoder.reset();
        for plane in self.pending.iter_mut() {
            plane.clear();
        }
        self.pending_pos = 0;
        self.eof = false;

        // reader 落在目标之前的 packet 边界上，多出的帧在解码时丢弃
        let required = self.ts_to_frames(seeked.required_ts);
        let actual = self.ts_to_frames(seeked.actual_ts);
        self.skip_frames = required.saturating_sub(actual);

        log::debug!(
            "{}: seek to frame {} (packet at {}, skipping {})",
            self.description,
            required,
            actual,
            self.skip_frames
        );
        Ok(required)
    }

    fn supports_seeking(&self) -> bool {
        true
    }

    fn total_frames(&self) -> Option<u64> {
        self.info.total_frames
    }

    fn description(&self) -> &str {
        &self.description
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    /// 写一个 16-bit PCM 立体声 WAV：左声道 i*10，右声道 -i*10
    fn write_wav(name: &str, sample_rate: u32, frames: u32) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "roger-gapless-{}-{}.wav",
            std::process::id(),
            name
        ));
        let channels = 2u16;
        let data_len = frames * channels as u32 * 2;

        let mut bytes = Vec::with_capacity(44 + data_len as usize);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * channels as u32 * 2).to_le_bytes());
        bytes.extend_from_slice(&(channels * 2).to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for i in 0..frames {
            let sample = (i * 10) as i16;
            bytes.extend_from_slice(&sample.to_le_bytes());
            bytes.extend_from_slice(&(-sample).to_le_bytes());
        }

        let mut file = File::create(&path).unwrap();
        file.write_all(&bytes).unwrap();
        path
    }

    fn expected(frame: u64) -> f64 {
        (frame * 10) as f64 / 32768.0
    }

    #[test]
    fn test_decode_wav_frames() {
        let path = write_wav("decode", 8000, 2000);
        let mut decoder = SymphoniaDecoder::open(&path).unwrap();

        assert_eq!(decoder.format(), StreamFormat::new(8000, 2));
        assert_eq!(decoder.total_frames(), Some(2000));
        assert_eq!(decoder.info().format, "WAV");

        let mut planes = vec![vec![0.0; 300]; 2];
        let mut total = 0u64;
        loop {
            let n = decoder.decode_frames(&mut planes, 300).unwrap();
            if n == 0 {
                break;
            }
            for i in 0..n {
                let frame = total + i as u64;
                assert!((planes[0][i] - expected(frame)).abs() < 1e-9);
                assert!((planes[1][i] + expected(frame)).abs() < 1e-9);
            }
            total += n as u64;
        }
        assert_eq!(total, 2000);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_seek_wav_is_frame_accurate() {
        let path = write_wav("seek", 8000, 2000);
        let mut decoder = SymphoniaDecoder::open(&path).unwrap();

        let mut planes = vec![vec![0.0; 64]; 2];
        decoder.decode_frames(&mut planes, 64).unwrap();

        assert_eq!(decoder.seek_to_frame(1234).unwrap(), 1234);
        let n = decoder.decode_frames(&mut planes, 64).unwrap();
        assert_eq!(n, 64);
        assert!((planes[0][0] - expected(1234)).abs() < 1e-9);
        assert!((planes[0][63] - expected(1297)).abs() < 1e-9);

        assert!(decoder.seek_to_frame(5000).is_err());

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_open_missing_file() {
        let result = SymphoniaDecoder::open("/nonexistent/roger-gapless.flac");
        assert!(matches!(result, Err(DecodeError::FileOpen(_))));
    }

    #[test]
    #[ignore] // 需要实际音频文件
    fn test_decode_flac() {
        let decoder = SymphoniaDecoder::open("test.flac").unwrap();
        println!("Info: {:?}", decoder.info());
    }
}
