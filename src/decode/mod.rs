//! 解码模块
//!
//! 播放流水线只通过 [`SourceDecoder`] 接触解码器：
//! 解码输出统一为非交织 f64 帧，关闭即 `Drop`。

mod decoder;
mod synthetic;

use std::path::Path;

use crate::audio::StreamFormat;

pub use decoder::{AudioInfo, SymphoniaDecoder};
pub use synthetic::{ramp_index, ramp_value, SyntheticSource, Waveform};

/// 解码错误
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// 文件打开失败
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),
    /// 格式不支持
    #[error("Unsupported audio format")]
    UnsupportedFormat,
    /// 没有找到音频轨道
    #[error("No audio track found")]
    NoAudioTrack,
    /// 解码器创建失败
    #[error("Failed to create decoder: {0}")]
    DecoderCreation(String),
    /// 解码失败
    #[error("Decode failed: {0}")]
    DecodeFailed(String),
    /// 源不支持定位
    #[error("Source does not support seeking")]
    SeekUnsupported,
    /// Seek 失败
    #[error("Seek failed: {0}")]
    SeekFailed(String),
}

/// 音频源解码器
///
/// 解码器在入队时把所有权交给播放器，此后只在解码线程上被调用
pub trait SourceDecoder: Send {
    /// 源格式（采样率、声道数）
    fn format(&self) -> StreamFormat;

    /// 解码最多 `max_frames` 帧到 `output[ch][..n]`
    ///
    /// `output` 至少有 `format().channels` 个平面，每个平面至少 `max_frames` 长。
    /// 返回 0 表示源已结束
    fn decode_frames(
        &mut self,
        output: &mut [Vec<f64>],
        max_frames: usize,
    ) -> Result<usize, DecodeError>;

    /// 定位到指定帧，返回实际位置
    fn seek_to_frame(&mut self, frame: u64) -> Result<u64, DecodeError>;

    fn supports_seeking(&self) -> bool;

    /// 总帧数（未知时为 None）
    fn total_frames(&self) -> Option<u64>;

    /// 用于日志和界面显示的描述（通常是路径）
    fn description(&self) -> &str;
}

/// 按路径打开文件解码器
pub fn open<P: AsRef<Path>>(path: P) -> Result<Box<dyn SourceDecoder>, DecodeError> {
    Ok(Box::new(SymphoniaDecoder::open(path)?))
}
