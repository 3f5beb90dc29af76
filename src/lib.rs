//! Roger Gapless
//!
//! 无缝（gapless）音频播放引擎：
//! 解码线程 → lock-free ring buffer → 实时 render 回调，
//! 多个源首尾相接写入同一个缓冲区，源与源之间没有空隙。

pub mod audio;
pub mod decode;
pub mod engine;

pub use engine::{PlaybackState, Player, PlayerConfig, PlayerError, TrackPosition};
