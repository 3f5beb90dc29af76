//! 输出设备接口
//!
//! 设备只负责两件事：以固定格式周期性地调用 render 回调，
//! 以及把异步发生的设备错误交还给控制线程。
//! 回调里禁止锁、分配、I/O。

use super::format::DeviceFormat;

/// 输出设备错误
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("No audio output device available")]
    NoDevice,
    #[error("Unsupported device format: {0}")]
    UnsupportedFormat(String),
    #[error("Failed to build output stream: {0}")]
    BuildStream(String),
    #[error("Output stream error: {0}")]
    Stream(String),
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
}

/// render 回调
///
/// `output` 为交织 f32 样本，长度是设备声道数的整数倍
pub trait RenderCallback: Send + 'static {
    fn render(&mut self, output: &mut [f32]);
}

/// 输出设备
pub trait OutputDevice: Send {
    /// 当前设备格式
    fn format(&self) -> DeviceFormat;

    /// 启动输出，设备接管回调直到 `stop`
    fn start(&mut self, callback: Box<dyn RenderCallback>) -> Result<(), OutputError>;

    /// 停止输出并丢弃回调；返回后回调不会再被调用
    fn stop(&mut self) -> Result<(), OutputError>;

    fn is_running(&self) -> bool;

    /// 以新格式重新配置设备（只能在停止状态下调用）
    fn reconfigure(&mut self, format: DeviceFormat) -> Result<(), OutputError>;

    /// 取出设备异步报告的错误（如有）
    fn take_error(&mut self) -> Option<OutputError>;
}
