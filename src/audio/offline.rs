//! 离线输出设备
//!
//! 没有自己的时钟：由持有 [`OfflineHandle`] 的一方按需拉取样本，
//! 每次拉取按设备 quantum 分块调用 render 回调。
//! 测试和离线渲染用它来精确控制“设备”消费了多少帧。

use std::sync::Arc;

use parking_lot::Mutex;

use super::format::DeviceFormat;
use super::output::{OutputDevice, OutputError, RenderCallback};

struct OfflineState {
    format: DeviceFormat,
    callback: Option<Box<dyn RenderCallback>>,
    error: Option<OutputError>,
}

/// 离线设备（交给播放器）
pub struct OfflineOutput {
    state: Arc<Mutex<OfflineState>>,
}

/// 拉取端（留给调用方）
#[derive(Clone)]
pub struct OfflineHandle {
    state: Arc<Mutex<OfflineState>>,
}

impl OfflineOutput {
    pub fn new(format: DeviceFormat) -> (Self, OfflineHandle) {
        let state = Arc::new(Mutex::new(OfflineState {
            format,
            callback: None,
            error: None,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            OfflineHandle { state },
        )
    }
}

impl OfflineHandle {
    /// 拉取 `frames` 帧交织样本
    ///
    /// 设备未启动时返回静音
    pub fn pull(&self, frames: usize) -> Vec<f32> {
        let mut state = self.state.lock();
        let format = state.format;
        let channels = format.channels as usize;
        let quantum = (format.buffer_frames as usize).max(1);
        let mut output = vec![0.0f32; frames * channels];

        if let Some(callback) = state.callback.as_mut() {
            for chunk in output.chunks_mut(quantum * channels) {
                callback.render(chunk);
            }
        }
        output
    }

    pub fn format(&self) -> DeviceFormat {
        self.state.lock().format
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().callback.is_some()
    }

    /// 模拟设备异步报错
    pub fn inject_error(&self, error: OutputError) {
        self.state.lock().error = Some(error);
    }
}

impl OutputDevice for OfflineOutput {
    fn format(&self) -> DeviceFormat {
        self.state.lock().format
    }

    fn start(&mut self, callback: Box<dyn RenderCallback>) -> Result<(), OutputError> {
        let mut state = self.state.lock();
        if state.callback.is_some() {
            return Err(OutputError::InvalidState("offline output already running"));
        }
        state.callback = Some(callback);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), OutputError> {
        self.state.lock().callback = None;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.lock().callback.is_some()
    }

    fn reconfigure(&mut self, format: DeviceFormat) -> Result<(), OutputError> {
        let mut state = self.state.lock();
        if state.callback.is_some() {
            return Err(OutputError::InvalidState("cannot reconfigure a running device"));
        }
        state.format = format;
        Ok(())
    }

    fn take_error(&mut self) -> Option<OutputError> {
        self.state.lock().error.take()
    }
}
