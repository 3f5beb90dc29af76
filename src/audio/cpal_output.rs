//! cpal 输出设备（feature `cpal`）
//!
//! cpal 的 `Stream` 不是 `Send`，因此流由一个专用线程创建并持有，
//! 控制端只通过通道通知它退出。仅支持 f32 设备格式。

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;

use super::format::DeviceFormat;
use super::output::{OutputDevice, OutputError, RenderCallback};

/// 默认 quantum（cpal 使用设备默认 buffer size，这里只作统计与预分配参考）
const DEFAULT_BUFFER_FRAMES: u32 = 512;

struct StreamWorker {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct CpalOutput {
    format: DeviceFormat,
    errors: Arc<Mutex<Option<OutputError>>>,
    worker: Option<StreamWorker>,
}

impl CpalOutput {
    /// 打开系统默认输出设备
    pub fn open_default() -> Result<Self, OutputError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or(OutputError::NoDevice)?;
        let config = device
            .default_output_config()
            .map_err(|e| OutputError::UnsupportedFormat(e.to_string()))?;

        if config.sample_format() != cpal::SampleFormat::F32 {
            return Err(OutputError::UnsupportedFormat(format!(
                "{:?} (only f32 output is supported)",
                config.sample_format()
            )));
        }

        let format = DeviceFormat::new(
            config.sample_rate().0,
            config.channels(),
            DEFAULT_BUFFER_FRAMES,
        );
        log::info!(
            "Output device: {} ({})",
            device.name().unwrap_or_else(|_| "Unknown".to_string()),
            format
        );

        Ok(Self {
            format,
            errors: Arc::new(Mutex::new(None)),
            worker: None,
        })
    }
}

fn run_stream(
    format: DeviceFormat,
    mut callback: Box<dyn RenderCallback>,
    errors: Arc<Mutex<Option<OutputError>>>,
    ready: mpsc::Sender<Result<(), OutputError>>,
    stop: mpsc::Receiver<()>,
) {
    let build = || -> Result<cpal::Stream, OutputError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or(OutputError::NoDevice)?;
        let config = cpal::StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    callback.render(data);
                },
                move |err| {
                    log::error!("Audio stream error: {}", err);
                    *errors.lock() = Some(OutputError::Stream(err.to_string()));
                },
                None,
            )
            .map_err(|e| OutputError::BuildStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| OutputError::Stream(e.to_string()))?;
        Ok(stream)
    };

    match build() {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            // 阻塞直到控制端要求停止（或控制端被丢弃）
            let _ = stop.recv();
            drop(stream);
        }
        Err(e) => {
            let _ = ready.send(Err(e));
        }
    }
}

impl OutputDevice for CpalOutput {
    fn format(&self) -> DeviceFormat {
        self.format
    }

    fn start(&mut self, callback: Box<dyn RenderCallback>) -> Result<(), OutputError> {
        if self.worker.is_some() {
            return Err(OutputError::InvalidState("cpal output already running"));
        }

        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel();
        let format = self.format;
        let errors = Arc::clone(&self.errors);

        let handle = thread::Builder::new()
            .name("cpal-output".to_string())
            .spawn(move || run_stream(format, callback, errors, ready_tx, stop_rx))
            .map_err(|e| OutputError::BuildStream(e.to_string()))?;

        let started = ready_rx
            .recv()
            .unwrap_or(Err(OutputError::Stream("output thread exited".to_string())));

        match started {
            Ok(()) => {
                self.worker = Some(StreamWorker {
                    stop: stop_tx,
                    handle,
                });
                log::info!("Audio stream started");
                Ok(())
            }
            Err(e) => {
                let _ = handle.join();
                Err(e)
            }
        }
    }

    fn stop(&mut self) -> Result<(), OutputError> {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop.send(());
            if worker.handle.join().is_err() {
                return Err(OutputError::Stream("output thread panicked".to_string()));
            }
            log::info!("Audio stream stopped");
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    fn reconfigure(&mut self, format: DeviceFormat) -> Result<(), OutputError> {
        if self.is_running() {
            return Err(OutputError::InvalidState("cannot reconfigure a running device"));
        }
        self.format = format;
        Ok(())
    }

    fn take_error(&mut self) -> Option<OutputError> {
        self.errors.lock().take()
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // 需要音频设备
    fn test_open_default_device() {
        let output = CpalOutput::open_default().unwrap();
        println!("Device format: {}", output.format());
        assert!(output.format().channels > 0);
    }
}
