//! 空输出设备
//!
//! 由一个按设备周期节拍的线程驱动 render 回调，输出直接丢弃。
//! 用于无声卡环境和 `--null` 模式。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::format::DeviceFormat;
use super::output::{OutputDevice, OutputError, RenderCallback};

pub struct NullOutput {
    format: DeviceFormat,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl NullOutput {
    pub fn new(format: DeviceFormat) -> Self {
        Self {
            format,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl OutputDevice for NullOutput {
    fn format(&self) -> DeviceFormat {
        self.format
    }

    fn start(&mut self, mut callback: Box<dyn RenderCallback>) -> Result<(), OutputError> {
        if self.thread.is_some() {
            return Err(OutputError::InvalidState("null output already running"));
        }

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let format = self.format;

        let handle = thread::Builder::new()
            .name("null-output".to_string())
            .spawn(move || {
                let mut buffer = vec![0.0f32; format.samples_per_quantum()];
                let period = Duration::from_nanos(format.quantum_ns().max(1));
                let mut deadline = Instant::now();

                while running.load(Ordering::Acquire) {
                    callback.render(&mut buffer);

                    // 按设备时钟节拍，落后时不追赶
                    deadline += period;
                    let now = Instant::now();
                    if deadline > now {
                        thread::sleep(deadline - now);
                    } else {
                        deadline = now;
                    }
                }
            })
            .map_err(|e| OutputError::BuildStream(e.to_string()))?;

        self.thread = Some(handle);
        log::info!("Null output started: {}", self.format);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), OutputError> {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                return Err(OutputError::Stream("null output thread panicked".to_string()));
            }
            log::info!("Null output stopped");
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    fn reconfigure(&mut self, format: DeviceFormat) -> Result<(), OutputError> {
        if self.is_running() {
            return Err(OutputError::InvalidState("cannot reconfigure a running device"));
        }
        self.format = format;
        Ok(())
    }

    fn take_error(&mut self) -> Option<OutputError> {
        None
    }
}

impl Drop for NullOutput {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct Counter(Arc<AtomicU64>);

    impl RenderCallback for Counter {
        fn render(&mut self, output: &mut [f32]) {
            output.fill(0.0);
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_null_output_drives_callback() {
        let calls = Arc::new(AtomicU64::new(0));
        let mut output = NullOutput::new(DeviceFormat::new(48000, 2, 48));

        output.start(Box::new(Counter(Arc::clone(&calls)))).unwrap();
        assert!(output.is_running());
        thread::sleep(Duration::from_millis(30));
        output.stop().unwrap();

        assert!(!output.is_running());
        assert!(calls.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_null_output_state_errors() {
        let calls = Arc::new(AtomicU64::new(0));
        let mut output = NullOutput::new(DeviceFormat::default());

        output.start(Box::new(Counter(Arc::clone(&calls)))).unwrap();
        assert!(output.start(Box::new(Counter(Arc::clone(&calls)))).is_err());
        assert!(output.reconfigure(DeviceFormat::new(96000, 2, 512)).is_err());

        output.stop().unwrap();
        output.reconfigure(DeviceFormat::new(96000, 2, 512)).unwrap();
        assert_eq!(output.format().sample_rate, 96000);
    }
}
