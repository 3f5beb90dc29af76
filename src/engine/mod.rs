//! 播放引擎
//!
//! 整合解码、缓冲、输出各模块
//! 核心设计：解码线程、回收线程与 render 回调完全解耦，
//! 通过 lock-free ring buffer 和原子任务表连接。
//!
//! 数据流：enqueue → 待播队列 → 解码线程 → ring buffer → render → 转换 → 设备
//! 控制流：Player → 标志位/队列/命令 → 唤醒解码线程；render 进度 → 唤醒回收线程

mod collector;
mod decode_thread;
mod render;
mod shared;
mod task;

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::audio::{
    ChannelMapConverter, DeviceFormat, OutputDevice, OutputError, RingBuffer, StatsReport,
    VolumeControl,
};
use crate::decode::{self, DecodeError, SourceDecoder};

use collector::Collector;
use decode_thread::{Command, DecodeWorker};
use shared::{Session, Shared};
use task::{flags, Control};

pub use render::Renderer;
pub use task::TASK_SLOTS;

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

/// 播放器配置
#[derive(Clone, Debug)]
pub struct PlayerConfig {
    /// Ring buffer 容量（帧，会被向上取整到 2 的幂）
    /// 越大越稳定，但 seek 后重新填充的量也越大
    pub buffer_frames: usize,
    /// 解码线程每次解码的帧数
    pub decode_quantum: usize,
    /// 流水线支持的最大声道数
    pub max_channels: usize,
    /// render 单次处理的最大帧数（暂存平面大小），更大的回调会分块处理
    pub max_render_frames: usize,
    /// 是否 mlock 缓冲区内存
    pub lock_memory: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            // 约 3 秒 @ 44.1kHz
            buffer_frames: 1 << 17,
            decode_quantum: 4096,
            max_channels: 8,
            max_render_frames: 8192,
            lock_memory: true,
        }
    }
}

/// 播放器错误
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("Source error: {0}")]
    Source(#[from] DecodeError),
    #[error("Output error: {0}")]
    Device(#[from] OutputError),
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
    #[error("Nothing queued for playback")]
    NothingQueued,
    #[error("Source has {channels} channels, at most {max} are supported")]
    TooManyChannels { channels: u16, max: usize },
    #[error("No source is playing")]
    NoPlayingTask,
    #[error("Playing source does not support seeking")]
    SeekUnsupported,
    #[error("Seek target {frame} is beyond the end of the track ({total} frames)")]
    SeekOutOfRange { frame: u64, total: u64 },
    #[error("Seek failed: {0}")]
    Seek(DecodeError),
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(std::io::Error),
}

/// 正在播放的音轨内的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackPosition {
    /// 音轨内已播放的帧数
    pub frame: u64,
    pub total: Option<u64>,
    pub sample_rate: u32,
}

/// 一次会话的工作线程
struct Workers {
    session: Arc<Session>,
    commands: Sender<Command>,
    decode: JoinHandle<()>,
    collector: JoinHandle<()>,
}

/// 播放控制器
pub struct Player {
    config: PlayerConfig,
    shared: Arc<Shared>,
    control: Arc<Mutex<Control>>,
    volume: Arc<VolumeControl>,
    device: Box<dyn OutputDevice>,
    workers: Option<Workers>,
}

impl Player {
    /// 创建播放器
    pub fn new(config: PlayerConfig, device: Box<dyn OutputDevice>) -> Self {
        let capacity = config.buffer_frames.max(config.decode_quantum);
        let buffer = RingBuffer::with_min_capacity(2, capacity);
        if config.lock_memory {
            buffer.lock_memory();
        }

        let format = device.format();
        log::info!(
            "Player created: buffer {} frames, quantum {} frames, device {}",
            buffer.capacity(),
            config.decode_quantum,
            format
        );

        Self {
            shared: Arc::new(Shared::new(buffer, format.sample_rate)),
            control: Arc::new(Mutex::new(Control::new())),
            volume: Arc::new(VolumeControl::new()),
            device,
            workers: None,
            config,
        }
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // 队列

    /// 把解码器加入待播队列（所有权转移给播放器）
    pub fn enqueue(&self, decoder: Box<dyn SourceDecoder>) -> Result<(), PlayerError> {
        let format = decoder.format();
        if format.channels == 0 || format.sample_rate == 0 {
            return Err(PlayerError::Source(DecodeError::UnsupportedFormat));
        }
        if format.channels as usize > self.config.max_channels {
            return Err(PlayerError::TooManyChannels {
                channels: format.channels,
                max: self.config.max_channels,
            });
        }

        let device_rate = self.device.format().sample_rate;
        if format.sample_rate != device_rate {
            log::warn!(
                "{}: {}Hz source on a {}Hz device, no sample rate conversion is performed",
                decoder.description(),
                format.sample_rate,
                device_rate
            );
        }

        let total = decoder.total_frames();
        log::info!("Enqueued: {} ({})", decoder.description(), format);
        self.control.lock().queue.push_back(decoder);
        self.shared.account_source(total);
        self.wake_decode();
        Ok(())
    }

    /// 打开文件并加入待播队列
    pub fn enqueue_path<P: AsRef<Path>>(&self, path: P) -> Result<(), PlayerError> {
        let decoder = decode::open(path)?;
        self.enqueue(decoder)
    }

    /// 丢弃所有尚未开始解码的源，返回丢弃个数
    pub fn clear_queue(&self) -> usize {
        let dropped = std::mem::take(&mut self.control.lock().queue);
        for decoder in &dropped {
            self.shared.unaccount_source(decoder.total_frames());
        }
        let count = dropped.len();
        drop(dropped);

        if count > 0 {
            log::info!("Cleared {} queued source(s)", count);
        }
        count
    }

    /// 待播队列长度
    pub fn queued(&self) -> usize {
        self.control.lock().queue.len()
    }

    // ------------------------------------------------------------------
    // 传输控制

    /// 开始或恢复播放
    pub fn play(&mut self) -> Result<(), PlayerError> {
        match self.shared.state() {
            PlaybackState::Playing => return Ok(()),
            PlaybackState::Paused => {
                self.shared.set_state(PlaybackState::Playing);
                self.wake_decode();
                log::info!("Resumed");
                return Ok(());
            }
            PlaybackState::Stopped => {}
        }

        if self.queued() == 0 && self.shared.tasks.is_empty() {
            return Err(PlayerError::NothingQueued);
        }

        // 自然结束后工作线程和设备仍在运行：先收掉上一次会话
        if let Err(e) = self.end_session() {
            return Err(self.fail_device(e));
        }
        self.begin_session();

        self.spawn_workers()?;
        if let Err(e) = self.start_device() {
            return Err(self.fail_device(e));
        }

        self.shared.set_state(PlaybackState::Playing);
        self.wake_decode();
        log::info!("Playback started");
        Ok(())
    }

    /// 暂停：render 输出静音，位置不前进
    pub fn pause(&mut self) -> Result<(), PlayerError> {
        match self.shared.state() {
            PlaybackState::Playing => {
                self.shared.set_state(PlaybackState::Paused);
                log::info!("Paused");
                Ok(())
            }
            PlaybackState::Paused => Ok(()),
            PlaybackState::Stopped => Err(PlayerError::InvalidState("Cannot pause when stopped")),
        }
    }

    /// 暂停/恢复
    pub fn play_pause(&mut self) -> Result<(), PlayerError> {
        if self.shared.state() == PlaybackState::Playing {
            self.pause()
        } else {
            self.play()
        }
    }

    /// 停止播放：退出工作线程、停止设备、释放所有解码器
    pub fn stop(&mut self) -> Result<(), PlayerError> {
        let previous = self.shared.state();
        self.shared.set_state(PlaybackState::Stopped);

        let device_result = self.end_session();

        // 解码器在锁外释放
        let (queued, tasks) = {
            let mut control = self.control.lock();
            let queued = std::mem::take(&mut control.queue);
            let tasks = control.drain_tasks(&self.shared.tasks);
            (queued, tasks)
        };
        drop(queued);
        drop(tasks);

        // 没有任何线程再访问缓冲区
        self.shared.buffer.reset();
        self.shared.reset_counters();

        if previous != PlaybackState::Stopped {
            log::info!("Playback stopped");
        }
        device_result.map_err(PlayerError::from)
    }

    // ------------------------------------------------------------------
    // Seek

    /// 定位到正在播放的音轨内的某一帧，返回实际位置
    ///
    /// 没有正在播放的源、源不可定位或目标越界时失败，且不产生任何副作用
    pub fn seek_to_frame(&self, frame: u64) -> Result<u64, PlayerError> {
        if self.shared.state() == PlaybackState::Stopped {
            return Err(PlayerError::InvalidState("Cannot seek when stopped"));
        }
        let workers = self
            .workers
            .as_ref()
            .ok_or(PlayerError::InvalidState("decode thread not running"))?;

        let (slot, sequence) = self.shared.tasks.playing().ok_or(PlayerError::NoPlayingTask)?;
        let task = self.shared.tasks.slot(slot);
        if !task.has(flags::SEEKABLE) {
            return Err(PlayerError::SeekUnsupported);
        }
        if let Some(total) = task.total_frames() {
            if frame >= total {
                return Err(PlayerError::SeekOutOfRange { frame, total });
            }
        }

        let (reply, result) = mpsc::channel();
        workers
            .commands
            .send(Command::Seek {
                slot,
                sequence,
                frame,
                reply,
            })
            .map_err(|_| PlayerError::InvalidState("decode thread not running"))?;
        workers.session.wake_decode();

        result
            .recv()
            .unwrap_or(Err(PlayerError::InvalidState("decode thread exited")))
    }

    /// 定位到音轨内的某个时间（秒）
    pub fn seek_to_time(&self, secs: f64) -> Result<u64, PlayerError> {
        let position = self.track_position().ok_or(PlayerError::NoPlayingTask)?;
        let frame = (secs.max(0.0) * position.sample_rate as f64) as u64;
        self.seek_to_frame(frame)
    }

    /// 向前跳转，超出音轨时停在最后一帧
    pub fn seek_forward(&self, secs: f64) -> Result<u64, PlayerError> {
        let position = self.track_position().ok_or(PlayerError::NoPlayingTask)?;
        let delta = (secs.max(0.0) * position.sample_rate as f64) as u64;
        let mut target = position.frame.saturating_add(delta);
        if let Some(total) = position.total {
            target = target.min(total.saturating_sub(1));
        }
        self.seek_to_frame(target)
    }

    /// 向后跳转，不早于音轨开头
    pub fn seek_backward(&self, secs: f64) -> Result<u64, PlayerError> {
        let position = self.track_position().ok_or(PlayerError::NoPlayingTask)?;
        let delta = (secs.max(0.0) * position.sample_rate as f64) as u64;
        self.seek_to_frame(position.frame.saturating_sub(delta))
    }

    /// 正在播放的源是否支持定位
    pub fn supports_seeking(&self) -> bool {
        self.shared
            .tasks
            .playing()
            .map_or(false, |(slot, _)| self.shared.tasks.slot(slot).has(flags::SEEKABLE))
    }

    pub fn is_seeking(&self) -> bool {
        self.shared.seeking.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // 查询

    pub fn state(&self) -> PlaybackState {
        self.shared.state()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.state() == PlaybackState::Paused
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == PlaybackState::Stopped
    }

    /// 会话位置（帧）：已播放帧数加上 seek 偏移
    pub fn current_frame(&self) -> u64 {
        self.shared.current_frame()
    }

    /// 会话内所有源的总帧数；任一源长度未知时为 None
    pub fn total_frames(&self) -> Option<u64> {
        self.shared.total_frames()
    }

    pub fn remaining_frames(&self) -> Option<u64> {
        self.total_frames()
            .map(|total| total.saturating_sub(self.current_frame()))
    }

    pub fn current_time(&self) -> f64 {
        self.frames_to_secs(self.current_frame())
    }

    pub fn total_time(&self) -> Option<f64> {
        self.total_frames().map(|f| self.frames_to_secs(f))
    }

    pub fn remaining_time(&self) -> Option<f64> {
        self.remaining_frames().map(|f| self.frames_to_secs(f))
    }

    fn frames_to_secs(&self, frames: u64) -> f64 {
        let rate = self
            .track_position()
            .map(|p| p.sample_rate)
            .filter(|&r| r > 0)
            .unwrap_or_else(|| self.shared.buffer_sample_rate().max(1));
        frames as f64 / rate as f64
    }

    /// 正在播放的音轨内的位置
    pub fn track_position(&self) -> Option<TrackPosition> {
        let (index, _) = self.shared.tasks.playing()?;
        let slot = self.shared.tasks.slot(index);
        Some(TrackPosition {
            frame: slot.frames_rendered(),
            total: slot.total_frames(),
            sample_rate: slot.sample_rate(),
        })
    }

    /// 正在播放的源的描述（通常是路径）
    pub fn playing_source(&self) -> Option<String> {
        let (index, sequence) = self.shared.tasks.playing()?;
        let control = self.control.lock();
        if self.shared.tasks.slot(index).sequence() != sequence {
            return None;
        }
        control.entries[index].as_ref().map(|e| e.description.clone())
    }

    /// 缓冲区中尚未播放的帧数
    pub fn buffered_frames(&self) -> usize {
        self.shared.buffer.available()
    }

    /// 本会话写入缓冲区的帧数（seek 后从会话播放位置重新计数）
    pub fn frames_decoded(&self) -> u64 {
        self.shared.frames_decoded_total.load(Ordering::Acquire)
    }

    /// 任务表中已占用的槽位数
    pub fn active_tasks(&self) -> usize {
        self.shared.tasks.occupied()
    }

    /// 最近一次 render 回调消费的帧数
    pub fn frames_rendered_last_pass(&self) -> u64 {
        self.shared.frames_rendered_last_pass.load(Ordering::Acquire)
    }

    pub fn underrun_count(&self) -> u64 {
        self.shared.stats.underrun_count()
    }

    pub fn stats(&self) -> StatsReport {
        self.shared.stats.report(self.shared.buffer.capacity())
    }

    pub fn device_format(&self) -> DeviceFormat {
        self.device.format()
    }

    // ------------------------------------------------------------------
    // 音量

    pub fn master_volume(&self) -> f32 {
        self.volume.master()
    }

    pub fn set_master_volume(&self, volume: f32) {
        self.volume.set_master(volume);
    }

    pub fn channel_volume(&self, channel: usize) -> Option<f32> {
        self.volume.channel(channel)
    }

    /// 设置某个输出声道的音量；声道超出范围时返回 false
    pub fn set_channel_volume(&self, channel: usize, volume: f32) -> bool {
        self.volume.set_channel(channel, volume)
    }

    // ------------------------------------------------------------------
    // 设备

    /// 设备格式变化：停止输出、重新配置、从当前位置重新填充缓冲区、恢复输出
    pub fn output_format_changed(&mut self, format: DeviceFormat) -> Result<(), PlayerError> {
        log::info!("Output format changed: {}", format);

        let was_running = self.device.is_running();
        if was_running {
            if let Err(e) = self.device.stop() {
                return Err(self.fail_device(e));
            }
        }
        if let Err(e) = self.device.reconfigure(format) {
            return Err(self.fail_device(e));
        }

        // 丢弃按旧格式缓冲的数据，从当前位置重新解码
        if self.shared.state() != PlaybackState::Stopped && self.supports_seeking() {
            if let Some(position) = self.track_position() {
                let in_range = position.total.map_or(true, |t| position.frame < t);
                if in_range {
                    if let Err(e) = self.seek_to_frame(position.frame) {
                        log::warn!("Failed to refill buffer after format change: {}", e);
                    }
                }
            }
        }

        if was_running {
            if let Err(e) = self.start_device() {
                return Err(self.fail_device(e));
            }
        }
        Ok(())
    }

    /// 检查设备是否异步报告了错误；有错误时停止播放并返回
    pub fn check_device(&mut self) -> Result<(), PlayerError> {
        match self.device.take_error() {
            Some(e) => Err(self.fail_device(e)),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // 内部

    fn wake_decode(&self) {
        if let Some(workers) = &self.workers {
            workers.session.wake_decode();
        }
    }

    /// 结束当前会话：退出工作线程并停止设备（不动队列和任务表）
    ///
    /// 旧的 render 回调绑定旧会话的线程句柄，所以设备也要随会话重建
    fn end_session(&mut self) -> Result<(), OutputError> {
        self.join_workers();
        if self.device.is_running() {
            self.device.stop()
        } else {
            Ok(())
        }
    }

    /// 新会话：清零计数器并按队列和任务表重新统计总长
    ///
    /// 只在 [`end_session`](Self::end_session) 之后调用，此时没有线程访问缓冲区
    fn begin_session(&self) {
        debug_assert!(self.workers.is_none());
        self.shared.buffer.reset();
        self.shared.reset_counters();

        let control = self.control.lock();
        for decoder in control.queue.iter() {
            self.shared.account_source(decoder.total_frames());
        }
        for index in 0..TASK_SLOTS {
            let slot = self.shared.tasks.slot(index);
            if slot.is_occupied() {
                self.shared.account_source(slot.total_frames());
            }
        }
    }

    fn spawn_workers(&mut self) -> Result<(), PlayerError> {
        let session = Arc::new(Session::new());
        let (commands, receiver) = mpsc::channel();

        let worker = DecodeWorker::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.control),
            Arc::clone(&session),
            receiver,
            self.config.decode_quantum,
            self.config.max_channels,
        );
        let decode = thread::Builder::new()
            .name("decoder".to_string())
            .spawn(move || worker.run())
            .map_err(PlayerError::Spawn)?;

        let collector = Collector::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.control),
            Arc::clone(&session),
        );
        let collector = match thread::Builder::new()
            .name("collector".to_string())
            .spawn(move || collector.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                session.shutdown();
                let _ = decode.join();
                return Err(PlayerError::Spawn(e));
            }
        };

        self.workers = Some(Workers {
            session,
            commands,
            decode,
            collector,
        });
        Ok(())
    }

    fn join_workers(&mut self) {
        if let Some(workers) = self.workers.take() {
            workers.session.shutdown();
            if workers.decode.join().is_err() {
                log::error!("Decode thread panicked");
            }
            if workers.collector.join().is_err() {
                log::error!("Collector thread panicked");
            }
        }
    }

    fn start_device(&mut self) -> Result<(), OutputError> {
        let Some(workers) = &self.workers else {
            return Err(OutputError::InvalidState("no worker session"));
        };
        let format = self.device.format();
        let renderer = Renderer::new(
            Arc::clone(&self.shared),
            Arc::clone(&workers.session),
            Box::new(ChannelMapConverter::new(Arc::clone(&self.volume))),
            self.config.max_channels,
            self.config.max_render_frames,
            format.channels as usize,
        );
        self.device.start(Box::new(renderer))
    }

    fn fail_device(&mut self, error: OutputError) -> PlayerError {
        log::error!("Output device error: {}", error);
        if let Err(e) = self.stop() {
            log::warn!("Error while stopping after device failure: {}", e);
        }
        PlayerError::Device(error)
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
