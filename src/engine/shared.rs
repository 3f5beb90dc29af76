//! 线程间共享状态
//!
//! [`Shared`] 只包含原子量、环形缓冲区、任务表和统计，
//! 是 render 回调唯一能看到的状态；锁侧状态在 [`super::task::Control`]。
//!
//! 内存序约定：
//! - 计数器：写方 Release，读方 Acquire
//! - `mute_output` 与 `renders_in_flight`：SeqCst（静默握手，见 [`Shared::quiesce`]）

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::thread::{self, Thread};
use std::time::Duration;

use crossbeam_utils::Backoff;

use super::task::TaskTable;
use super::PlaybackState;
use crate::audio::{PlaybackStats, RingBuffer, StreamFormat};

/// 工作线程在没有事件时的最长休眠时间
pub(crate) const WORKER_IDLE_TIMEOUT: Duration = Duration::from_millis(100);

impl PlaybackState {
    fn to_u8(self) -> u8 {
        match self {
            PlaybackState::Stopped => 0,
            PlaybackState::Playing => 1,
            PlaybackState::Paused => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => PlaybackState::Playing,
            2 => PlaybackState::Paused,
            _ => PlaybackState::Stopped,
        }
    }
}

pub(crate) struct Shared {
    state: AtomicU8,

    pub mute_output: AtomicBool,
    pub seeking: AtomicBool,
    pub renders_in_flight: AtomicUsize,

    pub frames_decoded_total: AtomicU64,
    pub frames_rendered_total: AtomicU64,
    pub frames_rendered_last_pass: AtomicU64,
    /// seek 造成的会话时间轴偏移
    pub frame_offset: AtomicI64,

    /// 会话内所有源报告的总帧数之和，以及总长未知的源个数
    pub session_total: AtomicU64,
    pub unknown_totals: AtomicUsize,

    pub buffer: RingBuffer,
    buffer_sample_rate: AtomicU32,

    pub tasks: TaskTable,
    pub stats: PlaybackStats,
}

impl Shared {
    pub fn new(buffer: RingBuffer, sample_rate: u32) -> Self {
        Self {
            state: AtomicU8::new(PlaybackState::Stopped.to_u8()),
            mute_output: AtomicBool::new(false),
            seeking: AtomicBool::new(false),
            renders_in_flight: AtomicUsize::new(0),
            frames_decoded_total: AtomicU64::new(0),
            frames_rendered_total: AtomicU64::new(0),
            frames_rendered_last_pass: AtomicU64::new(0),
            frame_offset: AtomicI64::new(0),
            session_total: AtomicU64::new(0),
            unknown_totals: AtomicUsize::new(0),
            buffer,
            buffer_sample_rate: AtomicU32::new(sample_rate),
            tasks: TaskTable::new(),
            stats: PlaybackStats::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, state: PlaybackState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    /// 仅当当前状态为 `from` 时切换到 `to`
    pub fn transition(&self, from: PlaybackState, to: PlaybackState) -> bool {
        self.state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 缓冲区中数据的格式
    #[inline]
    pub fn buffer_format(&self) -> StreamFormat {
        StreamFormat::new(
            self.buffer_sample_rate.load(Ordering::Acquire),
            self.buffer.channels() as u16,
        )
    }

    #[inline]
    pub fn buffer_sample_rate(&self) -> u32 {
        self.buffer_sample_rate.load(Ordering::Acquire)
    }

    /// 调整缓冲区格式；声道数变化时重新分配
    ///
    /// # Safety
    ///
    /// 调用方必须已经 [`quiesce`](Self::quiesce) 并且是唯一的生产者
    pub unsafe fn set_buffer_format(&self, format: StreamFormat) {
        if self.buffer.channels() != format.channels as usize {
            self.buffer.reconfigure(format.channels as usize);
        } else {
            self.buffer.reset();
        }
        self.buffer_sample_rate
            .store(format.sample_rate, Ordering::Release);
    }

    /// 静默 render 回调并等待正在进行的回调退出
    ///
    /// 返回后 render 不再触碰缓冲区，直到 [`unquiesce`](Self::unquiesce)。
    /// render 侧先 SeqCst 递增 in-flight 再 SeqCst 读 mute，
    /// 两边至少有一方看到对方的写入。
    pub fn quiesce(&self) {
        self.mute_output.store(true, Ordering::SeqCst);
        let backoff = Backoff::new();
        while self.renders_in_flight.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }
    }

    pub fn unquiesce(&self) {
        self.mute_output.store(false, Ordering::SeqCst);
    }

    /// 会话位置（帧）
    pub fn current_frame(&self) -> u64 {
        let rendered = self.frames_rendered_total.load(Ordering::Acquire) as i64;
        let offset = self.frame_offset.load(Ordering::Acquire);
        (rendered + offset).max(0) as u64
    }

    /// 会话总长，任一源未知时为 None
    pub fn total_frames(&self) -> Option<u64> {
        if self.unknown_totals.load(Ordering::Acquire) > 0 {
            None
        } else {
            Some(self.session_total.load(Ordering::Acquire))
        }
    }

    /// 把一个源的总长计入会话
    pub fn account_source(&self, total: Option<u64>) {
        match total {
            Some(frames) => {
                self.session_total.fetch_add(frames, Ordering::AcqRel);
            }
            None => {
                self.unknown_totals.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    /// 从会话中移除一个源的总长
    pub fn unaccount_source(&self, total: Option<u64>) {
        match total {
            Some(frames) => {
                let _ = self.session_total.fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                    Some(t.saturating_sub(frames))
                });
            }
            None => {
                let _ = self.unknown_totals.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    Some(n.saturating_sub(1))
                });
            }
        }
    }

    /// 清零会话计数器（render 已静默或未运行）
    pub fn reset_counters(&self) {
        self.frames_decoded_total.store(0, Ordering::Release);
        self.frames_rendered_total.store(0, Ordering::Release);
        self.frames_rendered_last_pass.store(0, Ordering::Release);
        self.frame_offset.store(0, Ordering::Release);
        self.session_total.store(0, Ordering::Release);
        self.unknown_totals.store(0, Ordering::Release);
        self.stats.reset();
    }
}

/// 一次工作线程会话：线程句柄与退出标志
///
/// 唤醒使用 park/unpark：token 不计数，
/// 工作线程每次醒来都会重新检查全部条件，多次唤醒合并为一次也不会丢事件
pub(crate) struct Session {
    decode: OnceLock<Thread>,
    collector: OnceLock<Thread>,
    shutdown: AtomicBool,
}

impl Session {
    pub fn new() -> Self {
        Self {
            decode: OnceLock::new(),
            collector: OnceLock::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// 解码线程启动时登记自己
    pub fn register_decode(&self) {
        let _ = self.decode.set(thread::current());
    }

    /// 回收线程启动时登记自己
    pub fn register_collector(&self) {
        let _ = self.collector.set(thread::current());
    }

    #[inline]
    pub fn wake_decode(&self) {
        if let Some(thread) = self.decode.get() {
            thread.unpark();
        }
    }

    #[inline]
    pub fn wake_collector(&self) {
        if let Some(thread) = self.collector.get() {
            thread.unpark();
        }
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake_decode();
        self.wake_collector();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn shared() -> Shared {
        Shared::new(RingBuffer::new(2, 64), 44100)
    }

    #[test]
    fn test_state_transitions() {
        let shared = shared();
        assert_eq!(shared.state(), PlaybackState::Stopped);

        shared.set_state(PlaybackState::Playing);
        assert!(!shared.transition(PlaybackState::Paused, PlaybackState::Stopped));
        assert!(shared.transition(PlaybackState::Playing, PlaybackState::Stopped));
        assert_eq!(shared.state(), PlaybackState::Stopped);
    }

    #[test]
    fn test_session_totals() {
        let shared = shared();
        shared.account_source(Some(100));
        shared.account_source(Some(50));
        assert_eq!(shared.total_frames(), Some(150));

        shared.account_source(None);
        assert_eq!(shared.total_frames(), None);

        shared.unaccount_source(None);
        shared.unaccount_source(Some(50));
        assert_eq!(shared.total_frames(), Some(100));
    }

    #[test]
    fn test_current_frame_applies_offset() {
        let shared = shared();
        shared.frames_rendered_total.store(10, Ordering::Release);
        shared.frame_offset.store(30, Ordering::Release);
        assert_eq!(shared.current_frame(), 40);

        shared.frame_offset.store(-20, Ordering::Release);
        assert_eq!(shared.current_frame(), 0);
    }

    #[test]
    fn test_quiesce_waits_for_in_flight_render() {
        let shared = Arc::new(shared());
        shared.renders_in_flight.fetch_add(1, Ordering::SeqCst);

        let render = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                shared.renders_in_flight.fetch_sub(1, Ordering::SeqCst);
            })
        };

        shared.quiesce();
        assert_eq!(shared.renders_in_flight.load(Ordering::SeqCst), 0);
        assert!(shared.mute_output.load(Ordering::SeqCst));
        shared.unquiesce();
        render.join().unwrap();
    }

    #[test]
    fn test_set_buffer_format_reallocates() {
        let shared = shared();
        unsafe { shared.set_buffer_format(StreamFormat::new(48000, 1)) };
        assert_eq!(shared.buffer_format(), StreamFormat::new(48000, 1));
    }
}
