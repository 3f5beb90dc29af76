//! Render 回调
//!
//! 在宿主的实时线程上运行。
//!
//! **绝对禁止：**
//! - 锁
//! - 分配
//! - I/O（包括日志）
//!
//! [`Renderer`] 只持有 `Arc<Shared>`（原子量 + 环形缓冲区 + 统计）、
//! 会话的线程句柄和预分配的暂存平面；锁侧状态在类型上就不可达。

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::shared::{Session, Shared};
use super::task::TASK_SLOTS;
use super::PlaybackState;
use crate::audio::{Converter, RenderCallback};

pub struct Renderer {
    shared: Arc<Shared>,
    session: Arc<Session>,
    converter: Box<dyn Converter>,
    /// 非交织暂存：`max_channels` 个平面，每个 `scratch_frames` 帧
    scratch: Vec<Vec<f64>>,
    scratch_frames: usize,
    output_channels: usize,
}

impl Renderer {
    pub(crate) fn new(
        shared: Arc<Shared>,
        session: Arc<Session>,
        converter: Box<dyn Converter>,
        max_channels: usize,
        scratch_frames: usize,
        output_channels: usize,
    ) -> Self {
        let scratch_frames = scratch_frames.max(1);
        Self {
            shared,
            session,
            converter,
            scratch: vec![vec![0.0; scratch_frames]; max_channels.max(1)],
            scratch_frames,
            output_channels: output_channels.max(1),
        }
    }

    /// 填充一次设备回调
    ///
    /// `output` 为交织 f32；数据不足部分输出静音
    pub fn render(&mut self, output: &mut [f32]) {
        let shared = Arc::clone(&self.shared);
        shared.renders_in_flight.fetch_add(1, Ordering::SeqCst);

        shared.stats.on_callback(shared.buffer.available());

        if shared.state() != PlaybackState::Playing || shared.mute_output.load(Ordering::SeqCst) {
            output.fill(0.0);
            shared.stats.record_silence();
            shared.frames_rendered_last_pass.store(0, Ordering::Release);
            shared.renders_in_flight.fetch_sub(1, Ordering::Release);
            return;
        }

        let consumed = self.drain_buffer(&shared, output);

        shared
            .frames_rendered_last_pass
            .store(consumed as u64, Ordering::Release);

        if consumed > 0 {
            // 先更新会话总数：任务一旦显示为播放完，会话位置已包含它的帧
            shared
                .frames_rendered_total
                .fetch_add(consumed as u64, Ordering::AcqRel);
            attribute_frames(&shared, consumed as u64);
            shared.stats.add_frames_played(consumed as u64);
        } else {
            shared.stats.record_silence();
        }

        // 缓冲区腾出了空间 / 任务可能已播放完
        self.session.wake_decode();
        self.session.wake_collector();

        shared.renders_in_flight.fetch_sub(1, Ordering::Release);
    }

    /// 从缓冲区读取并转换；返回消费的帧数
    fn drain_buffer(&mut self, shared: &Shared, output: &mut [f32]) -> usize {
        let out_channels = self.output_channels;
        let frames = output.len() / out_channels;
        let format = shared.buffer_format();
        let in_channels = (format.channels as usize).min(self.scratch.len());

        let mut done = 0;
        let mut consumed = 0;

        while done < frames {
            let chunk = (frames - done).min(self.scratch_frames);
            let got = shared.buffer.read(&mut self.scratch[..in_channels], chunk);

            self.converter.convert(
                &self.scratch[..in_channels],
                chunk,
                format,
                &mut output[done * out_channels..(done + chunk) * out_channels],
                out_channels,
            );

            consumed += got;
            done += chunk;

            if got < chunk {
                // 源还在解码却没跟上才算 underrun
                if shared.tasks.has_current() {
                    shared.stats.record_underrun();
                }
                break;
            }
        }

        output[done * out_channels..].fill(0.0);
        consumed
    }
}

/// 把本次消费的帧按序号从旧到新分配给各任务
///
/// 解码线程在写入缓冲区之前递增 `frames_decoded`，
/// 所以读到的每一帧都已经记在某个任务名下。
/// 遍历时槽位若已被回收复用（序号变化）则跳过：被回收的任务已没有未播放帧。
fn attribute_frames(shared: &Shared, mut frames: u64) {
    let (order, len) = shared.tasks.ordered();
    debug_assert!(len <= TASK_SLOTS);

    for &(index, sequence) in &order[..len] {
        if frames == 0 {
            break;
        }
        let slot = shared.tasks.slot(index);
        if slot.sequence() != sequence {
            continue;
        }

        let pending = slot.frames_decoded().saturating_sub(slot.frames_rendered());
        let take = pending.min(frames);
        if take > 0 {
            slot.add_rendered(take);
            frames -= take;
        }
    }
}

impl RenderCallback for Renderer {
    fn render(&mut self, output: &mut [f32]) {
        Renderer::render(self, output);
    }
}
