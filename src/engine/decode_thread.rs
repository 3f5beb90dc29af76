//! 解码线程
//!
//! 唯一的生产者：从待播队列取源、登记到任务表、把解码结果写入环形缓冲区。
//! 一个源结束后立即接着解码下一个源，写进同一个缓冲区（无缝衔接，不清空）。
//! 没有事可做时 park，由 render 进度、入队、seek、播放、退出唤醒。

use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use super::shared::{Session, Shared, WORKER_IDLE_TIMEOUT};
use super::task::{flags, Control};
use super::{PlaybackState, PlayerError};
use crate::decode::SourceDecoder;

/// 控制端发给解码线程的命令
pub(crate) enum Command {
    /// 把 (slot, sequence) 标识的任务定位到 `frame`
    Seek {
        slot: usize,
        sequence: u64,
        frame: u64,
        reply: Sender<Result<u64, PlayerError>>,
    },
}

/// 正在供数据的任务；解码器由本线程持有
struct CurrentTask {
    slot: usize,
    sequence: u64,
    decoder: Box<dyn SourceDecoder>,
    channels: usize,
}

/// seek 时从原处取出的目标解码器
enum SeekTarget {
    Current(CurrentTask),
    Finished(Box<dyn SourceDecoder>),
}

enum StepOutcome {
    Idle,
    Decoded,
    Finished { error: bool },
}

pub(crate) struct DecodeWorker {
    shared: Arc<Shared>,
    control: Arc<Mutex<Control>>,
    session: Arc<Session>,
    commands: Receiver<Command>,
    quantum: usize,
    scratch: Vec<Vec<f64>>,
    current: Option<CurrentTask>,
    deferred: bool,
}

impl DecodeWorker {
    pub fn new(
        shared: Arc<Shared>,
        control: Arc<Mutex<Control>>,
        session: Arc<Session>,
        commands: Receiver<Command>,
        quantum: usize,
        max_channels: usize,
    ) -> Self {
        let quantum = quantum.max(1);
        Self {
            shared,
            control,
            session,
            commands,
            quantum,
            scratch: vec![vec![0.0; quantum]; max_channels.max(1)],
            current: None,
            deferred: false,
        }
    }

    pub fn run(mut self) {
        self.session.register_decode();
        log::info!(
            "Decode thread started, quantum: {} frames, buffer: {} frames",
            self.quantum,
            self.shared.buffer.capacity()
        );

        while !self.session.is_shutdown() {
            let mut progressed = self.service_commands();

            if self.current.is_none() {
                progressed |= self.start_next_task();
            }
            if self.current.is_some() {
                progressed |= self.decode_step();
            }

            if !progressed {
                thread::park_timeout(WORKER_IDLE_TIMEOUT);
            }
        }

        self.release_current();
        log::info!("Decode thread finished");
    }

    fn service_commands(&mut self) -> bool {
        let mut serviced = false;
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Seek {
                    slot,
                    sequence,
                    frame,
                    reply,
                } => {
                    let result = self.seek(slot, sequence, frame);
                    let _ = reply.send(result);
                }
            }
            serviced = true;
        }
        serviced
    }

    /// 从队首取下一个源登记为当前任务
    fn start_next_task(&mut self) -> bool {
        let shared = Arc::clone(&self.shared);
        let mut control = self.control.lock();

        // 停止状态下不开始新任务；回收线程在同一把锁下判定自然结束
        if shared.state() == PlaybackState::Stopped {
            return false;
        }
        let Some(next) = control.queue.front() else {
            return false;
        };
        let format = next.format();

        if format != shared.buffer_format() {
            // 格式变化不是无缝的：等已缓冲的帧播放完再重新分配
            if shared.buffer.available() > 0 {
                return false;
            }
            drop(control);

            shared.quiesce();
            unsafe { shared.set_buffer_format(format) };
            shared.unquiesce();
            log::info!("Ring buffer reconfigured for {}", format);
            return true;
        }

        let Some(decoder) = control.queue.pop_front() else {
            return false;
        };
        let description = decoder.description().to_string();

        let Some((slot, sequence)) = control.insert(
            &shared.tasks,
            description.clone(),
            decoder.total_frames(),
            format.sample_rate,
            decoder.supports_seeking(),
        ) else {
            // 任务表已满：留在队首，等回收线程腾出槽位
            control.queue.push_front(decoder);
            if !self.deferred {
                log::debug!("Task table full, deferring {}", description);
                self.deferred = true;
            }
            return false;
        };
        drop(control);

        self.deferred = false;
        log::info!("Decoding task #{}: {} ({})", sequence, description, format);
        self.current = Some(CurrentTask {
            slot,
            sequence,
            decoder,
            channels: format.channels as usize,
        });
        true
    }

    /// 解码一个 quantum 写入缓冲区
    fn decode_step(&mut self) -> bool {
        let shared = Arc::clone(&self.shared);
        let Some(task) = self.current.as_mut() else {
            return false;
        };
        let slot = shared.tasks.slot(task.slot);

        let outcome = if shared.buffer.free_space() < self.quantum {
            StepOutcome::Idle
        } else {
            let mut frames = self.quantum;
            let remaining = slot
                .total_frames()
                .map(|total| total.saturating_sub(slot.frames_decoded()));

            if remaining == Some(0) {
                StepOutcome::Finished { error: false }
            } else {
                if let Some(remaining) = remaining {
                    frames = frames.min(remaining as usize);
                }
                let channels = task.channels;

                match task.decoder.decode_frames(&mut self.scratch[..channels], frames) {
                    Ok(0) => StepOutcome::Finished { error: false },
                    Ok(n) => {
                        let n = n.min(frames);
                        // 先记账再发布样本：render 读到的每一帧都已有归属
                        slot.add_decoded(n as u64);
                        shared
                            .frames_decoded_total
                            .fetch_add(n as u64, Ordering::AcqRel);
                        let written = shared.buffer.write(&self.scratch[..channels], n);
                        debug_assert_eq!(written, n, "ring buffer rejected decoded frames");
                        StepOutcome::Decoded
                    }
                    Err(e) => {
                        log::error!("{}: {}", task.decoder.description(), e);
                        StepOutcome::Finished { error: true }
                    }
                }
            }
        };

        match outcome {
            StepOutcome::Idle => false,
            StepOutcome::Decoded => true,
            StepOutcome::Finished { error } => {
                self.finish_current(error);
                true
            }
        }
    }

    /// 结束当前任务：解码器交还任务表，标记 finished
    fn finish_current(&mut self, error: bool) {
        let Some(task) = self.current.take() else {
            return;
        };
        let slot = self.shared.tasks.slot(task.slot);
        let description = task.decoder.description().to_string();

        let orphan = {
            let mut control = self.control.lock();
            let orphan = match control.entries[task.slot].as_mut() {
                Some(entry) => {
                    entry.decoder = Some(task.decoder);
                    None
                }
                None => Some(task.decoder),
            };

            let mut bits = flags::FINISHED;
            if error {
                bits |= flags::ERROR;
            }
            slot.set_flags(bits);
            slot.clear_flags(flags::CURRENT);
            orphan
        };
        drop(orphan);

        if error {
            log::warn!(
                "Task #{} ({}) finished with error after {} frames",
                task.sequence,
                description,
                slot.frames_decoded()
            );
        } else {
            log::info!(
                "Task #{} ({}) finished decoding: {} frames",
                task.sequence,
                description,
                slot.frames_decoded()
            );
        }

        self.session.wake_collector();
    }

    /// 退出前把当前解码器放回任务表，由控制端统一释放
    fn release_current(&mut self) {
        if let Some(task) = self.current.take() {
            let orphan = {
                let mut control = self.control.lock();
                match control.entries[task.slot].as_mut() {
                    Some(entry) => {
                        entry.decoder = Some(task.decoder);
                        None
                    }
                    None => Some(task.decoder),
                }
            };
            drop(orphan);
        }
    }

    /// 执行 seek
    ///
    /// 成功时丢弃缓冲区内容，目标任务重新成为当前任务，
    /// 之后已开始的任务倒回开头放回队首；失败时不改变任何状态
    fn seek(&mut self, index: usize, sequence: u64, frame: u64) -> Result<u64, PlayerError> {
        let shared = Arc::clone(&self.shared);
        let target = shared.tasks.slot(index);

        let later: Vec<(usize, u64)> = {
            let control = self.control.lock();
            if !target.is_occupied() || target.sequence() != sequence {
                return Err(PlayerError::NoPlayingTask);
            }

            let (order, len) = shared.tasks.ordered();
            let later: Vec<(usize, u64)> = order[..len]
                .iter()
                .copied()
                .filter(|&(_, seq)| seq > sequence)
                .collect();

            for &(i, _) in &later {
                let seekable = match &self.current {
                    Some(task) if task.slot == i => task.decoder.supports_seeking(),
                    _ => control.entries[i]
                        .as_ref()
                        .and_then(|e| e.decoder.as_ref())
                        .map_or(true, |d| d.supports_seeking()),
                };
                if !seekable {
                    return Err(PlayerError::SeekUnsupported);
                }
            }

            // 持锁置位 SEEKING：回收线程持同一把锁检查，置位后目标不会被回收
            target.set_flags(flags::SEEKING | flags::MUTED);
            later
        };
        shared.seeking.store(true, Ordering::Release);
        shared.quiesce();

        let result = self.reposition(&shared, index, sequence, frame, &later);

        target.clear_flags(flags::SEEKING | flags::MUTED);
        shared.seeking.store(false, Ordering::Release);
        shared.unquiesce();
        self.session.wake_collector();

        result
    }

    fn reposition(
        &mut self,
        shared: &Shared,
        index: usize,
        sequence: u64,
        frame: u64,
        later: &[(usize, u64)],
    ) -> Result<u64, PlayerError> {
        let target = shared.tasks.slot(index);

        // 取出目标解码器
        let mut taken = match self.current.take() {
            Some(task) if task.slot == index => SeekTarget::Current(task),
            other => {
                self.current = other;
                let decoder = self.control.lock().entries[index]
                    .as_mut()
                    .and_then(|e| e.decoder.take());
                match decoder {
                    Some(decoder) => SeekTarget::Finished(decoder),
                    None => return Err(PlayerError::NoPlayingTask),
                }
            }
        };

        let decoder = match &mut taken {
            SeekTarget::Current(task) => &mut task.decoder,
            SeekTarget::Finished(decoder) => decoder,
        };

        let actual = match decoder.seek_to_frame(frame) {
            Ok(actual) => actual,
            Err(e) => {
                log::warn!("{}: seek to frame {} failed: {}", decoder.description(), frame, e);
                // 放回原处
                match taken {
                    SeekTarget::Current(task) => self.current = Some(task),
                    SeekTarget::Finished(decoder) => {
                        let mut control = self.control.lock();
                        if let Some(entry) = control.entries[index].as_mut() {
                            entry.decoder = Some(decoder);
                        }
                    }
                }
                return Err(PlayerError::Seek(e));
            }
        };

        // 缓冲区里的帧全部作废
        shared.buffer.reset();
        let rendered_before = target.frames_rendered();
        shared
            .frame_offset
            .fetch_add(actual as i64 - rendered_before as i64, Ordering::AcqRel);
        target.rebase(actual);
        // 与 rebase 同一步重新成为当前任务：先置 CURRENT 再清 FINISHED，任何时刻都不可回收
        target.set_flags(flags::CURRENT);
        target.clear_flags(flags::FINISHED | flags::ERROR);
        shared.frames_decoded_total.store(
            shared.frames_rendered_total.load(Ordering::Acquire),
            Ordering::Release,
        );

        // 之后的任务移出任务表
        let mut displaced = Vec::with_capacity(later.len());
        let mut current_later = self.current.take();
        {
            let mut control = self.control.lock();
            for &(i, seq) in later {
                let slot = shared.tasks.slot(i);
                if !slot.is_occupied() || slot.sequence() != seq {
                    continue;
                }
                let entry = control.remove(&shared.tasks, i);
                let decoder = match current_later.take() {
                    Some(task) if task.slot == i => Some(task.decoder),
                    other => {
                        current_later = other;
                        entry.and_then(|e| e.decoder)
                    }
                };
                if let Some(decoder) = decoder {
                    displaced.push(decoder);
                }
            }
        }
        debug_assert!(current_later.is_none(), "current task was not a later task");
        drop(current_later);

        // 倒回开头（锁外），按原顺序放回队首
        displaced.retain_mut(|decoder| match decoder.seek_to_frame(0) {
            Ok(_) => true,
            Err(e) => {
                log::warn!("{}: rewind failed, dropping: {}", decoder.description(), e);
                false
            }
        });
        if !displaced.is_empty() {
            log::debug!("Re-queued {} source(s) after seek", displaced.len());
            let mut control = self.control.lock();
            for decoder in displaced.into_iter().rev() {
                control.queue.push_front(decoder);
            }
        }

        // 目标任务重新成为当前任务
        let task = match taken {
            SeekTarget::Current(task) => task,
            SeekTarget::Finished(decoder) => {
                let channels = decoder.format().channels as usize;
                CurrentTask {
                    slot: index,
                    sequence,
                    decoder,
                    channels,
                }
            }
        };
        let format = task.decoder.format();
        if format != shared.buffer_format() {
            unsafe { shared.set_buffer_format(format) };
        }
        log::info!(
            "Task #{} ({}) seeked to frame {}",
            sequence,
            task.decoder.description(),
            actual
        );
        self.current = Some(task);
        Ok(actual)
    }
}
