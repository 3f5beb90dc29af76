//! 回收线程
//!
//! 回收已结束且已全部播放完的任务，释放其解码器（锁外），
//! 并在队列、任务表、缓冲区都空了的时候判定播放自然结束。

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use super::shared::{Session, Shared, WORKER_IDLE_TIMEOUT};
use super::task::{Control, TaskEntry, TASK_SLOTS};
use super::PlaybackState;

pub(crate) struct Collector {
    shared: Arc<Shared>,
    control: Arc<Mutex<Control>>,
    session: Arc<Session>,
}

impl Collector {
    pub fn new(shared: Arc<Shared>, control: Arc<Mutex<Control>>, session: Arc<Session>) -> Self {
        Self {
            shared,
            control,
            session,
        }
    }

    pub fn run(self) {
        self.session.register_collector();
        log::info!("Collector thread started");

        while !self.session.is_shutdown() {
            if self.reclaim() > 0 {
                // 被推迟的源可能在等空槽位
                self.session.wake_decode();
            }
            self.detect_end_of_playback();

            thread::park_timeout(WORKER_IDLE_TIMEOUT);
        }

        log::info!("Collector thread finished");
    }

    /// 回收所有可回收的任务，返回回收个数
    fn reclaim(&self) -> usize {
        let mut reclaimed: Vec<TaskEntry> = Vec::new();
        {
            let mut control = self.control.lock();
            for index in 0..TASK_SLOTS {
                let slot = self.shared.tasks.slot(index);
                if slot.is_reclaimable() {
                    let frames = slot.frames_rendered();
                    if let Some(entry) = control.remove(&self.shared.tasks, index) {
                        log::debug!("Reclaimed task: {} ({} frames)", entry.description, frames);
                        reclaimed.push(entry);
                    }
                }
            }
        }

        // 解码器在锁外释放（可能涉及 I/O）
        let count = reclaimed.len();
        drop(reclaimed);
        count
    }

    fn detect_end_of_playback(&self) {
        if self.shared.state() != PlaybackState::Playing || self.shared.buffer.available() > 0 {
            return;
        }

        // 检查与状态切换在同一把锁下：解码线程也持锁检查状态、出队并登记，
        // 所以切到 Stopped 之后不会再有新任务进入任务表
        let ended = {
            let control = self.control.lock();
            control.queue.is_empty()
                && self.shared.tasks.is_empty()
                && self.shared.buffer.available() == 0
                && self.shared.transition(PlaybackState::Playing, PlaybackState::Stopped)
        };

        if ended {
            log::info!(
                "Playback finished: {} frames rendered",
                self.shared.current_frame()
            );
        }
    }
}
