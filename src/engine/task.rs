//! 解码任务表
//!
//! 固定 8 个槽位的 arena。每个槽位的状态全部是原子量，
//! render 回调可以无锁地遍历；解码器本身（所有权）放在
//! 受锁保护的 [`Control`] 里，render 永远不会碰到。
//!
//! 写入协议：解码线程在持锁状态下先写计数器和属性，
//! 最后以 Release 写入 flags；读方以 Acquire 读 flags 之后再读其它字段。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::decode::SourceDecoder;

/// 任务表容量
pub const TASK_SLOTS: usize = 8;

/// 槽位状态位
pub mod flags {
    pub const OCCUPIED: u32 = 1 << 0;
    /// 正在向缓冲区供数据（至多一个）
    pub const CURRENT: u32 = 1 << 1;
    pub const FINISHED: u32 = 1 << 2;
    pub const ERROR: u32 = 1 << 3;
    /// 正在重新定位；置位期间不可回收
    pub const SEEKING: u32 = 1 << 4;
    /// 仅作状态记录：与 SEEKING 同时置位，render 只看全局的 `mute_output`
    pub const MUTED: u32 = 1 << 5;
    pub const SEEKABLE: u32 = 1 << 6;
}

/// 总帧数未知
pub const UNKNOWN_TOTAL: u64 = u64::MAX;

/// 单个任务槽位
pub struct TaskSlot {
    flags: AtomicU32,
    sequence: AtomicU64,
    frames_decoded: AtomicU64,
    frames_rendered: AtomicU64,
    total_frames: AtomicU64,
    sample_rate: AtomicU32,
}

impl TaskSlot {
    fn new() -> Self {
        Self {
            flags: AtomicU32::new(0),
            sequence: AtomicU64::new(0),
            frames_decoded: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
            total_frames: AtomicU64::new(UNKNOWN_TOTAL),
            sample_rate: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has(&self, bits: u32) -> bool {
        self.flags() & bits == bits
    }

    #[inline]
    pub fn is_occupied(&self) -> bool {
        self.has(flags::OCCUPIED)
    }

    #[inline]
    pub fn set_flags(&self, bits: u32) {
        self.flags.fetch_or(bits, Ordering::AcqRel);
    }

    #[inline]
    pub fn clear_flags(&self, bits: u32) {
        self.flags.fetch_and(!bits, Ordering::AcqRel);
    }

    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    #[inline]
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded.load(Ordering::Acquire)
    }

    #[inline]
    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Acquire)
    }

    /// 解码线程在写入缓冲区之前调用
    #[inline]
    pub fn add_decoded(&self, frames: u64) {
        self.frames_decoded.fetch_add(frames, Ordering::Release);
    }

    /// render 回调调用
    #[inline]
    pub fn add_rendered(&self, frames: u64) {
        self.frames_rendered.fetch_add(frames, Ordering::Release);
    }

    /// seek 时把两个计数器都改到目标帧（render 已静默）
    pub fn rebase(&self, frame: u64) {
        self.frames_decoded.store(frame, Ordering::Release);
        self.frames_rendered.store(frame, Ordering::Release);
    }

    #[inline]
    pub fn total_frames(&self) -> Option<u64> {
        match self.total_frames.load(Ordering::Acquire) {
            UNKNOWN_TOTAL => None,
            total => Some(total),
        }
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    /// 全部已解码的帧都已播放完
    #[inline]
    pub fn fully_rendered(&self) -> bool {
        self.frames_rendered() == self.frames_decoded()
    }

    /// 可回收：已结束、非当前、不在 seek 中、已解码的帧全部播放完
    pub fn is_reclaimable(&self) -> bool {
        let f = self.flags();
        f & flags::OCCUPIED != 0
            && f & flags::FINISHED != 0
            && f & (flags::CURRENT | flags::SEEKING) == 0
            && self.fully_rendered()
    }

    /// 填充新任务；调用方持有控制锁且槽位空闲
    fn publish(&self, sequence: u64, total: Option<u64>, sample_rate: u32, seekable: bool) {
        self.sequence.store(sequence, Ordering::Relaxed);
        self.frames_decoded.store(0, Ordering::Relaxed);
        self.frames_rendered.store(0, Ordering::Relaxed);
        self.total_frames
            .store(total.unwrap_or(UNKNOWN_TOTAL), Ordering::Relaxed);
        self.sample_rate.store(sample_rate, Ordering::Relaxed);

        let mut bits = flags::OCCUPIED | flags::CURRENT;
        if seekable {
            bits |= flags::SEEKABLE;
        }
        self.flags.store(bits, Ordering::Release);
    }

    /// 清空槽位；调用方持有控制锁
    fn vacate(&self) {
        self.flags.store(0, Ordering::Release);
    }
}

/// 任务表
pub struct TaskTable {
    slots: [TaskSlot; TASK_SLOTS],
    next_sequence: AtomicU64,
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| TaskSlot::new()),
            next_sequence: AtomicU64::new(1),
        }
    }

    #[inline]
    pub fn slot(&self, index: usize) -> &TaskSlot {
        &self.slots[index]
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| !s.is_occupied())
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_occupied()).count()
    }

    /// 是否有任务正在向缓冲区供数据
    #[inline]
    pub fn has_current(&self) -> bool {
        self.slots.iter().any(|s| s.has(flags::OCCUPIED | flags::CURRENT))
    }

    /// 按序号升序排列的已占用槽位（栈上，无分配）
    ///
    /// 返回 (槽位下标, 序号) 数组及有效长度
    pub fn ordered(&self) -> ([(usize, u64); TASK_SLOTS], usize) {
        let mut order = [(0usize, 0u64); TASK_SLOTS];
        let mut len = 0;

        for (index, slot) in self.slots.iter().enumerate() {
            if slot.is_occupied() {
                let seq = slot.sequence();
                // 插入排序
                let mut pos = len;
                while pos > 0 && order[pos - 1].1 > seq {
                    order[pos] = order[pos - 1];
                    pos -= 1;
                }
                order[pos] = (index, seq);
                len += 1;
            }
        }
        (order, len)
    }

    /// 正在被听到的任务：序号最小的、尚未（结束且全部播放完）的任务
    pub fn playing(&self) -> Option<(usize, u64)> {
        let (order, len) = self.ordered();
        order[..len].iter().copied().find(|&(index, _)| {
            let slot = &self.slots[index];
            !(slot.has(flags::FINISHED) && slot.fully_rendered())
        })
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.is_occupied())
    }

    fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

/// 锁侧的任务条目：持有解码器所有权
///
/// 任务是当前任务时，解码器由解码线程借走，`decoder` 为 None
pub struct TaskEntry {
    pub decoder: Option<Box<dyn SourceDecoder>>,
    pub description: String,
}

/// 受控制锁保护的状态：待播队列 + 任务表的所有权侧
pub struct Control {
    pub queue: VecDeque<Box<dyn SourceDecoder>>,
    pub entries: [Option<TaskEntry>; TASK_SLOTS],
}

impl Control {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            entries: std::array::from_fn(|_| None),
        }
    }

    /// 在空闲槽位登记新任务，表满时返回 None
    pub fn insert(
        &mut self,
        table: &TaskTable,
        description: String,
        total: Option<u64>,
        sample_rate: u32,
        seekable: bool,
    ) -> Option<(usize, u64)> {
        let index = table.free_slot()?;
        let sequence = table.next_sequence();
        self.entries[index] = Some(TaskEntry {
            decoder: None,
            description,
        });
        table.slot(index).publish(sequence, total, sample_rate, seekable);
        Some((index, sequence))
    }

    /// 移除任务，返回其条目（解码器在锁外释放）
    pub fn remove(&mut self, table: &TaskTable, index: usize) -> Option<TaskEntry> {
        table.slot(index).vacate();
        self.entries[index].take()
    }

    /// 移除所有任务
    pub fn drain_tasks(&mut self, table: &TaskTable) -> Vec<TaskEntry> {
        (0..TASK_SLOTS)
            .filter_map(|index| {
                if table.slot(index).is_occupied() {
                    self.remove(table, index)
                } else {
                    None
                }
            })
            .collect()
    }
}

impl Default for Control {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::StreamFormat;
    use crate::decode::SyntheticSource;

    fn insert(control: &mut Control, table: &TaskTable, name: &str) -> Option<(usize, u64)> {
        control.insert(table, name.to_string(), Some(100), 44100, true)
    }

    #[test]
    fn test_table_capacity_is_eight() {
        let table = TaskTable::new();
        let mut control = Control::new();

        for i in 0..TASK_SLOTS {
            assert!(insert(&mut control, &table, &format!("t{}", i)).is_some());
        }
        assert_eq!(table.occupied(), TASK_SLOTS);
        assert!(insert(&mut control, &table, "overflow").is_none());

        control.remove(&table, 3);
        assert_eq!(insert(&mut control, &table, "reuse").map(|(i, _)| i), Some(3));
    }

    #[test]
    fn test_ordered_by_sequence_after_reuse() {
        let table = TaskTable::new();
        let mut control = Control::new();

        let (a, _) = insert(&mut control, &table, "a").unwrap();
        let (b, _) = insert(&mut control, &table, "b").unwrap();
        control.remove(&table, a);
        let (c, _) = insert(&mut control, &table, "c").unwrap();

        // c 复用了 a 的槽位，但序号最大
        assert_eq!(c, a);
        let (order, len) = table.ordered();
        let indices: Vec<usize> = order[..len].iter().map(|&(i, _)| i).collect();
        assert_eq!(indices, vec![b, c]);
    }

    #[test]
    fn test_reclaimable_rules() {
        let table = TaskTable::new();
        let mut control = Control::new();
        let (index, _) = insert(&mut control, &table, "a").unwrap();
        let slot = table.slot(index);

        slot.add_decoded(100);
        slot.add_rendered(60);
        // 当前任务不可回收
        assert!(!slot.is_reclaimable());

        slot.set_flags(flags::FINISHED);
        slot.clear_flags(flags::CURRENT);
        // 还有未播放的帧
        assert!(!slot.is_reclaimable());

        slot.add_rendered(40);
        assert!(slot.is_reclaimable());
    }

    #[test]
    fn test_seeking_task_is_never_reclaimable() {
        let table = TaskTable::new();
        let mut control = Control::new();
        let (index, _) = insert(&mut control, &table, "a").unwrap();
        let slot = table.slot(index);

        slot.add_decoded(100);
        slot.add_rendered(20);
        slot.set_flags(flags::FINISHED);
        slot.clear_flags(flags::CURRENT);

        // seek 期间 rebase 让两个计数器相等
        slot.set_flags(flags::SEEKING | flags::MUTED);
        slot.rebase(90);
        assert!(slot.fully_rendered());
        assert!(!slot.is_reclaimable());

        // 重新成为当前任务后再清 SEEKING，仍不可回收
        slot.set_flags(flags::CURRENT);
        slot.clear_flags(flags::FINISHED | flags::ERROR);
        slot.clear_flags(flags::SEEKING | flags::MUTED);
        assert!(!slot.is_reclaimable());
        assert_eq!(table.playing().map(|(i, _)| i), Some(index));
    }

    #[test]
    fn test_playing_skips_fully_rendered_finished() {
        let table = TaskTable::new();
        let mut control = Control::new();
        let (a, seq_a) = insert(&mut control, &table, "a").unwrap();
        let (b, seq_b) = insert(&mut control, &table, "b").unwrap();

        assert_eq!(table.playing(), Some((a, seq_a)));

        let slot = table.slot(a);
        slot.add_decoded(10);
        slot.add_rendered(10);
        slot.set_flags(flags::FINISHED);
        slot.clear_flags(flags::CURRENT);
        assert_eq!(table.playing(), Some((b, seq_b)));
    }

    #[test]
    fn test_drain_returns_decoders() {
        let table = TaskTable::new();
        let mut control = Control::new();
        let (index, _) = insert(&mut control, &table, "a").unwrap();
        if let Some(entry) = control.entries[index].as_mut() {
            entry.decoder = Some(Box::new(SyntheticSource::ramp(
                StreamFormat::default(),
                0,
                10,
            )));
        }

        let drained = control.drain_tasks(&table);
        assert_eq!(drained.len(), 1);
        assert!(drained[0].decoder.is_some());
        assert!(table.is_empty());
    }
}
