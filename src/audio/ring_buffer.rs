//! Lock-free Single-Producer Single-Consumer 环形音频缓冲区
//!
//! 设计目标：
//! - 零锁：生产者（解码线程）和消费者（render 回调）完全无锁操作
//! - 零分配：所有内存在初始化时预分配
//! - 非交织存储：每个声道独立一段连续的 f64 平面
//! - 缓存友好：读写游标各自独占一个 cache line
//! - 内存锁定：可选 mlock 防止 page fault
//!
//! 游标是单调递增的帧计数（u64，不回绕），
//! 不变量：`frames_read <= frames_written <= frames_read + capacity`

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Cache line 对齐包装器
///
/// 使用 #[repr(align(64))] 确保包装的值独占一个 cache line，
/// 避免 false sharing
#[repr(align(64))]
pub struct CacheLine<T>(pub T);

impl<T> CacheLine<T> {
    pub fn new(val: T) -> Self {
        Self(val)
    }
}

impl<T: Default> Default for CacheLine<T> {
    fn default() -> Self {
        Self(T::default())
    }
}

/// 平面存储：`channels` 个平面，每个平面 `capacity` 帧，平面首尾相接
struct Planes {
    channels: usize,
    samples: Box<[UnsafeCell<f64>]>,
}

impl Planes {
    fn allocate(channels: usize, capacity: usize) -> Self {
        let samples: Vec<UnsafeCell<f64>> = (0..channels * capacity)
            .map(|_| UnsafeCell::new(0.0))
            .collect();
        Self {
            channels,
            samples: samples.into_boxed_slice(),
        }
    }
}

/// SPSC 非交织环形缓冲区
///
/// 内存布局保证：
/// - write_pos 和 read_pos 各自独占一个 64 字节 cache line
/// - 样本单元格为 `UnsafeCell`，读写双方只通过共享引用访问
pub struct RingBuffer {
    planes: UnsafeCell<Planes>,
    capacity: usize,
    mask: usize,

    write_pos: CacheLine<AtomicU64>,
    read_pos: CacheLine<AtomicU64>,

    memory_locked: AtomicBool,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// 创建指定声道数与容量（帧）的缓冲区
    ///
    /// capacity 必须是 2 的幂
    pub fn new(channels: usize, capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be power of two");
        assert!(channels > 0, "ring buffer needs at least one channel");

        Self {
            planes: UnsafeCell::new(Planes::allocate(channels, capacity)),
            capacity,
            mask: capacity - 1,
            write_pos: CacheLine::new(AtomicU64::new(0)),
            read_pos: CacheLine::new(AtomicU64::new(0)),
            memory_locked: AtomicBool::new(false),
        }
    }

    /// 创建指定最小容量的缓冲区（自动向上取整到 2 的幂）
    pub fn with_min_capacity(channels: usize, min_capacity: usize) -> Self {
        Self::new(channels, min_capacity.max(1).next_power_of_two())
    }

    #[inline]
    fn planes(&self) -> &Planes {
        // 只有 reconfigure（独占访问）会替换 Planes
        unsafe { &*self.planes.get() }
    }

    #[inline]
    fn storage_bytes(&self) -> usize {
        self.planes().samples.len() * std::mem::size_of::<UnsafeCell<f64>>()
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 在实时音频场景下，page fault 会导致严重的时序抖动。
    /// 返回是否成功锁定
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true;
        }

        let ptr = self.planes().samples.as_ptr() as *const libc::c_void;
        let len = self.storage_bytes();

        let result = unsafe { libc::mlock(ptr, len) };

        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Ring buffer memory locked: {} bytes", len);
            true
        } else {
            log::warn!(
                "Failed to lock ring buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    /// 解锁缓冲区内存
    pub fn unlock_memory(&self) {
        if !self.memory_locked.load(Ordering::Acquire) {
            return;
        }

        let ptr = self.planes().samples.as_ptr() as *const libc::c_void;
        let len = self.storage_bytes();

        unsafe {
            libc::munlock(ptr, len);
        }

        self.memory_locked.store(false, Ordering::Release);
        log::debug!("Ring buffer memory unlocked");
    }

    /// 检查内存是否已锁定
    pub fn is_memory_locked(&self) -> bool {
        self.memory_locked.load(Ordering::Acquire)
    }

    /// 写入帧（生产者调用）
    ///
    /// `input[ch][..frames]` 为各声道样本，返回实际写入的帧数。
    /// 空间不足时只写入能容纳的部分，绝不覆盖未读数据，绝不阻塞。
    #[inline]
    pub fn write(&self, input: &[Vec<f64>], frames: usize) -> usize {
        let write = self.write_pos.0.load(Ordering::Relaxed);
        let read = self.read_pos.0.load(Ordering::Acquire);

        let used = (write - read) as usize;
        debug_assert!(used <= self.capacity, "ring buffer invariant violated: used > capacity");

        let to_write = frames.min(self.capacity - used);
        let planes = self.planes();
        let channels = planes.channels.min(input.len());
        debug_assert_eq!(channels, planes.channels, "write is missing channel planes");

        for (ch, plane) in input.iter().enumerate().take(channels) {
            let base = ch * self.capacity;
            for (i, &sample) in plane[..to_write].iter().enumerate() {
                let idx = base + ((write as usize + i) & self.mask);
                unsafe {
                    *planes.samples[idx].get() = sample;
                }
            }
        }

        self.write_pos.0.store(write + to_write as u64, Ordering::Release);
        to_write
    }

    /// 读取帧（消费者调用）
    ///
    /// 读取最多 `frames` 帧到 `output[ch][..frames]`，返回实际读取的帧数；
    /// 数据不足的部分填零。此函数是 wait-free 的，绝不阻塞
    #[inline]
    pub fn read(&self, output: &mut [Vec<f64>], frames: usize) -> usize {
        let read = self.read_pos.0.load(Ordering::Relaxed);
        let write = self.write_pos.0.load(Ordering::Acquire);

        let available = (write - read) as usize;
        let to_read = frames.min(available);
        let planes = self.planes();

        for (ch, plane) in output.iter_mut().enumerate().take(planes.channels) {
            let base = ch * self.capacity;
            for (i, sample) in plane[..to_read].iter_mut().enumerate() {
                let idx = base + ((read as usize + i) & self.mask);
                *sample = unsafe { *planes.samples[idx].get() };
            }
            plane[to_read..frames].fill(0.0);
        }

        self.read_pos.0.store(read + to_read as u64, Ordering::Release);
        to_read
    }

    /// 获取当前可读帧数
    #[inline]
    pub fn available(&self) -> usize {
        let read = self.read_pos.0.load(Ordering::Acquire);
        let write = self.write_pos.0.load(Ordering::Acquire);
        write.saturating_sub(read) as usize
    }

    /// 获取当前可写空间（帧）
    #[inline]
    pub fn free_space(&self) -> usize {
        self.capacity - self.available()
    }

    /// 获取容量（帧）
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前声道数
    #[inline]
    pub fn channels(&self) -> usize {
        self.planes().channels
    }

    /// 累计写入帧数
    #[inline]
    pub fn frames_written(&self) -> u64 {
        self.write_pos.0.load(Ordering::Acquire)
    }

    /// 累计读取帧数
    #[inline]
    pub fn frames_read(&self) -> u64 {
        self.read_pos.0.load(Ordering::Acquire)
    }

    /// 获取缓冲区填充百分比（用于监控）
    #[inline]
    pub fn fill_ratio(&self) -> f64 {
        self.available() as f64 / self.capacity as f64
    }

    /// 丢弃所有未读数据
    ///
    /// 调用方必须保证此时没有消费者在读（render 已静默并排空）
    pub fn reset(&self) {
        let write = self.write_pos.0.load(Ordering::Acquire);
        self.read_pos.0.store(write, Ordering::Release);
    }

    /// 以新的声道数重新分配存储，并丢弃所有数据
    ///
    /// # Safety
    ///
    /// 调用期间不得有任何其他线程访问此缓冲区（生产者、消费者都不行）。
    pub unsafe fn reconfigure(&self, channels: usize) {
        assert!(channels > 0, "ring buffer needs at least one channel");
        let was_locked = self.is_memory_locked();
        self.unlock_memory();

        *self.planes.get() = Planes::allocate(channels, self.capacity);
        self.reset();

        if was_locked {
            self.lock_memory();
        }
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planes(channels: usize, frames: usize) -> Vec<Vec<f64>> {
        vec![vec![0.0; frames]; channels]
    }

    fn ramp(channels: usize, start: f64, frames: usize) -> Vec<Vec<f64>> {
        (0..channels)
            .map(|ch| (0..frames).map(|i| start + i as f64 + ch as f64 * 0.5).collect())
            .collect()
    }

    #[test]
    fn test_ring_buffer_basic() {
        let rb = RingBuffer::new(2, 16);

        assert_eq!(rb.write(&ramp(2, 1.0, 4), 4), 4);
        assert_eq!(rb.available(), 4);

        let mut output = planes(2, 4);
        assert_eq!(rb.read(&mut output, 4), 4);
        assert_eq!(output[0], vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(output[1], vec![1.5, 2.5, 3.5, 4.5]);
    }

    #[test]
    fn test_ring_buffer_wrap() {
        let rb = RingBuffer::new(1, 4);

        // 填满
        assert_eq!(rb.write(&ramp(1, 1.0, 4), 4), 4);

        // 读一半
        let mut output = planes(1, 2);
        assert_eq!(rb.read(&mut output, 2), 2);
        assert_eq!(output[0], vec![1.0, 2.0]);

        // 再写入，测试环绕
        assert_eq!(rb.write(&ramp(1, 5.0, 2), 2), 2);

        let mut all = planes(1, 4);
        assert_eq!(rb.read(&mut all, 4), 4);
        assert_eq!(all[0], vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_ring_buffer_full_never_overwrites() {
        let rb = RingBuffer::new(1, 4);

        assert_eq!(rb.write(&ramp(1, 1.0, 4), 4), 4);
        assert_eq!(rb.free_space(), 0);
        assert_eq!(rb.write(&ramp(1, 9.0, 2), 2), 0);

        let mut output = planes(1, 4);
        rb.read(&mut output, 4);
        assert_eq!(output[0], vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_partial_write_when_nearly_full() {
        let rb = RingBuffer::new(1, 8);
        assert_eq!(rb.write(&ramp(1, 0.0, 6), 6), 6);
        assert_eq!(rb.write(&ramp(1, 6.0, 6), 6), 2);
        assert_eq!(rb.frames_written(), 8);
    }

    #[test]
    fn test_underrun_zero_fills() {
        let rb = RingBuffer::new(2, 8);
        rb.write(&ramp(2, 1.0, 3), 3);

        let mut output = vec![vec![7.0; 6]; 2];
        assert_eq!(rb.read(&mut output, 6), 3);
        assert_eq!(output[0], vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
        assert_eq!(output[1][3..], [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_counters_hold_invariant() {
        let rb = RingBuffer::new(1, 16);
        let mut output = planes(1, 16);
        let pattern = [5usize, 11, 3, 16, 7, 2, 9];

        for (step, &n) in pattern.iter().enumerate() {
            rb.write(&ramp(1, 0.0, n), n);
            assert!(rb.frames_read() <= rb.frames_written());
            assert!(rb.frames_written() <= rb.frames_read() + 16);

            let want = pattern[pattern.len() - 1 - step];
            let unread = rb.available();
            let got = rb.read(&mut output, want);
            assert!(got <= unread);
            assert!(rb.frames_read() <= rb.frames_written());
        }
    }

    #[test]
    fn test_reset_discards_content() {
        let rb = RingBuffer::new(1, 8);
        rb.write(&ramp(1, 0.0, 5), 5);
        rb.reset();

        assert_eq!(rb.available(), 0);
        assert_eq!(rb.frames_read(), rb.frames_written());
        assert_eq!(rb.free_space(), 8);
    }

    #[test]
    fn test_reconfigure_changes_channels() {
        let rb = RingBuffer::new(2, 8);
        rb.write(&ramp(2, 0.0, 4), 4);

        unsafe { rb.reconfigure(1) };
        assert_eq!(rb.channels(), 1);
        assert_eq!(rb.available(), 0);

        assert_eq!(rb.write(&ramp(1, 3.0, 2), 2), 2);
        let mut output = planes(1, 2);
        rb.read(&mut output, 2);
        assert_eq!(output[0], vec![3.0, 4.0]);
    }

    #[test]
    fn test_concurrent_producer_consumer_preserves_order() {
        use std::sync::Arc;

        let rb = Arc::new(RingBuffer::new(1, 64));
        let total = 10_000usize;

        let producer = {
            let rb = Arc::clone(&rb);
            std::thread::spawn(move || {
                let mut next = 0usize;
                while next < total {
                    let n = (total - next).min(7);
                    let chunk = ramp(1, next as f64, n);
                    next += rb.write(&chunk, n);
                    std::thread::yield_now();
                }
            })
        };

        let mut expected = 0usize;
        let mut output = planes(1, 5);
        while expected < total {
            let got = rb.read(&mut output, 5);
            for &sample in &output[0][..got] {
                assert_eq!(sample, expected as f64);
                expected += 1;
            }
        }

        producer.join().unwrap();
        assert_eq!(rb.frames_read(), total as u64);
    }

    #[test]
    fn test_cache_line_alignment() {
        assert_eq!(std::mem::align_of::<CacheLine<AtomicU64>>(), 64);
    }
}
