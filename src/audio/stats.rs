//! 播放统计模块
//!
//! 在 render 回调中收集统计信息，采用降频采样策略减少开销

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// 统计采样间隔：每 N 次 callback 才采样一次水位
const SAMPLE_INTERVAL: u64 = 16;

/// 水位缓冲区大小
const WATER_LEVEL_BUFFER_SIZE: usize = 256;

/// 播放统计收集器
///
/// 所有操作都是 lock-free 的，适合在 render 回调中使用
pub struct PlaybackStats {
    callback_count: AtomicU64,
    silent_callbacks: AtomicU64,

    // 水位（降频采样，单位：帧）
    water_level_buffer: Box<[AtomicUsize; WATER_LEVEL_BUFFER_SIZE]>,
    water_level_write_idx: AtomicUsize,

    underrun_count: AtomicU64,

    // 已播放帧数（不含静音填充）
    frames_played: AtomicU64,
}

impl PlaybackStats {
    pub fn new() -> Self {
        Self {
            callback_count: AtomicU64::new(0),
            silent_callbacks: AtomicU64::new(0),
            water_level_buffer: Box::new(std::array::from_fn(|_| AtomicUsize::new(0))),
            water_level_write_idx: AtomicUsize::new(0),
            underrun_count: AtomicU64::new(0),
            frames_played: AtomicU64::new(0),
        }
    }

    /// 在 render callback 开头调用
    ///
    /// `water_level`: 回调开始时缓冲区中的可读帧数。
    /// 只在采样点才记录水位，减少开销
    #[inline]
    pub fn on_callback(&self, water_level: usize) {
        let count = self.callback_count.fetch_add(1, Ordering::Relaxed);

        if count % SAMPLE_INTERVAL == 0 {
            let idx = self.water_level_write_idx.fetch_add(1, Ordering::Relaxed)
                % WATER_LEVEL_BUFFER_SIZE;
            self.water_level_buffer[idx].store(water_level, Ordering::Relaxed);
        }
    }

    /// 记录一次整段静音输出（暂停、静音、无数据）
    #[inline]
    pub fn record_silence(&self) {
        self.silent_callbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录 underrun
    #[inline]
    pub fn record_underrun(&self) {
        self.underrun_count.fetch_add(1, Ordering::Relaxed);
    }

    /// 更新已播放帧数
    #[inline]
    pub fn add_frames_played(&self, frames: u64) {
        self.frames_played.fetch_add(frames, Ordering::Relaxed);
    }

    /// 获取 underrun 计数
    #[inline]
    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    /// 获取 callback 计数
    #[inline]
    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    /// 获取已播放帧数
    #[inline]
    pub fn frames_played(&self) -> u64 {
        self.frames_played.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self, buffer_capacity: usize) -> StatsReport {
        let water_levels: Vec<usize> = self
            .water_level_buffer
            .iter()
            .map(|level| level.load(Ordering::Relaxed))
            .filter(|&level| level > 0)
            .collect();

        let water_stats = WaterLevelStats {
            min: water_levels.iter().copied().min().unwrap_or(0),
            max: water_levels.iter().copied().max().unwrap_or(0),
            capacity: buffer_capacity,
        };

        StatsReport {
            callback_count: self.callback_count.load(Ordering::Relaxed),
            silent_callbacks: self.silent_callbacks.load(Ordering::Relaxed),
            sample_interval: SAMPLE_INTERVAL,
            water_stats,
            underrun_count: self.underrun_count.load(Ordering::Relaxed),
            frames_played: self.frames_played.load(Ordering::Relaxed),
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.callback_count.store(0, Ordering::Relaxed);
        self.silent_callbacks.store(0, Ordering::Relaxed);
        self.water_level_write_idx.store(0, Ordering::Relaxed);
        self.underrun_count.store(0, Ordering::Relaxed);
        self.frames_played.store(0, Ordering::Relaxed);

        for level in self.water_level_buffer.iter() {
            level.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for PlaybackStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub callback_count: u64,
    pub silent_callbacks: u64,
    pub sample_interval: u64,
    pub water_stats: WaterLevelStats,
    pub underrun_count: u64,
    pub frames_played: u64,
}

#[derive(Debug, Clone)]
pub struct WaterLevelStats {
    pub min: usize,
    pub max: usize,
    pub capacity: usize,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Playback Statistics")?;
        writeln!(f, "===================")?;
        writeln!(f, "Total callbacks: {}", self.callback_count)?;
        writeln!(f, "Silent callbacks: {}", self.silent_callbacks)?;
        writeln!(
            f,
            "Water level sample interval: every {} callbacks",
            self.sample_interval
        )?;
        writeln!(f)?;

        writeln!(f, "Ring Buffer Water Level:")?;
        writeln!(f, "  Min: {} frames", self.water_stats.min)?;
        writeln!(f, "  Max: {} frames", self.water_stats.max)?;
        writeln!(f, "  Capacity: {} frames", self.water_stats.capacity)?;
        writeln!(f)?;

        writeln!(f, "Underruns: {}", self.underrun_count)?;
        writeln!(f, "Frames played: {}", self.frames_played)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_water_level_is_sampled() {
        let stats = PlaybackStats::new();
        for level in 1..=(SAMPLE_INTERVAL as usize * 3) {
            stats.on_callback(level * 10);
        }

        let report = stats.report(1024);
        assert_eq!(report.callback_count, SAMPLE_INTERVAL * 3);
        // 第 0、16、32 次回调被采样
        assert_eq!(report.water_stats.min, 10);
        assert_eq!(report.water_stats.max, (2 * SAMPLE_INTERVAL as usize + 1) * 10);
    }

    #[test]
    fn test_reset_clears_counters() {
        let stats = PlaybackStats::new();
        stats.on_callback(5);
        stats.record_underrun();
        stats.record_silence();
        stats.add_frames_played(128);

        stats.reset();
        let report = stats.report(64);
        assert_eq!(report.callback_count, 0);
        assert_eq!(report.underrun_count, 0);
        assert_eq!(report.silent_callbacks, 0);
        assert_eq!(report.frames_played, 0);
        assert_eq!(report.water_stats.max, 0);
    }

    #[test]
    fn test_report_display() {
        let stats = PlaybackStats::new();
        stats.record_underrun();
        let text = stats.report(2048).to_string();
        assert!(text.contains("Underruns: 1"));
        assert!(text.contains("Capacity: 2048 frames"));
    }
}
