//! Roger Gapless - 无缝播放器命令行
//!
//! 把多个文件（或目录中的全部音频文件）依次入队，
//! 由播放引擎首尾相接地播放。

use std::ffi::OsStr;
use std::io::{self, Read as IoRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::seq::SliceRandom;

use roger_gapless::audio::{DeviceFormat, NullOutput, OutputDevice, StreamFormat};
use roger_gapless::decode::{self, SourceDecoder, SymphoniaDecoder, SyntheticSource};
use roger_gapless::{PlaybackState, Player, PlayerConfig};

#[cfg(feature = "cpal")]
use roger_gapless::audio::CpalOutput;

/// 方向键/字母键单次跳转的秒数
const SEEK_STEP_SECS: f64 = 3.0;

/// 终端原始模式 RAII 守卫
struct RawModeGuard {
    original: libc::termios,
}

impl RawModeGuard {
    /// 进入原始模式，返回守卫（离开作用域自动恢复）
    fn enter() -> Option<Self> {
        unsafe {
            let mut original: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(libc::STDIN_FILENO, &mut original) != 0 {
                return None;
            }

            let mut raw = original;
            raw.c_lflag &= !(libc::ICANON | libc::ECHO);
            // 非阻塞读取
            raw.c_cc[libc::VMIN] = 0;
            raw.c_cc[libc::VTIME] = 0;

            if libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &raw) != 0 {
                return None;
            }

            Some(Self { original })
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &self.original);
        }
    }
}

/// 非阻塞读取一个字符
fn read_char_nonblocking() -> Option<u8> {
    let mut buf = [0u8; 1];
    match io::stdin().lock().read(&mut buf) {
        Ok(1) => Some(buf[0]),
        _ => None,
    }
}

/// Roger Gapless - gapless audio player
#[derive(Parser)]
#[command(name = "roger-gapless")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Audio files or directories, played back to back without gaps
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Ring buffer size in milliseconds
    #[arg(short, long, default_value = "3000")]
    buffer_ms: u32,

    /// Frames decoded per step
    #[arg(short, long, default_value = "4096")]
    quantum: usize,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Shuffle playback order
    #[arg(short, long)]
    shuffle: bool,

    /// Start position within the first track, in seconds
    #[arg(long, value_name = "SECS")]
    seek: Option<f64>,

    /// Master volume (0.0 - 1.0)
    #[arg(long, default_value = "1.0")]
    volume: f32,

    /// Render into a silent clock-driven device instead of the sound card
    #[arg(long)]
    null: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show information about an audio file
    Info {
        /// Audio file to probe
        file: PathBuf,
    },

    /// Play a sequence of synthetic sine tones
    Tone {
        /// Frequency of the first tone in Hz
        #[arg(long, default_value = "440")]
        frequency: f64,

        /// Length of each tone in seconds
        #[arg(long, default_value = "2")]
        secs: f64,

        /// Number of tones (each a fifth above the previous)
        #[arg(long, default_value = "3")]
        count: u32,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match cli.command {
        Some(Commands::Info { ref file }) => show_file_info(file),
        Some(Commands::Tone {
            frequency,
            secs,
            count,
        }) => play_tones(&cli, frequency, secs, count),
        None if cli.paths.is_empty() => {
            println!("Roger Gapless - gapless audio player\n");
            println!("Usage: roger-gapless [OPTIONS] <PATH>...");
            println!("       roger-gapless info <FILE>");
            println!("       roger-gapless tone [--frequency HZ] [--secs S] [--count N]");
            println!("\nSupported formats: {}", AUDIO_EXTENSIONS.join(", "));
            println!("Directories are expanded to their audio files, sorted by name.");
            println!("\nControls: [Space] pause/resume | [f] +3s | [b] -3s | [q] quit");
            Ok(())
        }
        None => play_paths(&cli),
    }
}

/// 支持的音频文件扩展名
const AUDIO_EXTENSIONS: &[&str] = &["flac", "wav", "aiff", "aif", "mp3"];

fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ext| AUDIO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// 扫描目录中的音频文件（按文件名排序）
fn scan_audio_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_audio_file(path))
        .collect();

    files.sort_by(|a, b| {
        a.file_name()
            .unwrap_or_default()
            .cmp(b.file_name().unwrap_or_default())
    });
    Ok(files)
}

/// 显示文件信息
fn show_file_info(file: &Path) -> anyhow::Result<()> {
    let decoder = SymphoniaDecoder::open(file)?;
    let info = decoder.info();

    println!("File:        {}", file.display());
    println!("Format:      {}", info.format);
    println!("Codec:       {}", info.codec);
    println!("Sample rate: {} Hz", info.sample_rate);
    println!("Channels:    {}", info.channels);
    if let Some(bits) = info.bit_depth {
        println!("Bit depth:   {}", bits);
    }
    match (info.total_frames, info.duration_secs) {
        (Some(frames), Some(secs)) => {
            println!("Length:      {} frames ({})", frames, format_time(secs))
        }
        _ => println!("Length:      unknown"),
    }
    println!("Seekable:    {}", decoder.supports_seeking());
    Ok(())
}

/// 播放文件/目录
fn play_paths(cli: &Cli) -> anyhow::Result<()> {
    let mut files = Vec::new();
    for path in &cli.paths {
        if path.is_dir() {
            files.extend(scan_audio_files(path)?);
        } else {
            files.push(path.clone());
        }
    }

    if cli.shuffle {
        files.shuffle(&mut rand::thread_rng());
    }

    // 出错的文件跳过，其余照常播放
    let mut sources: Vec<Box<dyn SourceDecoder>> = Vec::with_capacity(files.len());
    for file in &files {
        match decode::open(file) {
            Ok(decoder) => sources.push(decoder),
            Err(e) => eprintln!("Skipping {}: {}", file.display(), e),
        }
    }

    if sources.is_empty() {
        println!("No playable audio files.");
        println!("Supported formats: {}", AUDIO_EXTENSIONS.join(", "));
        return Ok(());
    }

    println!("Roger Gapless - {} track(s)\n", sources.len());
    for (i, source) in sources.iter().enumerate() {
        println!("  [{}] {} ({})", i + 1, source.description(), source.format());
    }
    println!();

    run_player(cli, sources)
}

/// 合成正弦音序列
fn play_tones(cli: &Cli, frequency: f64, secs: f64, count: u32) -> anyhow::Result<()> {
    let format = StreamFormat::default();
    let sources: Vec<Box<dyn SourceDecoder>> = (0..count)
        .map(|i| {
            let freq = frequency * 1.5f64.powi(i as i32);
            Box::new(SyntheticSource::sine(format, freq, 0.25, secs)) as Box<dyn SourceDecoder>
        })
        .collect();

    if sources.is_empty() {
        return Ok(());
    }
    println!("Roger Gapless - {} tone(s) starting at {:.1} Hz\n", count, frequency);
    run_player(cli, sources)
}

/// 打开输出设备
fn open_device(cli: &Cli, format: StreamFormat) -> anyhow::Result<Box<dyn OutputDevice>> {
    #[cfg(feature = "cpal")]
    if !cli.null {
        return Ok(Box::new(CpalOutput::open_default()?));
    }

    #[cfg(not(feature = "cpal"))]
    if !cli.null {
        log::warn!("Built without the `cpal` feature, rendering into the null output");
    }

    // 空设备直接采用首个源的采样率
    let device = DeviceFormat::new(format.sample_rate, 2, DeviceFormat::default().buffer_frames);
    Ok(Box::new(NullOutput::new(device)))
}

/// 创建播放器配置
fn create_player_config(cli: &Cli, sample_rate: u32) -> PlayerConfig {
    let buffer_frames = (cli.buffer_ms as u64 * sample_rate as u64 / 1000) as usize;
    PlayerConfig {
        buffer_frames,
        decode_quantum: cli.quantum,
        ..PlayerConfig::default()
    }
}

fn run_player(cli: &Cli, sources: Vec<Box<dyn SourceDecoder>>) -> anyhow::Result<()> {
    let first = sources[0].format();
    let device = open_device(cli, first)?;
    let config = create_player_config(cli, device.format().sample_rate);
    let mut player = Player::new(config, device);
    player.set_master_volume(cli.volume);

    for source in sources {
        if let Err(e) = player.enqueue(source) {
            eprintln!("Skipping source: {}", e);
        }
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    player.play()?;

    if let Some(secs) = cli.seek {
        // 等解码线程登记首个任务
        let deadline = Instant::now() + Duration::from_secs(2);
        while player.track_position().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        match player.seek_to_time(secs) {
            Ok(frame) => log::info!("Started at frame {}", frame),
            Err(e) => eprintln!("Seek to {:.1}s failed: {}", secs, e),
        }
    }

    let _raw_guard = RawModeGuard::enter();
    let mut now_playing: Option<String> = None;

    loop {
        if !running.load(Ordering::SeqCst) {
            println!("\nPlayback interrupted.");
            break;
        }
        player.check_device()?;
        if player.state() == PlaybackState::Stopped {
            break;
        }

        match read_char_nonblocking() {
            Some(b' ') => player.play_pause()?,
            Some(b'f') => report_seek(player.seek_forward(SEEK_STEP_SECS)),
            Some(b'b') => report_seek(player.seek_backward(SEEK_STEP_SECS)),
            Some(b'q') => break,
            _ => {}
        }

        let source = player.playing_source();
        if source.is_some() && source != now_playing {
            if now_playing.is_some() {
                println!();
            }
            println!("Now playing: {}", source.as_deref().unwrap_or_default());
            now_playing = source;
        }

        print_progress(&player)?;
        std::thread::sleep(Duration::from_millis(50));
    }

    println!();
    player.stop()?;

    if cli.verbose {
        println!("\n{}", player.stats());
    } else {
        let underruns = player.underrun_count();
        if underruns > 0 {
            println!("Underruns: {}", underruns);
        }
    }
    Ok(())
}

fn report_seek(result: Result<u64, roger_gapless::PlayerError>) {
    if let Err(e) = result {
        log::warn!("Seek failed: {}", e);
    }
}

fn print_progress(player: &Player) -> io::Result<()> {
    let state = match player.state() {
        PlaybackState::Playing => "▶",
        PlaybackState::Paused => "⏸",
        PlaybackState::Stopped => "⏹",
    };

    let (track_pos, track_total) = match player.track_position() {
        Some(p) if p.sample_rate > 0 => {
            let rate = p.sample_rate as f64;
            (
                p.frame as f64 / rate,
                p.total.map(|t| t as f64 / rate),
            )
        }
        _ => (0.0, None),
    };

    let capacity = player.stats().water_stats.capacity.max(1);
    print!(
        "\r{} {} / {}  |  Session: {} / {}  |  Buffer: {:5.1}%  |  Underruns: {}  ",
        state,
        format_time(track_pos),
        track_total.map_or_else(|| "--:--.--".to_string(), format_time),
        format_time(player.current_time()),
        player
            .total_time()
            .map_or_else(|| "--:--.--".to_string(), format_time),
        player.buffered_frames() as f64 / capacity as f64 * 100.0,
        player.underrun_count()
    );
    io::stdout().flush()
}

fn format_time(secs: f64) -> String {
    let mins = (secs / 60.0) as u32;
    format!("{:02}:{:05.2}", mins, secs % 60.0)
}
