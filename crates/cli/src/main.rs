use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use camstream::config::RecordingConfig;
use camstream::device::ReplayOptions;
use camstream::sdp::{SdpConfig, generate_sdp};
use camstream::{
    CaptureConfig, CaptureSession, CaptureStats, CaptureWorker, FrameQueue, FrameSource, Mp4Config,
    MuxerRegistry, PixelFormat, ReplayDevice, SnapshotConfig, Step, VideoFormat,
};
use clap::{Parser, ValueEnum};

/// Bounded wait for muxer locks during emergency finalize.
const EMERGENCY_LOCK_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    H264,
    H265,
    Mjpeg,
}

impl From<Format> for PixelFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::H264 => PixelFormat::H264,
            Format::H265 => PixelFormat::H265,
            Format::Mjpeg => PixelFormat::Mjpeg,
        }
    }
}

#[derive(Parser)]
#[command(
    name = "camstream",
    about = "Replay a camera stream: split NAL units, record MP4, keep snapshots"
)]
struct Args {
    /// Annex B (.h264/.h265) or concatenated JPEG input file
    input: PathBuf,

    /// Stream format of the input
    #[arg(long, short, value_enum, default_value = "h264")]
    format: Format,

    #[arg(long, default_value_t = 1920)]
    width: u32,

    #[arg(long, default_value_t = 1080)]
    height: u32,

    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Record to this MP4 path
    #[arg(long, short)]
    record: Option<PathBuf>,

    /// Directory for periodic snapshot files
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Snapshot save interval in seconds (1-60)
    #[arg(long, default_value_t = 5)]
    snapshot_interval: u64,

    /// Re-send parameter sets before every keyframe
    #[arg(long)]
    repeat_config: bool,

    /// Delivery queue depth
    #[arg(long, default_value_t = 256)]
    queue_depth: usize,

    /// MP4 write buffer size in KiB
    #[arg(long, default_value_t = 1024)]
    write_buffer_kb: usize,

    /// Minimum interval between keyframe flushes in milliseconds
    #[arg(long, default_value_t = 1000)]
    flush_interval_ms: u64,

    /// Restart the input when it ends
    #[arg(long = "loop")]
    looping: bool,

    /// Read as fast as possible instead of at the input frame rate
    #[arg(long)]
    no_pacing: bool,

    /// Drive capture from the main thread instead of a worker thread
    #[arg(long)]
    cooperative: bool,

    /// Dynamic RTP payload type advertised for H.264/H.265
    #[arg(long, default_value_t = 96)]
    payload_type: u8,
}

impl Args {
    fn capture_config(&self) -> CaptureConfig {
        let recording = self.record.as_ref().map(|path| RecordingConfig {
            path: path.clone(),
            mp4: Mp4Config {
                write_buffer_size: self.write_buffer_kb * 1024,
                min_flush_interval: Duration::from_millis(self.flush_interval_ms),
                ..Mp4Config::default()
            },
        });
        let snapshot = self.snapshot_dir.as_ref().map(|dir| SnapshotConfig {
            dir: Some(dir.clone()),
            save_interval_secs: self.snapshot_interval,
            ..SnapshotConfig::default()
        });

        CaptureConfig {
            splitter: camstream::media::SplitterConfig {
                repeat_config: self.repeat_config,
            },
            recording,
            snapshot,
            queue_depth: self.queue_depth,
            ..CaptureConfig::default()
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let format = VideoFormat {
        width: args.width,
        height: args.height,
        fps: args.fps,
        pixel_format: args.format.into(),
    };
    let options = ReplayOptions {
        looping: args.looping,
        paced: !args.no_pacing,
    };
    let device = match ReplayDevice::open(&args.input, format, options) {
        Ok(device) => device,
        Err(e) => {
            eprintln!("Failed to open {}: {}", args.input.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
        let report = MuxerRegistry::global().finalize_all(EMERGENCY_LOCK_TIMEOUT);
        tracing::warn!(?report, "interrupted, recordings finalized");
    }) {
        eprintln!("Failed to install Ctrl+C handler: {}", e);
        return ExitCode::FAILURE;
    }

    let config = args.capture_config();
    let poll_timeout = config.poll_timeout;
    let queue = Arc::new(FrameQueue::new(config.queue_depth));
    let session = CaptureSession::new(device, config, queue.clone());

    let consumer = {
        let queue = queue.clone();
        let stop = stop.clone();
        thread::spawn(move || drain(&queue, &stop))
    };

    let sdp = SdpConfig {
        payload_type: args.payload_type,
        ..SdpConfig::default()
    };
    let stats = if args.cooperative {
        run_cooperative(session, &stop, poll_timeout, &sdp)
    } else {
        run_worker(session, &stop, poll_timeout, &sdp)
    };

    stop.store(true, Ordering::SeqCst);
    queue.wake_all();
    let delivered = consumer.join().unwrap_or_default();

    match stats {
        Some(stats) => {
            println!(
                "{} frames ({} keyframes, {} bytes), {} units delivered, {} dropped, {} read errors",
                stats.frames,
                stats.keyframes,
                stats.bytes,
                delivered,
                queue.dropped(),
                stats.read_errors
            );
            ExitCode::SUCCESS
        }
        None => ExitCode::FAILURE,
    }
}

fn run_worker(
    session: CaptureSession<ReplayDevice>,
    stop: &AtomicBool,
    poll_timeout: Duration,
    sdp: &SdpConfig,
) -> Option<CaptureStats> {
    let worker = match CaptureWorker::spawn(session, poll_timeout) {
        Ok(worker) => worker,
        Err(e) => {
            eprintln!("Failed to start capture: {}", e);
            return None;
        }
    };

    let mut announced = false;
    while !stop.load(Ordering::SeqCst) && !worker.is_finished() {
        if !announced {
            announced = announce(worker.source().as_ref(), sdp);
        }
        thread::sleep(poll_timeout);
    }

    match worker.stop_and_join() {
        Ok(stats) => Some(stats),
        Err(e) => {
            eprintln!("Capture failed: {}", e);
            None
        }
    }
}

fn run_cooperative(
    mut session: CaptureSession<ReplayDevice>,
    stop: &AtomicBool,
    poll_timeout: Duration,
    sdp: &SdpConfig,
) -> Option<CaptureStats> {
    let source = session.source();
    let mut announced = false;
    while !stop.load(Ordering::SeqCst) {
        if session.poll(poll_timeout) == Step::Finished {
            break;
        }
        if !announced {
            announced = announce(source.as_ref(), sdp);
        }
    }
    Some(session.finish())
}

/// Print the session description once codec parameters are known.
fn announce(source: &dyn FrameSource, config: &SdpConfig) -> bool {
    let ready = source.format().pixel_format == PixelFormat::Mjpeg || source.aux_line().is_some();
    if ready {
        println!("{}", generate_sdp(source, config));
    }
    ready
}

/// Delivery side: drain the queue until stopped, returning units consumed.
fn drain(queue: &FrameQueue, stop: &AtomicBool) -> u64 {
    let mut delivered = 0u64;
    loop {
        match queue.wait_pop(Duration::from_millis(100)) {
            Some(frame) => {
                delivered += 1;
                tracing::trace!(bytes = frame.data.len(), ts = ?frame.timestamp, "unit delivered");
            }
            None if stop.load(Ordering::SeqCst) => break,
            None => {}
        }
    }
    delivered + queue.drain().len() as u64
}
