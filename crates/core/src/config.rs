use std::path::PathBuf;
use std::time::Duration;

use crate::media::SplitterConfig;
use crate::mp4::Mp4Config;
use crate::queue::DEFAULT_QUEUE_DEPTH;
use crate::snapshot::SnapshotConfig;

/// Where and how a capture session records.
#[derive(Debug, Clone)]
pub struct RecordingConfig {
    /// MP4 output path. The raw elementary-stream fallback uses the same
    /// path with the codec's extension (`.h264` / `.h265` / `.mjpeg`).
    pub path: PathBuf,
    pub mp4: Mp4Config,
}

impl RecordingConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mp4: Mp4Config::default(),
        }
    }
}

/// Capture session configuration.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub splitter: SplitterConfig,
    /// `None` disables recording.
    pub recording: Option<RecordingConfig>,
    /// `None` disables stills. Width, height and fps are taken from the device.
    pub snapshot: Option<SnapshotConfig>,
    /// Delivery queue depth before drop-oldest kicks in.
    pub queue_depth: usize,
    /// Upper bound on a single readiness wait; also the stop-flag latency.
    pub poll_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            splitter: SplitterConfig::default(),
            recording: None,
            snapshot: None,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            poll_timeout: Duration::from_millis(100),
        }
    }
}
