pub mod capture;
pub mod config;
pub mod device;
pub mod error;
pub mod media;
pub mod mp4;
pub mod queue;
pub mod recorder;
pub mod sdp;
pub mod snapshot;
pub mod source;

pub use capture::{CaptureSession, CaptureStats, CaptureWorker, Step};
pub use config::CaptureConfig;
pub use device::{Device, PixelFormat, ReplayDevice, VideoFormat};
pub use error::{MediaError, Result};
pub use media::{FrameSplitter, VideoCodec};
pub use mp4::{Mp4Config, Mp4Muxer, MuxerRegistry};
pub use queue::{FrameQueue, FrameSink, QueuedFrame};
pub use snapshot::{SnapshotConfig, SnapshotGenerator};
pub use source::FrameSource;
