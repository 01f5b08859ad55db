//! Recording output selection.
//!
//! ```text
//! Pending ──first keyframe, sets complete──► Mp4 (registered muxer)
//!    │
//!    ├──first keyframe, sets missing/unusable──► Raw (Annex B / MJPEG file)
//!    └──output cannot be opened──► Disabled
//! ```
//!
//! Recording problems never stop capture: every failure is logged and, at
//! worst, turns recording off for the rest of the session.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::config::RecordingConfig;
use crate::error::{MediaError, Result};
use crate::media::{SplitFrame, VideoCodec};
use crate::media::params::ParameterSets;
use crate::mp4::{Mp4Muxer, MuxerRegistry, SharedMuxer, TrackInfo};

/// Track description available when the first keyframe arrives.
#[derive(Debug, Clone, Copy)]
pub struct TrackShape {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

enum Output {
    Pending(RecordingConfig),
    Mp4(SharedMuxer),
    Raw {
        writer: BufWriter<File>,
        path: PathBuf,
    },
    Disabled,
}

/// Per-session recording sink.
pub struct Recorder {
    output: Output,
    registry: MuxerRegistry,
}

impl Recorder {
    pub fn new(config: Option<RecordingConfig>, registry: MuxerRegistry) -> Self {
        let output = match config {
            Some(config) => Output::Pending(config),
            None => Output::Disabled,
        };
        Self { output, registry }
    }

    pub fn is_mp4(&self) -> bool {
        matches!(self.output, Output::Mp4(_))
    }

    pub fn is_raw(&self) -> bool {
        matches!(self.output, Output::Raw { .. })
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self.output, Output::Disabled)
    }

    /// The active muxer, if recording to MP4.
    pub fn muxer(&self) -> Option<&SharedMuxer> {
        match &self.output {
            Output::Mp4(muxer) => Some(muxer),
            _ => None,
        }
    }

    /// Record one split capture buffer. `raw` is the buffer as read.
    pub fn record_frame(
        &mut self,
        codec: VideoCodec,
        params: &ParameterSets,
        shape: TrackShape,
        split: &SplitFrame,
        raw: &[u8],
    ) {
        if let Output::Pending(config) = &self.output {
            if !split.access_unit.is_keyframe() {
                return;
            }
            let config = config.clone();
            self.output = self.start(&config, codec, params, shape);
        }

        let result = match &mut self.output {
            Output::Mp4(muxer) => {
                if split.access_unit.is_empty() {
                    return;
                }
                muxer.lock().add_access_unit(&split.access_unit)
            }
            Output::Raw { writer, .. } => writer.write_all(raw).map_err(MediaError::from),
            Output::Pending(_) | Output::Disabled => return,
        };
        match result {
            Ok(()) => {}
            Err(MediaError::NotStreaming) if self.finalized_elsewhere() => {
                tracing::info!("recording finalized during shutdown, stopped");
                self.output = Output::Disabled;
            }
            Err(e) => self.fail(e),
        }
    }

    /// The muxer was closed outside this recorder, e.g. by an emergency finalize.
    fn finalized_elsewhere(&self) -> bool {
        self.muxer().is_some_and(|muxer| muxer.lock().is_finalized())
    }

    /// Record one JPEG image; MJPEG always uses the raw output.
    pub fn record_jpeg(&mut self, jpeg: &[u8]) {
        if let Output::Pending(config) = &self.output {
            let path = config.path.with_extension("mjpeg");
            self.output = open_raw(path);
        }
        if let Output::Raw { writer, .. } = &mut self.output {
            if let Err(e) = writer.write_all(jpeg) {
                self.fail(e.into());
            }
        }
    }

    fn start(
        &self,
        config: &RecordingConfig,
        codec: VideoCodec,
        params: &ParameterSets,
        shape: TrackShape,
    ) -> Output {
        let track = TrackInfo {
            codec,
            params: params.clone(),
            width: shape.width,
            height: shape.height,
            fps: shape.fps,
        };
        if let Err(e) = track.validate() {
            tracing::warn!(error = %e, "mp4 recording unavailable, falling back to raw stream");
            return open_raw(config.path.with_extension(codec.raw_extension()));
        }

        match Mp4Muxer::create(&config.path, config.mp4.clone(), track) {
            Ok(muxer) => Output::Mp4(self.registry.register(muxer)),
            Err(e) => {
                tracing::error!(
                    path = %config.path.display(),
                    error = %e,
                    "cannot open recording, disabled"
                );
                Output::Disabled
            }
        }
    }

    fn fail(&mut self, error: MediaError) {
        match &self.output {
            Output::Raw { path, .. } => {
                tracing::error!(path = %path.display(), %error, "raw recording failed, disabled");
            }
            _ => tracing::error!(%error, "recording failed, disabled"),
        }
        if let Err(e) = self.finish() {
            tracing::warn!(error = %e, "closing failed recording");
        }
        self.output = Output::Disabled;
    }

    /// Finalize the MP4 or flush the raw stream. Recording is off afterwards.
    pub fn finish(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.output, Output::Disabled) {
            Output::Mp4(shared) => {
                let mut muxer = shared.lock();
                if muxer.is_streaming() {
                    muxer.finalize()?;
                }
            }
            Output::Raw { mut writer, path } => {
                writer.flush()?;
                tracing::info!(path = %path.display(), "raw recording closed");
            }
            Output::Pending(config) => {
                tracing::warn!(path = %config.path.display(), "no keyframe seen, nothing recorded");
            }
            Output::Disabled => {}
        }
        Ok(())
    }
}

fn open_raw(path: PathBuf) -> Output {
    match File::create(&path) {
        Ok(file) => {
            tracing::info!(path = %path.display(), "raw recording started");
            Output::Raw {
                writer: BufWriter::new(file),
                path,
            }
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "cannot open recording, disabled");
            Output::Disabled
        }
    }
}
