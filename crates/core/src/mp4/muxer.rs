use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::boxes::{self, MOOV_PLACEHOLDER_SIZE, Sample, TrackInfo};
use super::buffer::{FlushStats, WriteBuffer};
use crate::error::{MediaError, Result};
use crate::media::AccessUnit;

/// Placeholder written into the mdat size field until finalize.
const MDAT_SIZE_PLACEHOLDER: u32 = 0xFFFF_FFFF;

/// Write-path tuning for [`Mp4Muxer`].
#[derive(Debug, Clone)]
pub struct Mp4Config {
    /// Ceiling of the in-process write buffer in bytes.
    pub write_buffer_size: usize,
    /// Minimum time between keyframe-triggered flushes.
    pub min_flush_interval: Duration,
    /// Issue an fsync every N samples; 0 disables periodic syncing.
    pub sync_every_frames: u32,
}

impl Default for Mp4Config {
    fn default() -> Self {
        Self {
            write_buffer_size: 1024 * 1024,
            min_flush_interval: Duration::from_secs(1),
            sync_every_frames: 300,
        }
    }
}

/// Outcome of a successful [`Mp4Muxer::finalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mp4Summary {
    pub frames: u64,
    pub keyframes: u64,
    /// Final mdat size, header included.
    pub mdat_size: u64,
    /// `true` if moov replaced the placeholder, `false` if it was appended
    /// after mdat because it outgrew the reservation.
    pub moov_in_place: bool,
}

struct Streaming {
    file: File,
    track: TrackInfo,
    mdat_start_offset: u64,
    moov_placeholder_offset: u64,
    write_position: u64,
    samples: Vec<Sample>,
    keyframes: u64,
    buffer: WriteBuffer,
    samples_since_sync: u32,
}

enum State {
    Uninitialized,
    Streaming(Box<Streaming>),
    Finalized,
}

/// Incremental single-track MP4 writer.
///
/// ## Layout
///
/// ```text
/// ftyp                       32 bytes
/// free  (moov placeholder)   16384 bytes, overwritten at finalize
/// mdat  size=0xFFFFFFFF      patched at finalize
///   [u32 len][NAL] ...       one or more per sample
/// ```
///
/// Capture only ever appends. [`finalize`](Self::finalize) patches the mdat
/// size and writes `moov` into the reserved span, so the file never has to
/// be rewritten. A `moov` too large for the span is appended after `mdat`
/// instead and the placeholder stays a `free` box.
///
/// ## States
///
/// ```text
/// Uninitialized ──initialize──► Streaming ──finalize──► Finalized
/// ```
pub struct Mp4Muxer {
    config: Mp4Config,
    state: State,
    path: Option<PathBuf>,
}

impl Mp4Muxer {
    pub fn new(config: Mp4Config) -> Self {
        Self {
            config,
            state: State::Uninitialized,
            path: None,
        }
    }

    /// Create (truncating) `path` and initialize a muxer writing to it.
    pub fn create(path: impl AsRef<Path>, config: Mp4Config, track: TrackInfo) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut muxer = Self::new(config);
        muxer.path = Some(path.to_path_buf());
        muxer.initialize(file, track)?;
        Ok(muxer)
    }

    /// Validate `track` and write the file header.
    ///
    /// Writes `ftyp`, the 16 KiB `moov` placeholder and the mdat header,
    /// starting at the file's current position.
    pub fn initialize(&mut self, mut file: File, track: TrackInfo) -> Result<()> {
        if !matches!(self.state, State::Uninitialized) {
            return Err(MediaError::AlreadyInitialized);
        }
        track.validate()?;

        let base = file.stream_position()?;
        let ftyp = boxes::ftyp();
        file.write_all(&ftyp)?;

        let moov_placeholder_offset = base + ftyp.len() as u64;
        file.write_all(&boxes::free_box(MOOV_PLACEHOLDER_SIZE))?;

        let mdat_start_offset = moov_placeholder_offset + MOOV_PLACEHOLDER_SIZE as u64;
        file.write_all(&boxes::mdat_header(MDAT_SIZE_PLACEHOLDER))?;
        let write_position = mdat_start_offset + boxes::BOX_HEADER_SIZE as u64;

        tracing::info!(
            path = ?self.path,
            codec = ?track.codec,
            width = track.width,
            height = track.height,
            fps = track.fps,
            mdat_start_offset,
            "mp4 recording started"
        );

        self.state = State::Streaming(Box::new(Streaming {
            file,
            track,
            mdat_start_offset,
            moov_placeholder_offset,
            write_position,
            samples: Vec::new(),
            keyframes: 0,
            buffer: WriteBuffer::new(self.config.write_buffer_size, self.config.min_flush_interval),
            samples_since_sync: 0,
        }));
        Ok(())
    }

    /// Append one NAL payload (no start code) as one sample.
    pub fn add_frame(&mut self, nal: &[u8], is_keyframe: bool) -> Result<()> {
        self.add_sample(&[nal], is_keyframe)
    }

    /// Append every NAL of `access_unit` as a single sample.
    pub fn add_access_unit(&mut self, access_unit: &AccessUnit) -> Result<()> {
        let nals: Vec<&[u8]> = access_unit.nals().iter().map(|n| n.as_ref()).collect();
        self.add_sample(&nals, access_unit.is_keyframe())
    }

    fn add_sample(&mut self, nals: &[&[u8]], is_keyframe: bool) -> Result<()> {
        let sync_every = self.config.sync_every_frames;
        let State::Streaming(s) = &mut self.state else {
            return Err(MediaError::NotStreaming);
        };
        if nals.iter().all(|n| n.is_empty()) {
            return Err(MediaError::EmptyFrame);
        }

        let offset = s.write_position;
        let mut size = 0u64;
        for nal in nals.iter().filter(|n| !n.is_empty()) {
            s.buffer.append(&mut s.file, &(nal.len() as u32).to_be_bytes())?;
            s.buffer.append(&mut s.file, nal)?;
            size += 4 + nal.len() as u64;
        }
        s.write_position += size;
        s.samples.push(Sample {
            offset,
            size: size as u32,
            is_keyframe,
        });

        if is_keyframe {
            s.keyframes += 1;
            s.buffer.flush_if_due(&mut s.file)?;
        }

        s.samples_since_sync += 1;
        if sync_every > 0 && s.samples_since_sync >= sync_every {
            s.buffer.flush(&mut s.file)?;
            s.file.sync_data()?;
            s.samples_since_sync = 0;
            tracing::trace!(frames = s.samples.len(), "periodic sync");
        }
        Ok(())
    }

    /// Flush, patch the mdat size and write the real `moov`.
    ///
    /// The muxer is Finalized afterwards even if writing failed; a second
    /// call returns [`MediaError::NotStreaming`] without touching the file.
    pub fn finalize(&mut self) -> Result<Mp4Summary> {
        let mut s = match std::mem::replace(&mut self.state, State::Finalized) {
            State::Streaming(s) => s,
            other => {
                self.state = other;
                return Err(MediaError::NotStreaming);
            }
        };

        s.buffer.flush(&mut s.file)?;
        s.file.sync_all()?;

        let mdat_size = s.write_position - s.mdat_start_offset;
        if mdat_size > u32::MAX as u64 {
            return Err(MediaError::Mp4TooLarge(mdat_size));
        }
        s.file.seek(SeekFrom::Start(s.mdat_start_offset))?;
        s.file.write_all(&(mdat_size as u32).to_be_bytes())?;

        let moov = boxes::build_moov(&s.track, &s.samples)?;
        let moov_in_place = fits_placeholder(moov.len());
        if moov_in_place {
            s.file.seek(SeekFrom::Start(s.moov_placeholder_offset))?;
            s.file.write_all(&moov)?;
            let rest = MOOV_PLACEHOLDER_SIZE - moov.len();
            if rest > 0 {
                s.file.write_all(&boxes::free_box(rest))?;
            }
        } else {
            tracing::warn!(
                moov_bytes = moov.len(),
                reserved = MOOV_PLACEHOLDER_SIZE,
                "moov exceeds placeholder, appending after mdat"
            );
            s.file.seek(SeekFrom::Start(s.write_position))?;
            s.file.write_all(&moov)?;
        }
        s.file.sync_all()?;

        let summary = Mp4Summary {
            frames: s.samples.len() as u64,
            keyframes: s.keyframes,
            mdat_size,
            moov_in_place,
        };
        tracing::info!(
            path = ?self.path,
            frames = summary.frames,
            keyframes = summary.keyframes,
            mdat_size,
            moov_in_place,
            "mp4 finalized"
        );
        Ok(summary)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.state, State::Streaming(_))
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self.state, State::Finalized)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Samples recorded so far.
    pub fn frame_count(&self) -> u64 {
        self.streaming().map_or(0, |s| s.samples.len() as u64)
    }

    pub fn keyframe_count(&self) -> u64 {
        self.streaming().map_or(0, |s| s.keyframes)
    }

    /// File offset of the mdat size field.
    pub fn mdat_start_offset(&self) -> Option<u64> {
        self.streaming().map(|s| s.mdat_start_offset)
    }

    /// Logical end of the file, buffered bytes included.
    pub fn write_position(&self) -> Option<u64> {
        self.streaming().map(|s| s.write_position)
    }

    /// Recorded samples (offset, size, keyframe flag).
    pub fn samples(&self) -> &[Sample] {
        self.streaming().map_or(&[], |s| s.samples.as_slice())
    }

    pub fn buffer_stats(&self) -> Option<FlushStats> {
        self.streaming().map(|s| s.buffer.stats())
    }

    fn streaming(&self) -> Option<&Streaming> {
        match &self.state {
            State::Streaming(s) => Some(s),
            _ => None,
        }
    }
}

impl Drop for Mp4Muxer {
    fn drop(&mut self) {
        if self.is_streaming() {
            if let Err(e) = self.finalize() {
                tracing::error!(path = ?self.path, error = %e, "finalize on drop failed");
            }
        }
    }
}

/// Whether a moov of `len` bytes can replace the placeholder, leaving either
/// nothing or room for a `free` box behind it.
fn fits_placeholder(len: usize) -> bool {
    len == MOOV_PLACEHOLDER_SIZE || len + boxes::BOX_HEADER_SIZE <= MOOV_PLACEHOLDER_SIZE
}
