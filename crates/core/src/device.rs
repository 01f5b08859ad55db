//! Capture device capability and a file-backed replay device.
//!
//! The pipeline only needs a narrow view of a camera: a readiness wait with
//! a timeout, a read into a caller-owned buffer, and the negotiated format.
//! V4L2 ioctl and mmap handling stay behind [`Device`].
//!
//! [`ReplayDevice`] implements the same capability over a recorded Annex B
//! or MJPEG file, delivering one access unit (or one JPEG image) per read,
//! the way a hardware encoder hands out one buffer per dequeue.

use std::fs;
use std::io;
use std::ops::Range;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::{MediaError, Result};
use crate::media::VideoCodec;
use crate::media::nal::NalUnits;

/// Pixel format negotiated with the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    H264,
    H265,
    Mjpeg,
}

impl PixelFormat {
    /// Elementary stream codec, or `None` for image formats.
    pub fn codec(self) -> Option<VideoCodec> {
        match self {
            Self::H264 => Some(VideoCodec::H264),
            Self::H265 => Some(VideoCodec::H265),
            Self::Mjpeg => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::H264 => "H264",
            Self::H265 => "H265",
            Self::Mjpeg => "MJPEG",
        }
    }
}

impl From<VideoCodec> for PixelFormat {
    fn from(codec: VideoCodec) -> Self {
        match codec {
            VideoCodec::H264 => Self::H264,
            VideoCodec::H265 => Self::H265,
        }
    }
}

/// Negotiated capture format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pixel_format: PixelFormat,
}

/// A source of raw capture buffers.
pub trait Device: Send {
    /// Read one buffer into `buf`. `Ok(0)` means the device produced nothing.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Block for at most `timeout` until a read would produce data.
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;

    /// Size of the largest buffer a single read may return.
    fn buffer_size(&self) -> usize;

    fn format(&self) -> VideoFormat;

    /// No further buffers will ever be produced.
    fn is_finished(&self) -> bool {
        false
    }
}

/// Replay behaviour.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Start over after the last frame.
    pub looping: bool,
    /// Hold each frame until its fps deadline.
    pub paced: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            looping: false,
            paced: true,
        }
    }
}

/// File-backed [`Device`].
pub struct ReplayDevice {
    data: Bytes,
    frames: Vec<Range<usize>>,
    format: VideoFormat,
    options: ReplayOptions,
    next: usize,
    frame_interval: Duration,
    next_due: Instant,
    buffer_size: usize,
}

impl ReplayDevice {
    /// Load `path` and index its frames.
    pub fn open(
        path: impl AsRef<Path>,
        format: VideoFormat,
        options: ReplayOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        let device = Self::from_bytes(data, format, options)?;
        tracing::info!(
            path = %path.display(),
            frames = device.frames.len(),
            format = device.format.pixel_format.name(),
            width = device.format.width,
            height = device.format.height,
            fps = device.format.fps,
            "replay device opened"
        );
        Ok(device)
    }

    /// Index an in-memory stream.
    pub fn from_bytes(
        data: impl Into<Bytes>,
        format: VideoFormat,
        options: ReplayOptions,
    ) -> Result<Self> {
        let data = data.into();
        let frames = match format.pixel_format.codec() {
            Some(codec) => access_unit_ranges(&data, codec),
            None => jpeg_ranges(&data),
        };
        if frames.is_empty() {
            return Err(MediaError::Device(format!(
                "no {} frames found in {} bytes",
                format.pixel_format.name(),
                data.len()
            )));
        }
        if format.fps == 0 {
            return Err(MediaError::Device("fps must be positive".into()));
        }

        let buffer_size = frames.iter().map(|r| r.len()).max().unwrap_or(0);
        Ok(Self {
            frame_interval: Duration::from_secs(1) / format.fps,
            next_due: Instant::now(),
            data,
            frames,
            format,
            options,
            next: 0,
            buffer_size,
        })
    }

    /// Number of frames in one pass over the file.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

impl Device for ReplayDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.next >= self.frames.len() {
            if !self.options.looping {
                return Ok(0);
            }
            tracing::debug!("replay looped");
            self.next = 0;
        }

        let range = self.frames[self.next].clone();
        if buf.len() < range.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("read buffer of {} bytes, frame needs {}", buf.len(), range.len()),
            ));
        }
        buf[..range.len()].copy_from_slice(&self.data[range.clone()]);
        self.next += 1;
        self.next_due += self.frame_interval;
        Ok(range.len())
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        if self.is_finished() {
            return Ok(false);
        }
        if !self.options.paced {
            return Ok(true);
        }

        let now = Instant::now();
        if now >= self.next_due {
            // fell behind: do not burst to catch up
            if now - self.next_due > self.frame_interval {
                self.next_due = now;
            }
            return Ok(true);
        }
        let wait = self.next_due - now;
        thread::sleep(wait.min(timeout));
        Ok(Instant::now() >= self.next_due)
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn format(&self) -> VideoFormat {
        self.format
    }

    fn is_finished(&self) -> bool {
        !self.options.looping && self.next >= self.frames.len()
    }
}

/// Group an Annex B stream into access units.
///
/// A new unit starts at the first non-VCL NAL following a slice, or at a
/// slice flagged as the first of its picture once the current unit already
/// holds a slice. Each range starts at its first NAL's start code.
fn access_unit_ranges(data: &[u8], codec: VideoCodec) -> Vec<Range<usize>> {
    let mut units = Vec::new();
    let mut start = None;
    let mut has_slice = false;

    for nal in NalUnits::new(data, true) {
        let offset = nal.bytes().as_ptr() as usize - data.as_ptr() as usize;
        let payload = nal.payload();
        let vcl = codec.is_vcl(nal.header());

        let boundary = if vcl {
            has_slice && codec.is_first_slice(payload)
        } else {
            has_slice
        };
        if boundary {
            if let Some(s) = start {
                units.push(s..offset);
            }
            start = None;
            has_slice = false;
        }
        start.get_or_insert(offset);
        has_slice |= vcl;
    }
    if let Some(s) = start {
        units.push(s..data.len());
    }
    units
}

/// Split a concatenation of JPEG images on SOI/EOI markers.
fn jpeg_ranges(data: &[u8]) -> Vec<Range<usize>> {
    let mut images = Vec::new();
    let mut pos = 0;
    while let Some(soi) = find_marker(data, pos, 0xD8) {
        let Some(eoi) = find_marker(data, soi + 2, 0xD9) else {
            tracing::debug!(offset = soi, "truncated trailing jpeg ignored");
            break;
        };
        images.push(soi..eoi + 2);
        pos = eoi + 2;
    }
    images
}

fn find_marker(data: &[u8], from: usize, marker: u8) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|w| w[0] == 0xFF && w[1] == marker)
        .map(|p| from + p)
}
