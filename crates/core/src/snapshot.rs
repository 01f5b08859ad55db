//! Latest-still generation for late consumers.
//!
//! The generator keeps one displayable still per source:
//!
//! - **H.264 / H.265**: a self-contained single-frame MP4 (`ftyp`, `moov`,
//!   `mdat`) built from a copy of the keyframe and the cached parameter sets.
//!   The sample size is known up front, so no placeholder is reserved.
//! - **MJPEG**: the device's JPEG bytes, unchanged.
//!
//! All state sits behind the generator's own mutex. Nothing here touches the
//! streaming muxer or its file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::Result;
use crate::media::params::ParameterSets;
use crate::media::{AccessUnit, VideoCodec};
use crate::mp4::boxes::{self, BOX_HEADER_SIZE, Sample, TrackInfo};

/// Accepted auto-save interval range, in seconds.
pub const MIN_SAVE_INTERVAL_SECS: u64 = 1;
pub const MAX_SAVE_INTERVAL_SECS: u64 = 60;

/// Snapshot settings.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Directory for auto-saved stills; `None` keeps them in memory only.
    pub dir: Option<PathBuf>,
    /// Requested auto-save interval. Clamped to 1..=60 s.
    pub save_interval_secs: u64,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: None,
            save_interval_secs: 5,
            width: 1920,
            height: 1080,
            fps: 30,
        }
    }
}

/// Encoding of a stored still.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    Mp4,
    Jpeg,
}

impl SnapshotFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Jpeg => "jpg",
        }
    }
}

/// One stored still.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub format: SnapshotFormat,
    pub data: Bytes,
    /// Monotonic update counter, starting at 1.
    pub sequence: u64,
}

#[derive(Default)]
struct State {
    latest: Option<Snapshot>,
    sequence: u64,
    last_saved_sequence: u64,
    last_saved_at: Option<Instant>,
}

/// Builds and stores the most recent still of a source.
pub struct SnapshotGenerator {
    dir: Option<PathBuf>,
    save_interval: Duration,
    width: u32,
    height: u32,
    fps: u32,
    state: Mutex<State>,
}

impl SnapshotGenerator {
    pub fn new(config: SnapshotConfig) -> Self {
        let secs = clamp_save_interval(config.save_interval_secs);
        tracing::debug!(dir = ?config.dir, interval_secs = secs, "snapshot generator created");
        Self {
            dir: config.dir,
            save_interval: Duration::from_secs(secs),
            width: config.width,
            height: config.height,
            fps: config.fps,
            state: Mutex::new(State::default()),
        }
    }

    /// Effective auto-save interval after clamping.
    pub fn save_interval(&self) -> Duration {
        self.save_interval
    }

    /// Replace the still with a single-frame MP4 of `access_unit`.
    pub fn update_keyframe(
        &self,
        codec: VideoCodec,
        params: &ParameterSets,
        access_unit: &AccessUnit,
    ) -> Result<()> {
        let track = TrackInfo {
            codec,
            params: params.clone(),
            width: self.width,
            height: self.height,
            fps: self.fps,
        };
        let mp4 = build_still_mp4(&track, access_unit)?;
        tracing::trace!(bytes = mp4.len(), ?codec, "snapshot updated");
        self.store(SnapshotFormat::Mp4, Bytes::from(mp4));
        Ok(())
    }

    /// Replace the still with a JPEG image as delivered by the device.
    pub fn update_jpeg(&self, jpeg: &[u8]) {
        tracing::trace!(bytes = jpeg.len(), "jpeg snapshot updated");
        self.store(SnapshotFormat::Jpeg, Bytes::copy_from_slice(jpeg));
    }

    fn store(&self, format: SnapshotFormat, data: Bytes) {
        let mut state = self.state.lock();
        state.sequence += 1;
        let sequence = state.sequence;
        state.latest = Some(Snapshot {
            format,
            data,
            sequence,
        });
    }

    /// The current still, if any keyframe or image has been seen.
    pub fn latest(&self) -> Option<Snapshot> {
        self.state.lock().latest.clone()
    }

    /// Write the current still to `<dir>/snapshot.<ext>` if the interval has
    /// elapsed since the last save and a newer still exists.
    ///
    /// Returns the written path, or `None` when nothing was due.
    pub fn save_if_due(&self) -> Result<Option<PathBuf>> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };

        // decide and claim under the lock; write outside it
        let (snapshot, previous) = {
            let mut state = self.state.lock();
            let Some(latest) = &state.latest else {
                return Ok(None);
            };
            if latest.sequence == state.last_saved_sequence {
                return Ok(None);
            }
            if state
                .last_saved_at
                .is_some_and(|at| at.elapsed() < self.save_interval)
            {
                return Ok(None);
            }
            let snapshot = latest.clone();
            let previous = (state.last_saved_sequence, state.last_saved_at);
            state.last_saved_sequence = snapshot.sequence;
            state.last_saved_at = Some(Instant::now());
            (snapshot, previous)
        };

        let path = dir.join(format!("snapshot.{}", snapshot.format.extension()));
        if let Err(e) = write_atomic(&path, &snapshot.data) {
            // release the claim so the next call retries this still
            let mut state = self.state.lock();
            if state.last_saved_sequence == snapshot.sequence {
                state.last_saved_sequence = previous.0;
                state.last_saved_at = previous.1;
            }
            return Err(e);
        }
        tracing::debug!(path = %path.display(), bytes = snapshot.data.len(), "snapshot saved");
        Ok(Some(path))
    }
}

/// Clamp a requested auto-save interval into 1..=60 seconds.
pub fn clamp_save_interval(secs: u64) -> u64 {
    let clamped = secs.clamp(MIN_SAVE_INTERVAL_SECS, MAX_SAVE_INTERVAL_SECS);
    if clamped != secs {
        tracing::warn!(
            requested = secs,
            effective = clamped,
            "snapshot save interval out of range, clamped"
        );
    }
    clamped
}

/// Build `ftyp` + `moov` + `mdat` holding exactly one sample.
pub fn build_still_mp4(track: &TrackInfo, access_unit: &AccessUnit) -> Result<Vec<u8>> {
    track.validate()?;
    let payload = access_unit.to_length_prefixed();
    let ftyp = boxes::ftyp();

    // stco width does not depend on the offset value, so the first build
    // fixes the moov length
    let mut sample = Sample {
        offset: 0,
        size: payload.len() as u32,
        is_keyframe: true,
    };
    let probe = boxes::build_moov(track, &[sample])?;
    sample.offset = (ftyp.len() + probe.len() + BOX_HEADER_SIZE) as u64;
    let moov = boxes::build_moov(track, &[sample])?;

    let mdat_size = BOX_HEADER_SIZE + payload.len();
    let mut out = Vec::with_capacity(ftyp.len() + moov.len() + mdat_size);
    out.extend_from_slice(&ftyp);
    out.extend_from_slice(&moov);
    out.extend_from_slice(&boxes::mdat_header(mdat_size as u32));
    out.extend_from_slice(&payload);
    Ok(out)
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mp4::boxes::find_box;

    const SPS: &[u8] = &[0x67, 0x64, 0x00, 0x28, 0xAC, 0xD9];
    const PPS: &[u8] = &[0x68, 0xEE, 0x3C, 0x80];
    const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x21, 0xA0];

    fn be32(b: &[u8]) -> u32 {
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    fn keyframe() -> AccessUnit {
        AccessUnit::new(vec![Bytes::from_static(IDR)], true)
    }

    #[test]
    fn save_interval_is_clamped() {
        assert_eq!(clamp_save_interval(0), 1);
        assert_eq!(clamp_save_interval(120), 60);
        assert_eq!(clamp_save_interval(15), 15);

        let generator = SnapshotGenerator::new(SnapshotConfig {
            save_interval_secs: 0,
            ..Default::default()
        });
        assert_eq!(generator.save_interval(), Duration::from_secs(1));
    }

    #[test]
    fn still_mp4_is_self_contained() {
        let generator = SnapshotGenerator::new(SnapshotConfig::default());
        let params = ParameterSets::h264(SPS, PPS);
        generator
            .update_keyframe(VideoCodec::H264, &params, &keyframe())
            .unwrap();

        let still = generator.latest().unwrap();
        assert_eq!(still.format, SnapshotFormat::Mp4);
        let data = &still.data[..];

        assert_eq!(&data[4..8], b"ftyp");
        let moov = find_box(data, b"moov").unwrap();
        let mdat = find_box(data, b"mdat").unwrap();
        assert_eq!(mdat.end, data.len(), "mdat is sized exactly");
        assert_eq!(&data[mdat.start..mdat.start + 4], &(IDR.len() as u32).to_be_bytes());

        // stco points at the sample inside mdat
        let stbl = ["trak", "mdia", "minf", "stbl"]
            .iter()
            .fold(&data[moov], |cur, name| {
                let fourcc: &[u8; 4] = name.as_bytes().try_into().unwrap();
                &cur[find_box(cur, fourcc).unwrap()]
            });
        let stco = &stbl[find_box(stbl, b"stco").unwrap()];
        assert_eq!(be32(&stco[8..]) as usize, mdat.start);
    }

    #[test]
    fn incomplete_parameter_sets_leave_previous_still() {
        let generator = SnapshotGenerator::new(SnapshotConfig::default());
        let mut params = ParameterSets::h264(SPS, PPS);
        params.pps = None;
        assert!(generator
            .update_keyframe(VideoCodec::H264, &params, &keyframe())
            .is_err());
        assert!(generator.latest().is_none());
    }

    #[test]
    fn jpeg_passes_through() {
        let generator = SnapshotGenerator::new(SnapshotConfig::default());
        let jpeg = [0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9];
        generator.update_jpeg(&jpeg);
        let still = generator.latest().unwrap();
        assert_eq!(still.format, SnapshotFormat::Jpeg);
        assert_eq!(&still.data[..], &jpeg);
    }

    #[test]
    fn save_is_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let generator = SnapshotGenerator::new(SnapshotConfig {
            dir: Some(dir.path().to_path_buf()),
            save_interval_secs: 60,
            ..Default::default()
        });
        assert_eq!(generator.save_if_due().unwrap(), None, "nothing stored yet");

        generator.update_jpeg(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let path = generator.save_if_due().unwrap().unwrap();
        assert_eq!(path, dir.path().join("snapshot.jpg"));
        assert_eq!(fs::read(&path).unwrap(), vec![0xFF, 0xD8, 0xFF, 0xD9]);

        generator.update_jpeg(&[0xFF, 0xD8, 0x00, 0xFF, 0xD9]);
        assert_eq!(generator.save_if_due().unwrap(), None, "interval not elapsed");
    }

    #[test]
    fn failed_save_is_retried() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("stills");
        let generator = SnapshotGenerator::new(SnapshotConfig {
            dir: Some(dir.clone()),
            save_interval_secs: 60,
            ..Default::default()
        });
        generator.update_jpeg(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert!(generator.save_if_due().is_err(), "directory does not exist yet");

        fs::create_dir(&dir).unwrap();
        let path = generator.save_if_due().unwrap().unwrap();
        assert_eq!(fs::read(path).unwrap(), vec![0xFF, 0xD8, 0xFF, 0xD9]);
    }
}
