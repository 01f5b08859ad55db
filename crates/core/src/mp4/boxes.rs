//! ISO-BMFF box builders for a single video track.
//!
//! ```text
//! ftyp
//! moov
//! ├── mvhd
//! └── trak
//!     ├── tkhd
//!     └── mdia
//!         ├── mdhd
//!         ├── hdlr
//!         └── minf
//!             ├── vmhd
//!             ├── dinf → dref → url
//!             └── stbl
//!                 ├── stsd (avc1 + avcC | hvc1 + hvcC)
//!                 ├── stts
//!                 ├── stsc
//!                 ├── stsz
//!                 ├── stco / co64
//!                 └── stss
//! mdat
//! ```
//!
//! Timing is constant frame rate: the media timescale is `fps * 1000` and
//! every sample lasts 1000 ticks.

use crate::error::{MediaError, Result};
use crate::media::codec::VideoCodec;
use crate::media::params::ParameterSets;
use crate::media::{h264, h265};

/// Bytes reserved for `moov` in front of a streaming `mdat`.
pub const MOOV_PLACEHOLDER_SIZE: usize = 16 * 1024;

/// Ticks per sample in the media timescale.
pub const SAMPLE_DELTA: u32 = 1000;

/// Size of a box header without `largesize`.
pub const BOX_HEADER_SIZE: usize = 8;

const UNITY_MATRIX: [u8; 36] = [
    0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00,
];

/// Video track description used to build `moov`.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub codec: VideoCodec,
    pub params: ParameterSets,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl TrackInfo {
    /// Media and movie timescale.
    pub fn timescale(&self) -> u32 {
        self.fps.saturating_mul(SAMPLE_DELTA)
    }

    /// Reject tracks a player could not decode.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(MediaError::InvalidTrack(format!(
                "dimensions must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.width > u16::MAX as u32 || self.height > u16::MAX as u32 {
            return Err(MediaError::InvalidTrack(format!(
                "dimensions {}x{} exceed 16 bits",
                self.width, self.height
            )));
        }
        if self.fps == 0 {
            return Err(MediaError::InvalidTrack("fps must be positive".into()));
        }
        if let Some(kind) = self.params.missing(self.codec) {
            return Err(MediaError::MissingParameterSet(kind));
        }
        Ok(())
    }
}

/// One recorded sample: file-absolute offset, size including length
/// prefixes, sync flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub offset: u64,
    pub size: u32,
    pub is_keyframe: bool,
}

/// Append a box header to `buf`.
pub fn write_box_header(buf: &mut Vec<u8>, size: u32, fourcc: &[u8; 4]) {
    buf.extend_from_slice(&size.to_be_bytes());
    buf.extend_from_slice(fourcc);
}

/// Wrap `payload` in a box.
pub fn build_box(fourcc: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(BOX_HEADER_SIZE + payload.len());
    write_box_header(&mut buf, (BOX_HEADER_SIZE + payload.len()) as u32, fourcc);
    buf.extend_from_slice(payload);
    buf
}

/// Wrap `payload` in a full box (version + 24-bit flags).
fn build_full_box(fourcc: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(4 + payload.len());
    inner.push(version);
    inner.extend_from_slice(&flags.to_be_bytes()[1..]);
    inner.extend_from_slice(payload);
    build_box(fourcc, &inner)
}

/// `ftyp`: major brand `isom`, minor version 0x200, compatible
/// `isom`, `iso2`, `avc1`, `mp41`.
pub fn ftyp() -> Vec<u8> {
    let mut payload = Vec::with_capacity(24);
    payload.extend_from_slice(b"isom");
    payload.extend_from_slice(&0x200u32.to_be_bytes());
    for brand in [b"isom", b"iso2", b"avc1", b"mp41"] {
        payload.extend_from_slice(brand);
    }
    build_box(b"ftyp", &payload)
}

/// A `free` box spanning exactly `size` bytes (header included).
pub fn free_box(size: usize) -> Vec<u8> {
    debug_assert!(size >= BOX_HEADER_SIZE);
    let mut buf = vec![0u8; size];
    buf[..4].copy_from_slice(&(size as u32).to_be_bytes());
    buf[4..8].copy_from_slice(b"free");
    buf
}

/// `mdat` header with the given total size.
pub fn mdat_header(size: u32) -> [u8; 8] {
    let mut header = [0u8; 8];
    header[..4].copy_from_slice(&size.to_be_bytes());
    header[4..].copy_from_slice(b"mdat");
    header
}

/// Build the complete `moov` box for `track` and its recorded samples.
pub fn build_moov(track: &TrackInfo, samples: &[Sample]) -> Result<Vec<u8>> {
    let duration = samples.len() as u64 * SAMPLE_DELTA as u64;
    let duration = duration.min(u32::MAX as u64) as u32;

    let mut inner = build_mvhd(track.timescale(), duration);
    inner.extend_from_slice(&build_trak(track, samples, duration)?);
    Ok(build_box(b"moov", &inner))
}

fn build_mvhd(timescale: u32, duration: u32) -> Vec<u8> {
    let mut p = Vec::with_capacity(96);
    p.extend_from_slice(&[0; 8]); // creation + modification time
    p.extend_from_slice(&timescale.to_be_bytes());
    p.extend_from_slice(&duration.to_be_bytes());
    p.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate 1.0
    p.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
    p.extend_from_slice(&[0; 10]);
    p.extend_from_slice(&UNITY_MATRIX);
    p.extend_from_slice(&[0; 24]); // pre_defined
    p.extend_from_slice(&2u32.to_be_bytes()); // next_track_ID
    build_full_box(b"mvhd", 0, 0, &p)
}

fn build_trak(track: &TrackInfo, samples: &[Sample], duration: u32) -> Result<Vec<u8>> {
    let mut inner = build_tkhd(track, duration);
    inner.extend_from_slice(&build_mdia(track, samples, duration)?);
    Ok(build_box(b"trak", &inner))
}

fn build_tkhd(track: &TrackInfo, duration: u32) -> Vec<u8> {
    let mut p = Vec::with_capacity(80);
    p.extend_from_slice(&[0; 8]); // creation + modification time
    p.extend_from_slice(&1u32.to_be_bytes()); // track_ID
    p.extend_from_slice(&[0; 4]);
    p.extend_from_slice(&duration.to_be_bytes());
    p.extend_from_slice(&[0; 8]);
    p.extend_from_slice(&[0; 4]); // layer + alternate_group
    p.extend_from_slice(&[0; 2]); // volume: 0 for video
    p.extend_from_slice(&[0; 2]);
    p.extend_from_slice(&UNITY_MATRIX);
    p.extend_from_slice(&(track.width << 16).to_be_bytes());
    p.extend_from_slice(&(track.height << 16).to_be_bytes());
    // track_enabled | track_in_movie
    build_full_box(b"tkhd", 0, 0x03, &p)
}

fn build_mdia(track: &TrackInfo, samples: &[Sample], duration: u32) -> Result<Vec<u8>> {
    let mut inner = build_mdhd(track.timescale(), duration);
    inner.extend_from_slice(&build_hdlr());
    inner.extend_from_slice(&build_minf(track, samples)?);
    Ok(build_box(b"mdia", &inner))
}

fn build_mdhd(timescale: u32, duration: u32) -> Vec<u8> {
    let mut p = Vec::with_capacity(20);
    p.extend_from_slice(&[0; 8]);
    p.extend_from_slice(&timescale.to_be_bytes());
    p.extend_from_slice(&duration.to_be_bytes());
    p.extend_from_slice(&0x55C4u16.to_be_bytes()); // language 'und'
    p.extend_from_slice(&[0; 2]);
    build_full_box(b"mdhd", 0, 0, &p)
}

fn build_hdlr() -> Vec<u8> {
    let mut p = Vec::with_capacity(32);
    p.extend_from_slice(&[0; 4]); // pre_defined
    p.extend_from_slice(b"vide");
    p.extend_from_slice(&[0; 12]);
    p.extend_from_slice(b"VideoHandler\0");
    build_full_box(b"hdlr", 0, 0, &p)
}

fn build_minf(track: &TrackInfo, samples: &[Sample]) -> Result<Vec<u8>> {
    // graphicsmode + opcolor
    let mut inner = build_full_box(b"vmhd", 0, 1, &[0; 8]);

    let url = build_full_box(b"url ", 0, 1, &[]);
    let mut dref = 1u32.to_be_bytes().to_vec();
    dref.extend_from_slice(&url);
    inner.extend_from_slice(&build_box(b"dinf", &build_full_box(b"dref", 0, 0, &dref)));

    inner.extend_from_slice(&build_stbl(track, samples)?);
    Ok(build_box(b"minf", &inner))
}

fn build_stbl(track: &TrackInfo, samples: &[Sample]) -> Result<Vec<u8>> {
    let chunks = group_chunks(samples);

    let mut inner = build_stsd(track)?;
    inner.extend_from_slice(&build_stts(samples.len() as u32));
    inner.extend_from_slice(&build_stsc(&chunks));
    inner.extend_from_slice(&build_stsz(samples));
    inner.extend_from_slice(&build_chunk_offsets(&chunks));
    inner.extend_from_slice(&build_stss(samples));
    Ok(build_box(b"stbl", &inner))
}

fn build_stsd(track: &TrackInfo) -> Result<Vec<u8>> {
    let (fourcc, config_fourcc, config) = match track.codec {
        VideoCodec::H264 => (b"avc1", b"avcC", h264::avc_decoder_config(&track.params)?),
        VideoCodec::H265 => (b"hvc1", b"hvcC", h265::hevc_decoder_config(&track.params)?),
    };

    let mut entry = Vec::with_capacity(78 + 8 + config.len());
    entry.extend_from_slice(&[0; 6]);
    entry.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
    entry.extend_from_slice(&[0; 16]); // pre_defined + reserved
    entry.extend_from_slice(&(track.width as u16).to_be_bytes());
    entry.extend_from_slice(&(track.height as u16).to_be_bytes());
    entry.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // 72 dpi
    entry.extend_from_slice(&0x0048_0000u32.to_be_bytes());
    entry.extend_from_slice(&[0; 4]);
    entry.extend_from_slice(&1u16.to_be_bytes()); // frame_count
    entry.extend_from_slice(&[0; 32]); // compressorname
    entry.extend_from_slice(&0x0018u16.to_be_bytes()); // depth
    entry.extend_from_slice(&0xFFFFu16.to_be_bytes()); // pre_defined = -1
    entry.extend_from_slice(&build_box(config_fourcc, &config));

    let mut p = 1u32.to_be_bytes().to_vec();
    p.extend_from_slice(&build_box(fourcc, &entry));
    Ok(build_full_box(b"stsd", 0, 0, &p))
}

fn build_stts(sample_count: u32) -> Vec<u8> {
    let mut p = Vec::with_capacity(12);
    if sample_count == 0 {
        p.extend_from_slice(&0u32.to_be_bytes());
    } else {
        p.extend_from_slice(&1u32.to_be_bytes());
        p.extend_from_slice(&sample_count.to_be_bytes());
        p.extend_from_slice(&SAMPLE_DELTA.to_be_bytes());
    }
    build_full_box(b"stts", 0, 0, &p)
}

/// Contiguous run of samples in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Chunk {
    offset: u64,
    samples: u32,
}

fn group_chunks(samples: &[Sample]) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut next_offset = None;
    for sample in samples {
        match chunks.last_mut() {
            Some(chunk) if next_offset == Some(sample.offset) => chunk.samples += 1,
            _ => chunks.push(Chunk {
                offset: sample.offset,
                samples: 1,
            }),
        }
        next_offset = Some(sample.offset + sample.size as u64);
    }
    chunks
}

fn build_stsc(chunks: &[Chunk]) -> Vec<u8> {
    // (first_chunk, samples_per_chunk), run-length encoded
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for (i, chunk) in chunks.iter().enumerate() {
        if runs.last().map(|&(_, n)| n) != Some(chunk.samples) {
            runs.push((i as u32 + 1, chunk.samples));
        }
    }

    let mut p = Vec::with_capacity(4 + runs.len() * 12);
    p.extend_from_slice(&(runs.len() as u32).to_be_bytes());
    for (first_chunk, samples_per_chunk) in runs {
        p.extend_from_slice(&first_chunk.to_be_bytes());
        p.extend_from_slice(&samples_per_chunk.to_be_bytes());
        p.extend_from_slice(&1u32.to_be_bytes()); // sample_description_index
    }
    build_full_box(b"stsc", 0, 0, &p)
}

fn build_stsz(samples: &[Sample]) -> Vec<u8> {
    let mut p = Vec::with_capacity(8 + samples.len() * 4);
    p.extend_from_slice(&0u32.to_be_bytes()); // sample_size: per-sample table follows
    p.extend_from_slice(&(samples.len() as u32).to_be_bytes());
    for sample in samples {
        p.extend_from_slice(&sample.size.to_be_bytes());
    }
    build_full_box(b"stsz", 0, 0, &p)
}

fn build_chunk_offsets(chunks: &[Chunk]) -> Vec<u8> {
    let wide = chunks.iter().any(|c| c.offset > u32::MAX as u64);
    let mut p = Vec::with_capacity(4 + chunks.len() * if wide { 8 } else { 4 });
    p.extend_from_slice(&(chunks.len() as u32).to_be_bytes());
    for chunk in chunks {
        if wide {
            p.extend_from_slice(&chunk.offset.to_be_bytes());
        } else {
            p.extend_from_slice(&(chunk.offset as u32).to_be_bytes());
        }
    }
    build_full_box(if wide { b"co64" } else { b"stco" }, 0, 0, &p)
}

fn build_stss(samples: &[Sample]) -> Vec<u8> {
    let sync: Vec<u32> = samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_keyframe)
        .map(|(i, _)| i as u32 + 1)
        .collect();

    let mut p = Vec::with_capacity(4 + sync.len() * 4);
    p.extend_from_slice(&(sync.len() as u32).to_be_bytes());
    for index in sync {
        p.extend_from_slice(&index.to_be_bytes());
    }
    build_full_box(b"stss", 0, 0, &p)
}

/// Locate the first direct child box `fourcc` inside `data` (a sequence of
/// boxes). Returns the child's payload range.
pub fn find_box(data: &[u8], fourcc: &[u8; 4]) -> Option<std::ops::Range<usize>> {
    let mut pos = 0usize;
    while pos + BOX_HEADER_SIZE <= data.len() {
        let size =
            u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        if size < BOX_HEADER_SIZE || pos + size > data.len() {
            return None;
        }
        if &data[pos + 4..pos + 8] == fourcc {
            return Some(pos + BOX_HEADER_SIZE..pos + size);
        }
        pos += size;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track() -> TrackInfo {
        TrackInfo {
            codec: VideoCodec::H264,
            params: ParameterSets::h264(
                vec![0x67, 0x64, 0x00, 0x28, 0xAC, 0xD9],
                vec![0x68, 0xEE, 0x3C, 0x80],
            ),
            width: 1920,
            height: 1080,
            fps: 30,
        }
    }

    /// Walk a path of nested boxes, returning the payload of the last one.
    fn descend<'a>(data: &'a [u8], path: &[&[u8; 4]]) -> &'a [u8] {
        let mut cur = data;
        for fourcc in path {
            let range = find_box(cur, fourcc).unwrap_or_else(|| {
                panic!("missing box {}", String::from_utf8_lossy(*fourcc))
            });
            cur = &cur[range];
        }
        cur
    }

    fn be32(b: &[u8]) -> u32 {
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    #[test]
    fn ftyp_brands() {
        let f = ftyp();
        assert_eq!(f.len(), 32);
        assert_eq!(be32(&f), 32);
        assert_eq!(&f[4..8], b"ftyp");
        assert_eq!(&f[8..12], b"isom");
        assert_eq!(be32(&f[12..]), 0x200);
        assert_eq!(&f[16..], b"isomiso2avc1mp41");
    }

    #[test]
    fn free_box_spans_exact_size() {
        let free = free_box(MOOV_PLACEHOLDER_SIZE);
        assert_eq!(free.len(), MOOV_PLACEHOLDER_SIZE);
        assert_eq!(be32(&free) as usize, MOOV_PLACEHOLDER_SIZE);
        assert_eq!(&free[4..8], b"free");
    }

    #[test]
    fn moov_timing_uses_fps_timescale() {
        let samples = [
            Sample { offset: 100, size: 10, is_keyframe: true },
            Sample { offset: 110, size: 20, is_keyframe: false },
            Sample { offset: 130, size: 30, is_keyframe: false },
        ];
        let moov = build_moov(&track(), &samples).unwrap();
        assert_eq!(be32(&moov) as usize, moov.len());

        let mvhd = descend(&moov, &[b"moov", b"mvhd"]);
        assert_eq!(be32(&mvhd[12..]), 30_000, "timescale");
        assert_eq!(be32(&mvhd[16..]), 3_000, "duration");

        let tkhd = descend(&moov, &[b"moov", b"trak", b"tkhd"]);
        assert_eq!(be32(&tkhd[76..]), 1920 << 16);
        assert_eq!(be32(&tkhd[80..]), 1080 << 16);
    }

    #[test]
    fn sample_tables_describe_every_frame() {
        let samples = [
            Sample { offset: 100, size: 10, is_keyframe: true },
            Sample { offset: 110, size: 20, is_keyframe: false },
            Sample { offset: 130, size: 30, is_keyframe: true },
        ];
        let moov = build_moov(&track(), &samples).unwrap();
        let stbl = descend(&moov, &[b"moov", b"trak", b"mdia", b"minf", b"stbl"]);

        let stsz = descend(stbl, &[b"stsz"]);
        assert_eq!(be32(&stsz[8..]), 3);
        assert_eq!(be32(&stsz[12..]), 10);
        assert_eq!(be32(&stsz[20..]), 30);

        let stco = descend(stbl, &[b"stco"]);
        assert_eq!(be32(&stco[4..]), 1, "contiguous samples form one chunk");
        assert_eq!(be32(&stco[8..]), 100);

        let stsc = descend(stbl, &[b"stsc"]);
        assert_eq!(be32(&stsc[4..]), 1);
        assert_eq!(be32(&stsc[12..]), 3);

        let stss = descend(stbl, &[b"stss"]);
        assert_eq!(be32(&stss[4..]), 2);
        assert_eq!(be32(&stss[8..]), 1);
        assert_eq!(be32(&stss[12..]), 3);

        let stts = descend(stbl, &[b"stts"]);
        assert_eq!(be32(&stts[8..]), 3);
        assert_eq!(be32(&stts[12..]), SAMPLE_DELTA);

        let stsd = descend(stbl, &[b"stsd"]);
        let avc1 = descend(&stsd[8..], &[b"avc1"]);
        let avcc = descend(&avc1[78..], &[b"avcC"]);
        assert_eq!(avcc[1], 0x64);
    }

    #[test]
    fn gaps_split_chunks() {
        let samples = [
            Sample { offset: 100, size: 10, is_keyframe: true },
            Sample { offset: 200, size: 10, is_keyframe: false },
            Sample { offset: 210, size: 10, is_keyframe: false },
        ];
        let chunks = group_chunks(&samples);
        assert_eq!(
            chunks,
            vec![
                Chunk { offset: 100, samples: 1 },
                Chunk { offset: 200, samples: 2 },
            ]
        );
    }

    #[test]
    fn invalid_tracks_rejected() {
        let mut t = track();
        t.fps = 0;
        assert!(matches!(t.validate(), Err(MediaError::InvalidTrack(_))));

        let mut t = track();
        t.width = 0;
        assert!(matches!(t.validate(), Err(MediaError::InvalidTrack(_))));

        let mut t = track();
        t.params.pps = None;
        assert!(matches!(t.validate(), Err(MediaError::MissingParameterSet(_))));

        assert!(track().validate().is_ok());
    }
}
