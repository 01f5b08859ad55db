//! Codec-specific NAL classification.
//!
//! The frame splitter is shared between H.264 and H.265; only the way a NAL
//! header byte maps to a [`NalKind`] differs. [`VideoCodec`] is that strategy,
//! selected once when the splitter is built.
//!
//! | Codec | Type extraction | VPS | SPS | PPS | IDR |
//! |-------|-----------------|-----|-----|-----|-----|
//! | H.264 | `byte & 0x1F` | – | 7 | 8 | 5 |
//! | H.265 | `(byte & 0x7E) >> 1` | 32 | 33 | 34 | 19, 20 |

use crate::error::ParameterSetKind;

/// H.264 NAL unit types used by the splitter (ITU-T H.264 Table 7-1).
pub mod h264_types {
    pub const NON_IDR: u8 = 1;
    pub const IDR: u8 = 5;
    pub const SEI: u8 = 6;
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
    pub const AUD: u8 = 9;
}

/// H.265 NAL unit types used by the splitter (ITU-T H.265 Table 7-1).
pub mod h265_types {
    pub const IDR_W_RADL: u8 = 19;
    pub const IDR_N_LP: u8 = 20;
    pub const VPS: u8 = 32;
    pub const SPS: u8 = 33;
    pub const PPS: u8 = 34;
    pub const AUD: u8 = 35;
    pub const PREFIX_SEI: u8 = 39;
    pub const SUFFIX_SEI: u8 = 40;
}

/// Coarse role of a NAL unit in the capture pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalKind {
    /// VPS / SPS / PPS: cached, never stored as MP4 sample data.
    ParameterSet(ParameterSetKind),
    /// Instantaneous decoder refresh slice; marks the access unit as key.
    Idr,
    /// Any other slice.
    Slice,
    /// SEI, AUD and everything else the splitter passes through.
    Other,
}

/// Elementary stream codec carried by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    /// NAL unit type from the first header byte.
    pub fn nal_type(self, header: u8) -> u8 {
        match self {
            Self::H264 => header & 0x1F,
            Self::H265 => (header & 0x7E) >> 1,
        }
    }

    /// Classify a NAL unit from its first header byte.
    pub fn classify(self, header: u8) -> NalKind {
        let nal_type = self.nal_type(header);
        match self {
            Self::H264 => match nal_type {
                h264_types::SPS => NalKind::ParameterSet(ParameterSetKind::Sps),
                h264_types::PPS => NalKind::ParameterSet(ParameterSetKind::Pps),
                h264_types::IDR => NalKind::Idr,
                1..=4 => NalKind::Slice,
                _ => NalKind::Other,
            },
            Self::H265 => match nal_type {
                h265_types::VPS => NalKind::ParameterSet(ParameterSetKind::Vps),
                h265_types::SPS => NalKind::ParameterSet(ParameterSetKind::Sps),
                h265_types::PPS => NalKind::ParameterSet(ParameterSetKind::Pps),
                h265_types::IDR_W_RADL | h265_types::IDR_N_LP => NalKind::Idr,
                0..=31 => NalKind::Slice,
                _ => NalKind::Other,
            },
        }
    }

    /// Whether the unit carries slice data.
    pub fn is_vcl(self, header: u8) -> bool {
        matches!(self.classify(header), NalKind::Idr | NalKind::Slice)
    }

    /// Whether a slice NAL (header included) starts a new picture.
    ///
    /// H.264: `first_mb_in_slice` is `ue(v)`, so a value of 0 is a single
    /// leading `1` bit. H.265: `first_slice_segment_in_pic_flag` is the first
    /// bit after the two-byte header.
    pub fn is_first_slice(self, nal: &[u8]) -> bool {
        let index = match self {
            Self::H264 => 1,
            Self::H265 => 2,
        };
        nal.get(index).is_some_and(|b| b & 0x80 != 0)
    }

    /// Parameter sets that must all be cached before re-injection, aux
    /// lines or MP4 initialization.
    pub fn required_parameter_sets(self) -> &'static [ParameterSetKind] {
        match self {
            Self::H264 => &[ParameterSetKind::Sps, ParameterSetKind::Pps],
            Self::H265 => &[
                ParameterSetKind::Vps,
                ParameterSetKind::Sps,
                ParameterSetKind::Pps,
            ],
        }
    }

    /// Encoding name for the SDP `a=rtpmap` attribute.
    pub fn encoding_name(self) -> &'static str {
        match self {
            Self::H264 => "H264",
            Self::H265 => "H265",
        }
    }

    /// File extension for raw elementary stream output.
    pub fn raw_extension(self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::H265 => "h265",
        }
    }
}
