//! H.265 (HEVC) specifics.
//!
//! Key differences from H.264:
//!
//! - **2-byte NAL unit header**. The NAL type is in bits 1..6 of the first
//!   byte (see [`VideoCodec::nal_type`](super::codec::VideoCodec::nal_type)).
//! - **Three parameter sets**: VPS, SPS and PPS are all required.
//! - **SDP parameters** (RFC 7798 §7.1):
//!   ```text
//!   sprop-vps=<base64>;sprop-sps=<base64>;sprop-pps=<base64>
//!   ```

use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::codec::h265_types;
use super::nal::strip_emulation_prevention;
use super::params::ParameterSets;
use crate::error::{MediaError, ParameterSetKind, Result};

/// Full H.265 aux line for the SDP `a=fmtp` attribute.
pub fn aux_line(params: &ParameterSets) -> Result<String> {
    let vps = params.require(ParameterSetKind::Vps)?;
    let sps = params.require(ParameterSetKind::Sps)?;
    let pps = params.require(ParameterSetKind::Pps)?;
    Ok(format!(
        "sprop-vps={};sprop-sps={};sprop-pps={}",
        BASE64_STANDARD.encode(vps),
        BASE64_STANDARD.encode(sps),
        BASE64_STANDARD.encode(pps)
    ))
}

/// General profile/tier/level fields read from an SPS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileTierLevel {
    /// `general_profile_space`, `general_tier_flag` and `general_profile_idc`,
    /// packed as in the bitstream.
    pub profile_byte: u8,
    pub compatibility_flags: [u8; 4],
    pub constraint_flags: [u8; 6],
    pub level_idc: u8,
    pub temporal_layers: u8,
    pub temporal_id_nested: bool,
}

/// Offset of `general_level_idc` in the SPS RBSP (2-byte NAL header,
/// 1 byte of ids, 11 bytes of profile fields).
const SPS_LEVEL_OFFSET: usize = 14;

impl ProfileTierLevel {
    /// Parse the fixed-position general profile fields of an SPS NAL.
    pub fn from_sps(sps: &[u8]) -> Result<Self> {
        let rbsp = strip_emulation_prevention(sps);
        if rbsp.len() <= SPS_LEVEL_OFFSET {
            return Err(MediaError::SpsTooShort(sps.len()));
        }
        let ids = rbsp[2];
        let mut compatibility_flags = [0u8; 4];
        compatibility_flags.copy_from_slice(&rbsp[4..8]);
        let mut constraint_flags = [0u8; 6];
        constraint_flags.copy_from_slice(&rbsp[8..14]);
        Ok(Self {
            profile_byte: rbsp[3],
            compatibility_flags,
            constraint_flags,
            level_idc: rbsp[SPS_LEVEL_OFFSET],
            temporal_layers: ((ids >> 1) & 0x07) + 1,
            temporal_id_nested: ids & 0x01 == 1,
        })
    }
}

/// Build an `HEVCDecoderConfigurationRecord` (ISO/IEC 14496-15 §8.3.3.1)
/// holding one VPS, SPS and PPS with 4-byte NAL length fields.
pub fn hevc_decoder_config(params: &ParameterSets) -> Result<Vec<u8>> {
    let vps = params.require(ParameterSetKind::Vps)?;
    let sps = params.require(ParameterSetKind::Sps)?;
    let pps = params.require(ParameterSetKind::Pps)?;
    let ptl = ProfileTierLevel::from_sps(sps)?;

    let mut record = Vec::with_capacity(23 + 3 * 5 + vps.len() + sps.len() + pps.len());
    record.push(1); // configurationVersion
    record.push(ptl.profile_byte);
    record.extend_from_slice(&ptl.compatibility_flags);
    record.extend_from_slice(&ptl.constraint_flags);
    record.push(ptl.level_idc);
    record.extend_from_slice(&[0xF0, 0x00]); // min_spatial_segmentation_idc
    record.push(0xFC); // parallelismType
    record.push(0xFD); // chroma_format_idc = 4:2:0
    record.push(0xF8); // bit_depth_luma_minus8
    record.push(0xF8); // bit_depth_chroma_minus8
    record.extend_from_slice(&0u16.to_be_bytes()); // avgFrameRate
    record.push((ptl.temporal_layers << 3) | ((ptl.temporal_id_nested as u8) << 2) | 0x03);
    record.push(3); // numOfArrays

    for (nal_type, nal) in [
        (h265_types::VPS, vps),
        (h265_types::SPS, sps),
        (h265_types::PPS, pps),
    ] {
        record.push(0x80 | nal_type); // array_completeness + NAL_unit_type
        record.extend_from_slice(&1u16.to_be_bytes());
        record.extend_from_slice(&(nal.len() as u16).to_be_bytes());
        record.extend_from_slice(nal);
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Main profile, level 3.1, one sub-layer; constraint flags carry an
    // emulation prevention byte.
    const SPS: [u8; 18] = [
        0x42, 0x01, 0x01, 0x01, 0x60, 0x00, 0x00, 0x03, 0x00, 0x90, 0x00, 0x00, 0x03, 0x00,
        0x00, 0x03, 0x00, 0x5D,
    ];

    fn params() -> ParameterSets {
        ParameterSets::h265(vec![0x40, 0x01, 0x0C], SPS.to_vec(), vec![0x44, 0x01, 0xC1])
    }

    #[test]
    fn aux_line_format() {
        let line = aux_line(&params()).unwrap();
        assert!(line.starts_with("sprop-vps=QAEM;sprop-sps="));
        assert!(line.ends_with(";sprop-pps=RAHB"));
    }

    #[test]
    fn aux_line_requires_vps() {
        let mut p = params();
        p.vps = None;
        assert!(matches!(
            aux_line(&p),
            Err(MediaError::MissingParameterSet(ParameterSetKind::Vps))
        ));
    }

    #[test]
    fn profile_fields_skip_emulation_prevention() {
        let ptl = ProfileTierLevel::from_sps(&SPS).unwrap();
        assert_eq!(ptl.profile_byte, 0x01);
        assert_eq!(ptl.compatibility_flags, [0x60, 0x00, 0x00, 0x00]);
        assert_eq!(ptl.constraint_flags, [0x90, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(ptl.level_idc, 0x5D);
        assert_eq!(ptl.temporal_layers, 1);
        assert!(ptl.temporal_id_nested);
    }

    #[test]
    fn short_sps_rejected() {
        assert!(matches!(
            ProfileTierLevel::from_sps(&[0x42, 0x01, 0x01]),
            Err(MediaError::SpsTooShort(3))
        ));
    }

    #[test]
    fn hvcc_has_three_arrays() {
        let record = hevc_decoder_config(&params()).unwrap();
        assert_eq!(record[0], 1);
        assert_eq!(record[12], 0x5D);
        assert_eq!(record[21], (1 << 3) | (1 << 2) | 3);
        assert_eq!(record[22], 3);
        assert_eq!(record[23], 0x80 | 32);
        assert_eq!(record.len(), 23 + 3 * 5 + 3 + SPS.len() + 3);
    }
}
