//! H.264 (AVC) specifics: session description parameters and the `avcC`
//! decoder configuration record.
//!
//! ## Aux line (RFC 6184 §8.1)
//!
//! ```text
//! profile-level-id=<hex>;sprop-parameter-sets=<base64 SPS>,<base64 PPS>
//! ```
//!
//! `profile-level-id` is the three SPS bytes following the NAL header:
//! `profile_idc`, the constraint flags and `level_idc`.

use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::params::ParameterSets;
use crate::error::{MediaError, ParameterSetKind, Result};

/// Derive profile-level-id from an SPS NAL: bytes 1–3 are profile_idc,
/// constraint_set flags and level_idc, rendered as 6 lowercase hex digits.
pub fn profile_level_id(sps: &[u8]) -> Result<String> {
    if sps.len() < 4 {
        return Err(MediaError::SpsTooShort(sps.len()));
    }
    Ok(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
}

/// `<base64 SPS>,<base64 PPS>` for the `sprop-parameter-sets` parameter.
pub fn sprop_parameter_sets(params: &ParameterSets) -> Result<String> {
    let sps = params.require(ParameterSetKind::Sps)?;
    let pps = params.require(ParameterSetKind::Pps)?;
    Ok(format!(
        "{},{}",
        BASE64_STANDARD.encode(sps),
        BASE64_STANDARD.encode(pps)
    ))
}

/// Full H.264 aux line for the SDP `a=fmtp` attribute.
pub fn aux_line(params: &ParameterSets) -> Result<String> {
    let sps = params.require(ParameterSetKind::Sps)?;
    let profile = profile_level_id(sps)?;
    let sprop = sprop_parameter_sets(params)?;
    Ok(format!("profile-level-id={profile};sprop-parameter-sets={sprop}"))
}

/// Build an `AVCDecoderConfigurationRecord` (ISO/IEC 14496-15 §5.3.3.1)
/// with one SPS, one PPS and 4-byte NAL length fields.
pub fn avc_decoder_config(params: &ParameterSets) -> Result<Vec<u8>> {
    let sps = params.require(ParameterSetKind::Sps)?;
    let pps = params.require(ParameterSetKind::Pps)?;
    if sps.len() < 4 {
        return Err(MediaError::SpsTooShort(sps.len()));
    }

    let mut record = Vec::with_capacity(11 + sps.len() + pps.len());
    record.push(1); // configurationVersion
    record.push(sps[1]); // AVCProfileIndication
    record.push(sps[2]); // profile_compatibility
    record.push(sps[3]); // AVCLevelIndication
    record.push(0xFC | 3); // reserved + lengthSizeMinusOne
    record.push(0xE0 | 1); // reserved + numOfSequenceParameterSets
    record.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    record.extend_from_slice(sps);
    record.push(1); // numOfPictureParameterSets
    record.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    record.extend_from_slice(pps);
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ParameterSets {
        ParameterSets::h264(
            vec![0x67, 0x64, 0x00, 0x28, 0xAC, 0xD9],
            vec![0x68, 0xEE, 0x3C, 0x80],
        )
    }

    #[test]
    fn profile_level_id_from_sps() {
        assert_eq!(
            profile_level_id(&[0x67, 0x64, 0x00, 0x28, 0xAC]).unwrap(),
            "640028"
        );
    }

    #[test]
    fn profile_level_id_rejects_short_sps() {
        assert!(matches!(
            profile_level_id(&[0x67, 0x64, 0x00]),
            Err(MediaError::SpsTooShort(3))
        ));
    }

    #[test]
    fn aux_line_format() {
        let line = aux_line(&params()).unwrap();
        assert_eq!(
            line,
            "profile-level-id=640028;sprop-parameter-sets=Z2QAKKzZ,aO48gA=="
        );
    }

    #[test]
    fn aux_line_requires_pps() {
        let mut p = params();
        p.pps = None;
        assert!(matches!(
            aux_line(&p),
            Err(MediaError::MissingParameterSet(ParameterSetKind::Pps))
        ));
    }

    #[test]
    fn avcc_layout() {
        let record = avc_decoder_config(&params()).unwrap();
        assert_eq!(&record[..6], &[1, 0x64, 0x00, 0x28, 0xFF, 0xE1]);
        assert_eq!(u16::from_be_bytes([record[6], record[7]]), 6);
        assert_eq!(&record[8..14], &[0x67, 0x64, 0x00, 0x28, 0xAC, 0xD9]);
        assert_eq!(record[14], 1);
        assert_eq!(u16::from_be_bytes([record[15], record[16]]), 4);
        assert_eq!(record.len(), 17 + 4);
    }
}
