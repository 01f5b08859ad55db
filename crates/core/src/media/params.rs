use bytes::Bytes;

use super::codec::VideoCodec;
use super::nal::START_CODE_LONG;
use crate::error::{MediaError, ParameterSetKind, Result};

/// Most recently observed parameter sets of one source.
///
/// Each entry holds the full NAL (header byte included, no start code).
/// A newly observed set replaces the previous one of the same kind
/// entirely; nothing is merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSets {
    pub vps: Option<Bytes>,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

impl ParameterSets {
    /// Build an H.264 cache from explicit SPS/PPS.
    pub fn h264(sps: impl Into<Bytes>, pps: impl Into<Bytes>) -> Self {
        Self {
            vps: None,
            sps: Some(sps.into()),
            pps: Some(pps.into()),
        }
    }

    /// Build an H.265 cache from explicit VPS/SPS/PPS.
    pub fn h265(vps: impl Into<Bytes>, sps: impl Into<Bytes>, pps: impl Into<Bytes>) -> Self {
        Self {
            vps: Some(vps.into()),
            sps: Some(sps.into()),
            pps: Some(pps.into()),
        }
    }

    /// Replace the cached set of `kind`. Returns `true` if the value changed.
    pub fn update(&mut self, kind: ParameterSetKind, nal: &[u8]) -> bool {
        let slot = self.slot_mut(kind);
        if slot.as_deref() == Some(nal) {
            return false;
        }
        *slot = Some(Bytes::copy_from_slice(nal));
        true
    }

    /// Cached set of `kind`, if observed and non-empty.
    pub fn get(&self, kind: ParameterSetKind) -> Option<&Bytes> {
        let slot = match kind {
            ParameterSetKind::Vps => &self.vps,
            ParameterSetKind::Sps => &self.sps,
            ParameterSetKind::Pps => &self.pps,
        };
        slot.as_ref().filter(|b| !b.is_empty())
    }

    /// Cached set of `kind`, or [`MediaError::MissingParameterSet`].
    pub fn require(&self, kind: ParameterSetKind) -> Result<&Bytes> {
        self.get(kind).ok_or(MediaError::MissingParameterSet(kind))
    }

    /// First parameter set `codec` needs that is not cached yet.
    pub fn missing(&self, codec: VideoCodec) -> Option<ParameterSetKind> {
        codec
            .required_parameter_sets()
            .iter()
            .copied()
            .find(|&kind| self.get(kind).is_none())
    }

    /// Whether every parameter set `codec` needs is cached.
    pub fn is_complete(&self, codec: VideoCodec) -> bool {
        self.missing(codec).is_none()
    }

    /// The sets `codec` needs, in decoding order (VPS, SPS, PPS).
    ///
    /// Fails if any of them is missing.
    pub fn ordered(&self, codec: VideoCodec) -> Result<Vec<Bytes>> {
        codec
            .required_parameter_sets()
            .iter()
            .map(|&kind| self.require(kind).cloned())
            .collect()
    }

    /// Parameter sets serialized as Annex B, each behind a 4-byte start code.
    pub fn to_annex_b(&self, codec: VideoCodec) -> Result<Vec<u8>> {
        let sets = self.ordered(codec)?;
        let mut out = Vec::with_capacity(sets.iter().map(|s| s.len() + 4).sum());
        for set in &sets {
            out.extend_from_slice(&START_CODE_LONG);
            out.extend_from_slice(set);
        }
        Ok(out)
    }

    fn slot_mut(&mut self, kind: ParameterSetKind) -> &mut Option<Bytes> {
        match kind {
            ParameterSetKind::Vps => &mut self.vps,
            ParameterSetKind::Sps => &mut self.sps,
            ParameterSetKind::Pps => &mut self.pps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_replaces_previous_value() {
        let mut sets = ParameterSets::default();
        assert!(sets.update(ParameterSetKind::Sps, &[0x67, 0x42, 0x00, 0x1E, 0xAB]));
        assert!(sets.update(ParameterSetKind::Sps, &[0x67, 0x64]));
        assert_eq!(sets.sps.as_deref(), Some(&[0x67u8, 0x64][..]));
        assert!(!sets.update(ParameterSetKind::Sps, &[0x67, 0x64]));
    }

    #[test]
    fn completeness_depends_on_codec() {
        let mut sets = ParameterSets::h264(vec![0x67, 0x42], vec![0x68, 0xCE]);
        assert!(sets.is_complete(VideoCodec::H264));
        assert_eq!(sets.missing(VideoCodec::H265), Some(ParameterSetKind::Vps));

        sets.update(ParameterSetKind::Vps, &[0x40, 0x01]);
        assert!(sets.is_complete(VideoCodec::H265));
    }

    #[test]
    fn empty_set_counts_as_missing() {
        let sets = ParameterSets::h264(Vec::new(), vec![0x68]);
        assert!(matches!(
            sets.require(ParameterSetKind::Sps),
            Err(MediaError::MissingParameterSet(ParameterSetKind::Sps))
        ));
    }

    #[test]
    fn annex_b_order() {
        let sets = ParameterSets::h265(vec![0x40], vec![0x42], vec![0x44]);
        assert_eq!(
            sets.to_annex_b(VideoCodec::H265).unwrap(),
            vec![0, 0, 0, 1, 0x40, 0, 0, 0, 1, 0x42, 0, 0, 0, 1, 0x44]
        );
    }
}
