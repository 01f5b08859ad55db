//! Per-source frame splitting.
//!
//! One [`FrameSplitter`] sits between the device and every consumer of a
//! capture buffer. It is the only place where parameter-set state lives:
//!
//! ```text
//! capture buffer ─► NalUnits ─► FrameSplitter ─┬─► units        (RTP delivery)
//!                                              ├─► AccessUnit   (MP4 sample)
//!                                              └─► keyframe     (snapshot)
//! ```
//!
//! The codec only changes how NAL headers are classified; see
//! [`VideoCodec::classify`].

use std::sync::Arc;

use bytes::Bytes;

use super::codec::{NalKind, VideoCodec};
use super::nal::{NalUnits, push_annex_b};
use super::params::ParameterSets;
use super::{h264, h265};
use crate::snapshot::SnapshotGenerator;

/// Splitter behaviour switches.
#[derive(Debug, Clone, Default)]
pub struct SplitterConfig {
    /// Re-emit the cached parameter sets in front of every keyframe so that
    /// receivers joining mid-stream can start decoding at the next IDR.
    pub repeat_config: bool,
}

/// All non-parameter-set NAL units of one capture buffer, in order.
///
/// This is one MP4 sample. The keyframe flag is the OR of every NAL's IDR
/// status, so SEI or AUD units ahead of the IDR slice do not hide it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessUnit {
    nals: Vec<Bytes>,
    is_keyframe: bool,
}

impl AccessUnit {
    pub fn new(nals: Vec<Bytes>, is_keyframe: bool) -> Self {
        Self { nals, is_keyframe }
    }

    /// NAL payloads without start codes.
    pub fn nals(&self) -> &[Bytes] {
        &self.nals
    }

    pub fn is_keyframe(&self) -> bool {
        self.is_keyframe
    }

    pub fn is_empty(&self) -> bool {
        self.nals.is_empty()
    }

    /// Size of the unit in MP4 sample framing (4-byte length per NAL).
    pub fn sample_size(&self) -> usize {
        self.nals.iter().map(|n| 4 + n.len()).sum()
    }

    /// Serialize as an MP4 sample: `(u32 BE length, payload)` per NAL.
    pub fn to_length_prefixed(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.sample_size());
        for nal in &self.nals {
            out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
            out.extend_from_slice(nal);
        }
        out
    }

    /// Serialize as Annex B with 4-byte start codes.
    pub fn to_annex_b(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.sample_size());
        for nal in &self.nals {
            push_annex_b(&mut out, nal);
        }
        out
    }
}

/// Result of splitting one capture buffer.
#[derive(Debug, Clone, Default)]
pub struct SplitFrame {
    /// Units for the RTP framer, in original order, without start codes.
    /// Includes parameter sets (received or re-injected).
    pub units: Vec<Bytes>,
    /// The MP4 sample for this buffer.
    pub access_unit: AccessUnit,
    /// A parameter set in this buffer differed from the cached one.
    pub parameter_sets_changed: bool,
}

/// Splits raw capture buffers into NAL units and caches parameter sets.
pub struct FrameSplitter {
    codec: VideoCodec,
    config: SplitterConfig,
    params: ParameterSets,
    last_keyframe: Option<Bytes>,
    snapshot: Option<Arc<SnapshotGenerator>>,
    frames: u64,
    keyframes: u64,
}

impl FrameSplitter {
    pub fn new(codec: VideoCodec, config: SplitterConfig) -> Self {
        tracing::debug!(?codec, repeat_config = config.repeat_config, "frame splitter created");
        Self {
            codec,
            config,
            params: ParameterSets::default(),
            last_keyframe: None,
            snapshot: None,
            frames: 0,
            keyframes: 0,
        }
    }

    /// Forward every keyframe (with the current parameter sets) to `generator`.
    pub fn with_snapshot(mut self, generator: Arc<SnapshotGenerator>) -> Self {
        self.snapshot = Some(generator);
        self
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn parameter_sets(&self) -> &ParameterSets {
        &self.params
    }

    /// Last keyframe as Annex B, parameter sets first, for late-joining consumers.
    pub fn last_keyframe(&self) -> Option<&Bytes> {
        self.last_keyframe.as_ref()
    }

    /// Number of buffers processed so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn keyframes(&self) -> u64 {
        self.keyframes
    }

    /// Codec parameters for the session description, or `None` while the
    /// parameter sets are incomplete or unusable.
    pub fn aux_line(&self) -> Option<String> {
        let line = match self.codec {
            VideoCodec::H264 => h264::aux_line(&self.params),
            VideoCodec::H265 => h265::aux_line(&self.params),
        };
        match line {
            Ok(line) => Some(line),
            Err(e) => {
                tracing::debug!(codec = ?self.codec, error = %e, "aux line unavailable");
                None
            }
        }
    }

    /// Split one capture buffer.
    pub fn process_frame(&mut self, buf: &[u8]) -> SplitFrame {
        let frame = Bytes::copy_from_slice(buf);
        let mut out = SplitFrame::default();
        let mut nals = Vec::new();
        let mut is_keyframe = false;

        for nal in NalUnits::new(&frame, false) {
            let payload = frame.slice_ref(nal.payload());
            match self.codec.classify(nal.header()) {
                NalKind::ParameterSet(kind) => {
                    if self.params.update(kind, &payload) {
                        out.parameter_sets_changed = true;
                        tracing::debug!(
                            codec = ?self.codec,
                            %kind,
                            len = payload.len(),
                            "parameter set cached"
                        );
                    }
                    out.units.push(payload);
                }
                NalKind::Idr => {
                    is_keyframe = true;
                    if self.config.repeat_config {
                        if let Ok(sets) = self.params.ordered(self.codec) {
                            tracing::trace!(count = sets.len(), "parameter sets before IDR");
                            out.units.extend(sets);
                        }
                    }
                    out.units.push(payload.clone());
                    nals.push(payload);
                }
                NalKind::Slice | NalKind::Other => {
                    out.units.push(payload.clone());
                    nals.push(payload);
                }
            }
        }

        out.access_unit = AccessUnit::new(nals, is_keyframe);
        self.frames += 1;

        if is_keyframe {
            self.keyframes += 1;
            self.on_keyframe(&out.access_unit);
        }

        tracing::trace!(
            units = out.units.len(),
            au_nals = out.access_unit.nals().len(),
            keyframe = is_keyframe,
            frame_bytes = buf.len(),
            "frame split"
        );

        out
    }

    fn on_keyframe(&mut self, access_unit: &AccessUnit) {
        let mut annex_b = match self.params.to_annex_b(self.codec) {
            Ok(sets) => sets,
            Err(e) => {
                tracing::warn!(codec = ?self.codec, error = %e, "keyframe before parameter sets");
                Vec::new()
            }
        };
        annex_b.extend_from_slice(&access_unit.to_annex_b());
        self.last_keyframe = Some(Bytes::from(annex_b));

        if let Some(snapshot) = &self.snapshot {
            if self.params.is_complete(self.codec) {
                if let Err(e) = snapshot.update_keyframe(self.codec, &self.params, access_unit) {
                    tracing::warn!(error = %e, "snapshot update failed");
                }
            }
        }
    }
}
