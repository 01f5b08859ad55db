//! Elementary-stream handling for H.264 and H.265.
//!
//! A capture buffer travels through these modules in order:
//!
//! | Step | Module | Output |
//! |------|--------|--------|
//! | Start-code scan | [`nal`] | borrowed [`NalUnit`]s |
//! | Header classification | [`codec`] | [`NalKind`] per unit |
//! | Parameter-set caching | [`params`] | [`ParameterSets`] |
//! | Splitting | [`splitter`] | [`SplitFrame`] (delivery units + [`AccessUnit`]) |
//!
//! Codec-specific session parameters and decoder configuration records live
//! in [`h264`] and [`h265`].

pub mod codec;
pub mod h264;
pub mod h265;
pub mod nal;
pub mod params;
pub mod splitter;

pub use codec::{NalKind, VideoCodec};
pub use nal::{NalUnit, NalUnits};
pub use params::ParameterSets;
pub use splitter::{AccessUnit, FrameSplitter, SplitFrame, SplitterConfig};
