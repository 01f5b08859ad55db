//! Incremental MP4 recording.
//!
//! [`Mp4Muxer`] writes a playable-after-finalize ISO-BMFF file while frames
//! arrive, without ever rewriting sample data. [`MuxerRegistry`] tracks live
//! muxers so an interrupted process can still close its files.

pub mod boxes;
pub mod buffer;
pub mod muxer;
pub mod registry;

pub use boxes::{Sample, TrackInfo};
pub use buffer::{FlushStats, WriteBuffer};
pub use muxer::{Mp4Config, Mp4Muxer, Mp4Summary};
pub use registry::{EmergencyReport, MuxerRegistry, SharedMuxer};
