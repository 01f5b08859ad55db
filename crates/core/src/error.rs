//! Error types for the capture pipeline.

use std::fmt;

/// Errors that can occur in the capture pipeline.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Bitstream**: [`MissingParameterSet`](Self::MissingParameterSet),
///   [`SpsTooShort`](Self::SpsTooShort) (configuration problems that degrade
///   output instead of aborting capture).
/// - **Muxer**: [`InvalidTrack`](Self::InvalidTrack),
///   [`AlreadyInitialized`](Self::AlreadyInitialized),
///   [`NotStreaming`](Self::NotStreaming), [`EmptyFrame`](Self::EmptyFrame),
///   [`Mp4TooLarge`](Self::Mp4TooLarge).
/// - **Device / files**: [`Io`](Self::Io), [`Device`](Self::Device).
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// Underlying file or device I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A parameter set needed for this operation has not been observed yet.
    #[error("missing parameter set: {0}")]
    MissingParameterSet(ParameterSetKind),

    /// The cached SPS is too short to carry profile/level bytes.
    #[error("SPS too short for profile-level-id ({0} bytes)")]
    SpsTooShort(usize),

    /// Track parameters rejected by [`Mp4Muxer::initialize`](crate::mp4::Mp4Muxer::initialize).
    #[error("invalid track: {0}")]
    InvalidTrack(String),

    /// [`Mp4Muxer::initialize`](crate::mp4::Mp4Muxer::initialize) was called twice.
    #[error("muxer already initialized")]
    AlreadyInitialized,

    /// The muxer is not in the streaming state (never initialized, or already finalized).
    #[error("muxer not streaming")]
    NotStreaming,

    /// A frame with no payload bytes was submitted.
    #[error("empty frame")]
    EmptyFrame,

    /// The recording outgrew 32-bit box sizes.
    #[error("mp4 too large: mdat of {0} bytes exceeds 32-bit box size")]
    Mp4TooLarge(u64),

    /// The capture device reported an unrecoverable condition.
    #[error("device error: {0}")]
    Device(String),
}

/// Parameter set kinds cached by the frame splitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterSetKind {
    /// H.265 video parameter set.
    Vps,
    /// Sequence parameter set.
    Sps,
    /// Picture parameter set.
    Pps,
}

impl fmt::Display for ParameterSetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vps => write!(f, "VPS"),
            Self::Sps => write!(f, "SPS"),
            Self::Pps => write!(f, "PPS"),
        }
    }
}

/// Convenience alias for `Result<T, MediaError>`.
pub type Result<T> = std::result::Result<T, MediaError>;
