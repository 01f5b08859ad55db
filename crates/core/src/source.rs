//! Frame source capability seen by the delivery layer.
//!
//! Delivery code asks a source for its format and codec parameters through
//! [`FrameSource`] alone; it never needs the concrete capture type behind it.
//! The capture path publishes into a [`DeviceSource`] as parameter sets are
//! learned, and the delivery side reads it from its own thread.

use bytes::Bytes;
use parking_lot::RwLock;

use crate::device::VideoFormat;
use crate::sdp;

/// What the delivery layer may ask of a video source.
pub trait FrameSource: Send + Sync {
    /// Negotiated capture format.
    fn format(&self) -> VideoFormat;

    /// Codec parameters for the session description, once known.
    fn aux_line(&self) -> Option<String>;

    /// Most recent keyframe as Annex B, parameter sets first, so a consumer
    /// joining mid-stream can start decoding without waiting for the next IDR.
    fn last_keyframe(&self) -> Option<Bytes>;

    /// Media-level SDP attributes for this source.
    fn sdp_attributes(&self, payload_type: u8) -> Vec<String> {
        sdp::media_attributes(
            self.format().pixel_format,
            payload_type,
            self.aux_line().as_deref(),
        )
    }
}

/// Shared, capture-published view of one device.
#[derive(Debug)]
pub struct DeviceSource {
    format: VideoFormat,
    aux_line: RwLock<Option<String>>,
    last_keyframe: RwLock<Option<Bytes>>,
}

impl DeviceSource {
    pub fn new(format: VideoFormat) -> Self {
        Self {
            format,
            aux_line: RwLock::new(None),
            last_keyframe: RwLock::new(None),
        }
    }

    /// Replace the published aux line.
    pub fn publish_aux_line(&self, line: Option<String>) {
        let mut current = self.aux_line.write();
        if *current != line {
            tracing::debug!(aux_line = ?line, "aux line updated");
            *current = line;
        }
    }

    pub fn publish_keyframe(&self, keyframe: Bytes) {
        *self.last_keyframe.write() = Some(keyframe);
    }
}

impl FrameSource for DeviceSource {
    fn format(&self) -> VideoFormat {
        self.format
    }

    fn aux_line(&self) -> Option<String> {
        self.aux_line.read().clone()
    }

    fn last_keyframe(&self) -> Option<Bytes> {
        self.last_keyframe.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::PixelFormat;

    #[test]
    fn aux_line_flows_into_attributes() {
        let source = DeviceSource::new(VideoFormat {
            width: 640,
            height: 480,
            fps: 25,
            pixel_format: PixelFormat::H264,
        });
        assert!(source.aux_line().is_none());

        source.publish_aux_line(Some(
            "profile-level-id=42001f;sprop-parameter-sets=Z0IAHw==,aM4=".into(),
        ));
        let shared: Arc<dyn FrameSource> = Arc::new(source);
        let attrs = shared.sdp_attributes(96);
        assert_eq!(
            attrs[1],
            "a=fmtp:96 packetization-mode=1;profile-level-id=42001f;sprop-parameter-sets=Z0IAHw==,aM4="
        );
        assert_eq!(shared.format().fps, 25);
    }

    #[test]
    fn keyframe_published_for_late_joiners() {
        let source = DeviceSource::new(VideoFormat {
            width: 1280,
            height: 720,
            fps: 30,
            pixel_format: PixelFormat::H264,
        });
        assert!(source.last_keyframe().is_none());

        source.publish_keyframe(Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88]));
        source.publish_keyframe(Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x99]));
        let shared: Arc<dyn FrameSource> = Arc::new(source);
        assert_eq!(shared.last_keyframe().as_deref(), Some(&[0, 0, 0, 1, 0x65, 0x99][..]));
    }
}
