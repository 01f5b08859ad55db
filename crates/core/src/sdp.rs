//! SDP (Session Description Protocol) for a capture source (RFC 4566 / RFC 8866).
//!
//! The delivery layer embeds these lines in its DESCRIBE response:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                             ← session name
//! c=IN IP4 <addr>                              ← connection address
//! t=0 0                                        ← timing (live stream)
//! a=tool:camstream                             ← software (§6)
//! a=sendonly                                   ← direction (§6)
//! m=video 0 RTP/AVP 96                         ← media description
//! a=rtpmap:96 H264/90000                       ← codec/clock rate
//! a=fmtp:96 packetization-mode=1;<aux line>    ← codec parameters
//! a=control:track1                             ← track control URL
//! ```
//!
//! MJPEG uses the static payload type 26 (RFC 2435) and carries no `fmtp`.

use crate::device::PixelFormat;
use crate::source::FrameSource;

/// RTP clock rate for video payloads.
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Static RTP payload type for JPEG (RFC 3551 §6).
pub const JPEG_PAYLOAD_TYPE: u8 = 26;

/// Session-level SDP fields.
#[derive(Debug, Clone)]
pub struct SdpConfig {
    /// Address advertised in `o=` and `c=`.
    pub address: String,
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub session_name: String,
    /// Dynamic payload type for H.264/H.265. Ignored for MJPEG.
    pub payload_type: u8,
}

impl Default for SdpConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            username: "-".to_string(),
            session_id: "0".to_string(),
            session_version: "0".to_string(),
            session_name: "Stream".to_string(),
            payload_type: 96,
        }
    }
}

/// Payload type actually used for `pixel_format`.
pub fn payload_type_for(pixel_format: PixelFormat, dynamic: u8) -> u8 {
    match pixel_format {
        PixelFormat::Mjpeg => JPEG_PAYLOAD_TYPE,
        PixelFormat::H264 | PixelFormat::H265 => dynamic,
    }
}

/// Media-level attributes for one video track.
///
/// - `a=rtpmap:<pt> <name>/90000`
/// - `a=fmtp:<pt> ...` when there is anything to say (RFC 6184 §8.1, RFC 7798 §7.1)
/// - `a=control:track1`
pub fn media_attributes(
    pixel_format: PixelFormat,
    payload_type: u8,
    aux_line: Option<&str>,
) -> Vec<String> {
    let pt = payload_type_for(pixel_format, payload_type);
    let mut attrs = Vec::with_capacity(3);

    match pixel_format {
        PixelFormat::H264 => {
            attrs.push(format!("a=rtpmap:{} H264/{}", pt, VIDEO_CLOCK_RATE));
            let mut fmtp = format!("a=fmtp:{} packetization-mode=1", pt);
            if let Some(aux) = aux_line {
                fmtp.push(';');
                fmtp.push_str(aux);
            }
            attrs.push(fmtp);
        }
        PixelFormat::H265 => {
            attrs.push(format!("a=rtpmap:{} H265/{}", pt, VIDEO_CLOCK_RATE));
            if let Some(aux) = aux_line {
                attrs.push(format!("a=fmtp:{} {}", pt, aux));
            }
        }
        PixelFormat::Mjpeg => {
            attrs.push(format!("a=rtpmap:{} JPEG/{}", pt, VIDEO_CLOCK_RATE));
        }
    }

    attrs.push("a=control:track1".to_string());
    attrs
}

/// Generate a complete session description for `source`.
pub fn generate_sdp(source: &dyn FrameSource, config: &SdpConfig) -> String {
    let pt = payload_type_for(source.format().pixel_format, config.payload_type);
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!(
        "o={} {} {} IN IP4 {}",
        config.username, config.session_id, config.session_version, config.address
    ));
    sdp.push(format!("s={}", config.session_name));
    sdp.push(format!("c=IN IP4 {}", config.address));
    sdp.push("t=0 0".to_string());
    sdp.push("a=tool:camstream".to_string());
    sdp.push("a=sendonly".to_string());
    sdp.push(format!("m=video 0 RTP/AVP {}", pt));
    sdp.extend(source.sdp_attributes(config.payload_type));

    tracing::debug!("SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}
