//! Video encoding seam
//!
//! The transcoder emits raw I420. Turning that into a WebRTC payload is
//! left to a pluggable [`VideoEncoder`]; webrtc-rs then handles RTP
//! packetization for the codec the encoder reports.

use super::VideoFrame;
use crate::Result;
use bytes::Bytes;

/// Mime type used for the outgoing video track when no encoder is set
pub const DEFAULT_VIDEO_MIME_TYPE: &str = "video/VP8";

/// RTP clock rate for video
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Encodes raw I420 frames into a codec bitstream
pub trait VideoEncoder: Send {
    /// Codec mime type, e.g. `video/VP8` or `video/H264`
    fn mime_type(&self) -> &str;

    /// `a=fmtp` parameters advertised for the track
    fn sdp_fmtp_line(&self) -> &str {
        ""
    }

    /// Encode one frame; `None` when the encoder produced no output yet
    fn encode(&mut self, frame: &VideoFrame) -> Result<Option<Bytes>>;
}

/// Builds one encoder per video track
pub type VideoEncoderFactory = std::sync::Arc<dyn Fn() -> Result<Box<dyn VideoEncoder>> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::Resolution;

    struct PassThrough;

    impl VideoEncoder for PassThrough {
        fn mime_type(&self) -> &str {
            "video/raw"
        }

        fn encode(&mut self, frame: &VideoFrame) -> Result<Option<Bytes>> {
            Ok(Some(frame.data.clone()))
        }
    }

    #[test]
    fn test_encoder_trait_object() {
        let mut encoder: Box<dyn VideoEncoder> = Box::new(PassThrough);
        let resolution = Resolution::new(2, 2).unwrap();
        let frame = VideoFrame::new(resolution, Bytes::from(vec![1u8; 6])).unwrap();
        let out = encoder.encode(&frame).unwrap().unwrap();
        assert_eq!(out.len(), 6);
        assert_eq!(encoder.mime_type(), "video/raw");
    }
}
