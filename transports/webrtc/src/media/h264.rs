//! H.264 video encoding with OpenH264
//!
//! Raw I420 frames go in, Annex-B access units come out. webrtc-rs
//! packetizes those for the `video/H264` track.

use super::video::{VideoEncoder, VideoEncoderFactory};
use super::{Resolution, VideoFrame};
use crate::{Error, Result};
use bytes::Bytes;
use openh264::encoder::{Encoder, EncoderConfig};
use openh264::formats::YUVSource;
use std::sync::Arc;

/// Mime type of the encoded track
pub const H264_MIME_TYPE: &str = "video/H264";

/// Constrained baseline, packetization mode 1: what browsers decode everywhere
pub const H264_FMTP_LINE: &str =
    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

/// Frames between forced IDR frames
///
/// Samples written before the peer connects are dropped, so a late viewer
/// needs a fresh keyframe.
pub const KEYFRAME_INTERVAL: u64 = 30;

/// OpenH264 encoder, rebuilt whenever the input resolution changes
pub struct H264Encoder {
    encoder: Option<(Resolution, Encoder)>,
    frames: u64,
}

// SAFETY: the OpenH264 handle is only used through `&mut self`, and the
// video track serializes calls behind a mutex.
unsafe impl Send for H264Encoder {}

impl H264Encoder {
    pub fn new() -> Self {
        Self {
            encoder: None,
            frames: 0,
        }
    }

    /// Factory for [`crate::peer::WebRtcEngine::with_video_encoder`]
    pub fn factory() -> VideoEncoderFactory {
        Arc::new(|| Ok(Box::new(H264Encoder::new()) as Box<dyn VideoEncoder>))
    }

    fn encoder_for(&mut self, resolution: Resolution) -> Result<&mut Encoder> {
        let stale = self
            .encoder
            .as_ref()
            .map_or(true, |(current, _)| *current != resolution);
        if stale {
            if resolution.width % 2 != 0 || resolution.height % 2 != 0 {
                return Err(Error::EncodingError(format!(
                    "H.264 needs even dimensions, got {}",
                    resolution
                )));
            }
            tracing::info!(%resolution, "Creating H.264 encoder");
            let config = EncoderConfig::new(resolution.width, resolution.height);
            let encoder = Encoder::with_config(config).map_err(|e| {
                Error::EncodingError(format!("Failed to create H.264 encoder: {}", e))
            })?;
            self.encoder = Some((resolution, encoder));
            self.frames = 0;
        }
        match self.encoder.as_mut() {
            Some((_, encoder)) => Ok(encoder),
            None => Err(Error::EncodingError("H.264 encoder missing".to_string())),
        }
    }
}

impl Default for H264Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoder for H264Encoder {
    fn mime_type(&self) -> &str {
        H264_MIME_TYPE
    }

    fn sdp_fmtp_line(&self) -> &str {
        H264_FMTP_LINE
    }

    fn encode(&mut self, frame: &VideoFrame) -> Result<Option<Bytes>> {
        let frame_index = self.frames;
        let encoder = self.encoder_for(frame.resolution)?;
        if frame_index > 0 && frame_index % KEYFRAME_INTERVAL == 0 {
            encoder.force_intra_frame();
        }

        let planes = I420Planes::new(frame);
        let bitstream = encoder
            .encode(&planes)
            .map_err(|e| Error::EncodingError(format!("H.264 encoding failed: {}", e)))?;
        let data = bitstream.to_vec();
        self.frames += 1;

        if data.is_empty() {
            // Rate control skipped the frame
            return Ok(None);
        }
        Ok(Some(Bytes::from(data)))
    }
}

/// Borrowed view of one I420 frame's planes
struct I420Planes<'a> {
    width: i32,
    height: i32,
    y: &'a [u8],
    u: &'a [u8],
    v: &'a [u8],
}

impl<'a> I420Planes<'a> {
    fn new(frame: &'a VideoFrame) -> Self {
        let width = frame.width() as usize;
        let height = frame.height() as usize;
        let luma = width * height;
        let chroma = width.div_ceil(2) * height.div_ceil(2);
        let data = &frame.data[..];
        Self {
            width: width as i32,
            height: height as i32,
            y: &data[..luma],
            u: &data[luma..luma + chroma],
            v: &data[luma + chroma..luma + 2 * chroma],
        }
    }
}

impl YUVSource for I420Planes<'_> {
    fn width(&self) -> i32 {
        self.width
    }

    fn height(&self) -> i32 {
        self.height
    }

    fn y(&self) -> &[u8] {
        self.y
    }

    fn u(&self) -> &[u8] {
        self.u
    }

    fn v(&self) -> &[u8] {
        self.v
    }

    fn y_stride(&self) -> i32 {
        self.width
    }

    fn u_stride(&self) -> i32 {
        (self.width + 1) / 2
    }

    fn v_stride(&self) -> i32 {
        (self.width + 1) / 2
    }
}
