//! Media frames and the raw-stream bridge
//!
//! The transcoder writes two raw elementary streams with no framing
//! metadata: interleaved signed 16-bit little-endian PCM, and planar
//! I420 video. Frame boundaries are reconstructed purely from the
//! negotiated [`SampleFormat`] and [`Resolution`].

pub mod audio;
pub mod bridge;
pub mod framer;
#[cfg(feature = "h264")]
pub mod h264;
pub mod tracks;
pub mod video;

use bytes::Bytes;
use std::fmt;

/// Bits per PCM sample on the raw audio stream
pub const BITS_PER_SAMPLE: u16 = 16;

/// Duration of one audio frame in milliseconds
pub const AUDIO_FRAME_MS: u32 = 10;

/// Negotiated PCM layout of the raw audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleFormat {
    /// Samples per second per channel
    pub sample_rate: u32,
    /// 1 (mono) or 2 (stereo)
    pub channels: u16,
}

impl SampleFormat {
    /// Create a sample format, rejecting rates or channel counts the bridge cannot frame
    pub fn new(sample_rate: u32, channels: u16) -> crate::Result<Self> {
        if sample_rate == 0 || sample_rate % 100 != 0 {
            return Err(crate::Error::InvalidData(format!(
                "sample rate must be a positive multiple of 100 Hz, got {}",
                sample_rate
            )));
        }
        if channels != 1 && channels != 2 {
            return Err(crate::Error::InvalidData(format!(
                "channel count must be 1 or 2, got {}",
                channels
            )));
        }
        Ok(Self {
            sample_rate,
            channels,
        })
    }

    /// Bits per sample (always 16)
    pub fn bits_per_sample(&self) -> u16 {
        BITS_PER_SAMPLE
    }

    /// Samples per channel in one 10 ms frame
    pub fn frames_per_chunk(&self) -> usize {
        (self.sample_rate / 100) as usize
    }

    /// Bytes in one 10 ms frame: `sample_rate / 100 * channels * 2`
    pub fn frame_bytes(&self) -> usize {
        self.frames_per_chunk() * self.channels as usize * 2
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let layout = if self.channels == 1 { "mono" } else { "stereo" };
        write!(f, "{} Hz {} s16le", self.sample_rate, layout)
    }
}

/// Negotiated dimensions of the raw video stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Create a resolution, rejecting zero dimensions
    pub fn new(width: u32, height: u32) -> crate::Result<Self> {
        if width == 0 || height == 0 {
            return Err(crate::Error::InvalidData(format!(
                "resolution must be positive, got {}x{}",
                width, height
            )));
        }
        Ok(Self { width, height })
    }

    /// Bytes in one I420 frame
    ///
    /// Luma plane plus two quarter-size chroma planes; for even dimensions
    /// this is exactly `width * height * 1.5`.
    pub fn frame_bytes(&self) -> usize {
        let luma = self.width as usize * self.height as usize;
        let chroma = self.width.div_ceil(2) as usize * self.height.div_ceil(2) as usize;
        luma + 2 * chroma
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// 10 ms of interleaved signed 16-bit audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub format: SampleFormat,
}

impl AudioFrame {
    /// Decode one raw chunk of little-endian PCM
    ///
    /// The chunk must hold exactly one frame for `format`.
    pub fn from_le_bytes(chunk: &[u8], format: SampleFormat) -> crate::Result<Self> {
        if chunk.len() != format.frame_bytes() {
            return Err(crate::Error::FrameAlignment(format!(
                "audio chunk of {} bytes, expected {} for {}",
                chunk.len(),
                format.frame_bytes(),
                format
            )));
        }
        let samples = chunk
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Self { samples, format })
    }

    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    pub fn channel_count(&self) -> u16 {
        self.format.channels
    }

    pub fn bits_per_sample(&self) -> u16 {
        BITS_PER_SAMPLE
    }
}

/// One planar I420 video frame
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub resolution: Resolution,
    pub data: Bytes,
}

impl VideoFrame {
    /// Wrap one raw chunk, checking it is exactly one frame for `resolution`
    pub fn new(resolution: Resolution, data: Bytes) -> crate::Result<Self> {
        if data.len() != resolution.frame_bytes() {
            return Err(crate::Error::FrameAlignment(format!(
                "video chunk of {} bytes, expected {} for {}",
                data.len(),
                resolution.frame_bytes(),
                resolution
            )));
        }
        Ok(Self { resolution, data })
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_frame_bytes() {
        let stereo = SampleFormat::new(48000, 2).unwrap();
        assert_eq!(stereo.frame_bytes(), 1920);
        assert_eq!(stereo.frames_per_chunk(), 480);

        let mono = SampleFormat::new(44100, 1).unwrap();
        assert_eq!(mono.frame_bytes(), 882);
    }

    #[test]
    fn test_invalid_sample_format() {
        assert!(SampleFormat::new(0, 2).is_err());
        assert!(SampleFormat::new(22050, 2).is_err());
        assert!(SampleFormat::new(48000, 6).is_err());
    }

    #[test]
    fn test_video_frame_bytes() {
        let hd = Resolution::new(1280, 720).unwrap();
        assert_eq!(hd.frame_bytes(), 1_382_400);

        let odd = Resolution::new(3, 3).unwrap();
        assert_eq!(odd.frame_bytes(), 9 + 2 * 4);
        assert!(Resolution::new(0, 720).is_err());
    }

    #[test]
    fn test_audio_frame_decodes_little_endian() {
        let format = SampleFormat::new(100, 1).unwrap();
        let chunk = [0x01, 0x00];
        let frame = AudioFrame::from_le_bytes(&chunk, format).unwrap();
        assert_eq!(frame.samples, vec![1]);

        let format = SampleFormat::new(100, 2).unwrap();
        let chunk = [0xff, 0xff, 0x00, 0x80];
        let frame = AudioFrame::from_le_bytes(&chunk, format).unwrap();
        assert_eq!(frame.samples, vec![-1, i16::MIN]);
        assert_eq!(frame.bits_per_sample(), 16);
    }

    #[test]
    fn test_undersized_frames_rejected() {
        let format = SampleFormat::new(48000, 2).unwrap();
        let err = AudioFrame::from_le_bytes(&[0u8; 1919], format).unwrap_err();
        assert!(matches!(err, crate::Error::FrameAlignment(_)));

        let resolution = Resolution::new(4, 2).unwrap();
        let err = VideoFrame::new(resolution, Bytes::from(vec![0u8; 11])).unwrap_err();
        assert!(matches!(err, crate::Error::FrameAlignment(_)));
        assert!(VideoFrame::new(resolution, Bytes::from(vec![0u8; 12])).is_ok());
    }
}
