//! Outgoing webrtc-rs media tracks
//!
//! [`AudioTrack`] and [`VideoTrack`] are the frame sinks handed to the
//! bridge by [`crate::peer::WebRtcEngine`].

use super::audio::AudioEncoder;
use super::video::VideoEncoder;
use super::{AudioFrame, VideoFrame, AUDIO_FRAME_MS};
use crate::peer::{AudioSink, VideoSink};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Opus audio track
///
/// The encoder is created from the first frame's format and rebuilt if a
/// later frame arrives with a different one.
pub struct AudioTrack {
    track: Arc<TrackLocalStaticSample>,
    encoder: Mutex<Option<AudioEncoder>>,
    packets_sent: AtomicU64,
}

impl AudioTrack {
    pub fn new(track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            track,
            encoder: Mutex::new(None),
            packets_sent: AtomicU64::new(0),
        }
    }

    /// Get the underlying WebRTC track
    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    fn encode(&self, frame: &AudioFrame) -> Result<Vec<Vec<u8>>> {
        let mut guard = self.encoder.lock();
        let needs_encoder = guard
            .as_ref()
            .map_or(true, |encoder| encoder.format() != frame.format);
        if needs_encoder {
            tracing::info!(format = %frame.format, "Creating Opus encoder");
            *guard = Some(AudioEncoder::new(frame.format)?);
        }
        match guard.as_mut() {
            Some(encoder) => encoder.encode(frame),
            None => Err(Error::EncodingError("audio encoder missing".to_string())),
        }
    }
}

#[async_trait]
impl AudioSink for AudioTrack {
    async fn on_data(&self, frame: AudioFrame) -> Result<()> {
        let packets = self.encode(&frame)?;
        for packet in packets {
            let sample = Sample {
                data: Bytes::from(packet),
                duration: Duration::from_millis(AUDIO_FRAME_MS as u64),
                ..Default::default()
            };
            self.track
                .write_sample(&sample)
                .await
                .map_err(|e| Error::MediaTrackError(format!("Failed to write audio sample: {}", e)))?;
            self.packets_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Video track fed through an optional [`VideoEncoder`]
///
/// Without an encoder, frames are still size-checked by the bridge but
/// nothing is sent.
pub struct VideoTrack {
    track: Arc<TrackLocalStaticSample>,
    encoder: Option<Mutex<Box<dyn VideoEncoder>>>,
    frame_duration: Duration,
    warned: AtomicBool,
    frames_sent: AtomicU64,
}

impl VideoTrack {
    pub fn new(
        track: Arc<TrackLocalStaticSample>,
        encoder: Option<Box<dyn VideoEncoder>>,
        framerate: u32,
    ) -> Self {
        Self {
            track,
            encoder: encoder.map(Mutex::new),
            frame_duration: Duration::from_secs(1) / framerate.max(1),
            warned: AtomicBool::new(false),
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Get the underlying WebRTC track
    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl VideoSink for VideoTrack {
    async fn on_frame(&self, frame: VideoFrame) -> Result<()> {
        let Some(encoder) = self.encoder.as_ref() else {
            if !self.warned.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    resolution = %frame.resolution,
                    "No video encoder configured, raw frames are dropped"
                );
            }
            return Ok(());
        };

        let encoded = encoder.lock().encode(&frame)?;
        let Some(data) = encoded else {
            return Ok(());
        };

        let sample = Sample {
            data,
            duration: self.frame_duration,
            ..Default::default()
        };
        self.track
            .write_sample(&sample)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to write video sample: {}", e)))?;
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{Resolution, SampleFormat};
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    fn local_track(mime_type: &str, clock_rate: u32, channels: u16) -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                clock_rate,
                channels,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            "track".to_string(),
            "stream".to_string(),
        ))
    }

    #[tokio::test]
    async fn test_audio_track_encodes_unbound() {
        let track = AudioTrack::new(local_track("audio/opus", 48000, 2));
        let format = SampleFormat::new(48000, 2).unwrap();
        let frame = AudioFrame {
            samples: vec![0; 960],
            format,
        };
        track.on_data(frame).await.unwrap();
        assert_eq!(track.packets_sent(), 1);
    }

    #[tokio::test]
    async fn test_video_track_without_encoder_drops() {
        let track = VideoTrack::new(local_track("video/VP8", 90000, 0), None, 15);
        let resolution = Resolution::new(4, 4).unwrap();
        let frame = VideoFrame::new(resolution, Bytes::from(vec![0u8; 24])).unwrap();
        track.on_frame(frame.clone()).await.unwrap();
        track.on_frame(frame).await.unwrap();
        assert_eq!(track.frames_sent(), 0);
    }

    struct CountingEncoder;

    impl VideoEncoder for CountingEncoder {
        fn mime_type(&self) -> &str {
            "video/VP8"
        }

        fn encode(&mut self, frame: &VideoFrame) -> Result<Option<Bytes>> {
            Ok(Some(frame.data.slice(..4)))
        }
    }

    #[tokio::test]
    async fn test_video_track_with_encoder_sends() {
        let track = VideoTrack::new(
            local_track("video/VP8", 90000, 0),
            Some(Box::new(CountingEncoder)),
            15,
        );
        let resolution = Resolution::new(4, 4).unwrap();
        let frame = VideoFrame::new(resolution, Bytes::from(vec![0u8; 24])).unwrap();
        track.on_frame(frame).await.unwrap();
        assert_eq!(track.frames_sent(), 1);
    }
}
