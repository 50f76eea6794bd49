//! Opus encoding of 10 ms PCM frames
//!
//! Opus only runs at 8, 12, 16, 24 or 48 kHz. Frames at any other rate are
//! resampled to 48 kHz first, and the resampled output is re-chunked into
//! 10 ms packets.

use super::{AudioFrame, SampleFormat};
use crate::{Error, Result};
use rubato::{FftFixedIn, Resampler as RubatoResampler};

/// Rates the Opus encoder accepts directly
pub const OPUS_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

/// Rate non-native sources are resampled to
pub const OPUS_FALLBACK_RATE: u32 = 48000;

/// Encoder bitrate in bits per second
pub const DEFAULT_BITRATE: i32 = 64_000;

const MAX_PACKET_SIZE: usize = 4000;

/// Opus encoder for one audio stream
pub struct AudioEncoder {
    format: SampleFormat,
    encode_rate: u32,
    encoder: opus::Encoder,
    resampler: Option<FftFixedIn<f32>>,
    /// Resampled samples per channel awaiting a full 10 ms packet
    pending: Vec<Vec<f32>>,
}

// SAFETY: the encoder state is only touched through `&mut self`; callers
// serialize access behind a mutex.
unsafe impl Send for AudioEncoder {}
unsafe impl Sync for AudioEncoder {}

impl AudioEncoder {
    /// Create an encoder for frames of `format`
    pub fn new(format: SampleFormat) -> Result<Self> {
        let channels = match format.channels {
            1 => opus::Channels::Mono,
            2 => opus::Channels::Stereo,
            n => {
                return Err(Error::InvalidConfig(format!(
                    "Opus supports 1 (mono) or 2 (stereo) channels, got {}",
                    n
                )))
            }
        };

        let native = OPUS_RATES.contains(&format.sample_rate);
        let encode_rate = if native {
            format.sample_rate
        } else {
            OPUS_FALLBACK_RATE
        };

        let mut encoder = opus::Encoder::new(encode_rate, channels, opus::Application::Audio)
            .map_err(|e| Error::EncodingError(format!("Failed to create Opus encoder: {:?}", e)))?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(DEFAULT_BITRATE))
            .map_err(|e| Error::EncodingError(format!("Failed to set bitrate: {:?}", e)))?;

        let resampler = if native {
            None
        } else {
            tracing::debug!(
                from = format.sample_rate,
                to = encode_rate,
                "Resampling audio for Opus"
            );
            Some(
                FftFixedIn::new(
                    format.sample_rate as usize,
                    encode_rate as usize,
                    format.frames_per_chunk(),
                    1,
                    format.channels as usize,
                )
                .map_err(|e| Error::EncodingError(format!("Failed to create resampler: {}", e)))?,
            )
        };

        Ok(Self {
            format,
            encode_rate,
            encoder,
            resampler,
            pending: vec![Vec::new(); format.channels as usize],
        })
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Rate the Opus stream runs at
    pub fn encode_rate(&self) -> u32 {
        self.encode_rate
    }

    /// Encode one frame into zero or more 10 ms Opus packets
    ///
    /// Native-rate frames always yield exactly one packet. Resampled
    /// frames yield a packet whenever a whole 10 ms of output is buffered.
    pub fn encode(&mut self, frame: &AudioFrame) -> Result<Vec<Vec<u8>>> {
        if frame.format != self.format {
            return Err(Error::EncodingError(format!(
                "frame format {} does not match encoder format {}",
                frame.format, self.format
            )));
        }

        let samples: Vec<f32> = frame
            .samples
            .iter()
            .map(|&s| s as f32 / 32768.0)
            .collect();

        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(vec![encode_packet(&mut self.encoder, &samples)?]);
        };

        let channels = self.format.channels as usize;
        let mut planar: Vec<Vec<f32>> = vec![Vec::with_capacity(samples.len() / channels); channels];
        for (i, &sample) in samples.iter().enumerate() {
            planar[i % channels].push(sample);
        }

        let resampled = resampler
            .process(&planar, None)
            .map_err(|e| Error::EncodingError(format!("Resampling failed: {}", e)))?;
        for (pending, output) in self.pending.iter_mut().zip(resampled) {
            pending.extend(output);
        }

        let packet_frames = (self.encode_rate / 100) as usize;
        let mut packets = Vec::new();
        while self.pending[0].len() >= packet_frames {
            let mut interleaved = Vec::with_capacity(packet_frames * channels);
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|p| p.drain(..packet_frames).collect())
                .collect();
            for i in 0..packet_frames {
                for channel in &chunk {
                    interleaved.push(channel[i]);
                }
            }
            packets.push(encode_packet(&mut self.encoder, &interleaved)?);
        }
        Ok(packets)
    }
}

fn encode_packet(encoder: &mut opus::Encoder, samples: &[f32]) -> Result<Vec<u8>> {
    let mut output = vec![0u8; MAX_PACKET_SIZE];
    let len = encoder
        .encode_float(samples, &mut output)
        .map_err(|e| Error::EncodingError(format!("Opus encoding failed: {}", e)))?;
    output.truncate(len);
    Ok(output)
}
