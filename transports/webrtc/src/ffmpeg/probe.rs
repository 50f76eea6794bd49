//! Format discovery from FFmpeg's diagnostic output
//!
//! FFmpeg prints stream descriptions such as
//!
//! ```text
//! Stream #0:0(und): Video: h264 (High), yuv420p(progressive), 1280x720 [SAR 1:1 DAR 16:9], 30 fps
//! Stream #0:1(und): Audio: aac (LC), 48000 Hz, stereo, fltp, 128 kb/s
//! ```
//!
//! The probe scans every output line for the first resolution token and
//! the first audio description. Each value resolves once; later matches
//! are ignored.

use crate::media::{Resolution, SampleFormat};
use crate::{Error, Result};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::watch;

static RESOLUTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{2,5})x(\d{2,5})\b").expect("resolution pattern is valid")
});

static AUDIO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Audio:.*?\b(\d+) Hz\b.*?\b(mono|stereo)\b").expect("audio pattern is valid")
});

/// Parse a resolution token from a single output line
pub fn parse_resolution(line: &str) -> Option<Resolution> {
    let caps = RESOLUTION_RE.captures(line)?;
    let width = caps[1].parse().ok()?;
    let height = caps[2].parse().ok()?;
    Resolution::new(width, height).ok()
}

/// Parse an audio sample format from a single output line
///
/// The line must contain `Audio:` followed by `<rate> Hz` and a `mono` or
/// `stereo` channel layout.
pub fn parse_sample_format(line: &str) -> Option<SampleFormat> {
    let caps = AUDIO_RE.captures(line)?;
    let rate: u32 = caps[1].parse().ok()?;
    let channels = if &caps[2] == "mono" { 1 } else { 2 };
    match SampleFormat::new(rate, channels) {
        Ok(format) => Some(format),
        Err(e) => {
            tracing::warn!("Unusable audio format in transcoder output: {}", e);
            None
        }
    }
}

/// One-shot resolution / sample format discovery
pub struct OutputProbe {
    resolution: watch::Sender<Option<Resolution>>,
    sample_format: watch::Sender<Option<SampleFormat>>,
    expects_audio: bool,
}

impl OutputProbe {
    /// Create a probe; `expects_audio` controls when it counts as resolved
    pub fn new(expects_audio: bool) -> Self {
        let (resolution, _) = watch::channel(None);
        let (sample_format, _) = watch::channel(None);
        Self {
            resolution,
            sample_format,
            expects_audio,
        }
    }

    /// Scan one line of transcoder output
    pub fn feed_line(&self, line: &str) {
        if self.resolution.borrow().is_none() {
            if let Some(resolution) = parse_resolution(line) {
                tracing::debug!(%resolution, "Transcoder resolution discovered");
                self.resolution.send_replace(Some(resolution));
            }
        }
        if self.sample_format.borrow().is_none() {
            if let Some(format) = parse_sample_format(line) {
                tracing::debug!(%format, "Transcoder sample format discovered");
                self.sample_format.send_replace(Some(format));
            }
        }
    }

    pub fn resolution(&self) -> Option<Resolution> {
        *self.resolution.borrow()
    }

    pub fn sample_format(&self) -> Option<SampleFormat> {
        *self.sample_format.borrow()
    }

    /// Whether every expected value has been discovered
    pub fn is_resolved(&self) -> bool {
        self.resolution().is_some() && (!self.expects_audio || self.sample_format().is_some())
    }

    /// Wait for the resolution, failing with `Error::ParseStall` after `timeout`
    pub async fn wait_resolution(&self, timeout: Duration) -> Result<Resolution> {
        let mut rx = self.resolution.subscribe();
        let found = tokio::time::timeout(timeout, rx.wait_for(Option::is_some))
            .await
            .map_err(|_| {
                Error::ParseStall(format!("no resolution in transcoder output after {:?}", timeout))
            })?
            .map_err(|_| Error::ParseStall("transcoder probe dropped".to_string()))?;
        (*found).ok_or_else(|| Error::ParseStall("resolution missing".to_string()))
    }

    /// Wait for the sample format, failing with `Error::ParseStall` after `timeout`
    pub async fn wait_sample_format(&self, timeout: Duration) -> Result<SampleFormat> {
        let mut rx = self.sample_format.subscribe();
        let found = tokio::time::timeout(timeout, rx.wait_for(Option::is_some))
            .await
            .map_err(|_| {
                Error::ParseStall(format!(
                    "no audio sample format in transcoder output after {:?}",
                    timeout
                ))
            })?
            .map_err(|_| Error::ParseStall("transcoder probe dropped".to_string()))?;
        (*found).ok_or_else(|| Error::ParseStall("sample format missing".to_string()))
    }
}
