//! FFmpeg command line construction

use crate::source::SourceDescriptor;
use crate::{Error, Result};
use std::net::SocketAddr;

/// Silent audio generator used when the input may lack an audio stream
const SILENT_AUDIO_INPUT: [&str; 4] = ["-f", "lavfi", "-i", "anullsrc=cl=1"];

fn tcp_url(addr: SocketAddr) -> String {
    format!("tcp://{}", addr)
}

/// Build the full FFmpeg argument list for a source
///
/// The order is fixed:
///
/// 1. `-hide_banner -y`
/// 2. the source's input arguments, verbatim
/// 3. when audio is expected: a silent `anullsrc` input with `-shortest`,
///    then a raw `s16le` output to `audio_addr`
/// 4. a raw `yuv420p` video output at `framerate` to `video_addr`
///
/// The silent input guarantees the audio output exists even when the
/// source has no audio stream; `-shortest` stops it with the real input.
///
/// # Errors
///
/// Returns `Error::InvalidConfig` if the source expects audio but no audio
/// sink address was allocated.
pub fn build_arguments(
    source: &SourceDescriptor,
    audio_addr: Option<SocketAddr>,
    video_addr: SocketAddr,
    framerate: u32,
) -> Result<Vec<String>> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-y".into()];
    args.extend(source.input_arguments.iter().cloned());

    if source.expects_audio() {
        let audio_addr = audio_addr.ok_or_else(|| {
            Error::InvalidConfig("source expects audio but no audio sink was allocated".into())
        })?;
        args.extend(SILENT_AUDIO_INPUT.iter().map(|s| s.to_string()));
        args.push("-shortest".into());
        args.extend(
            ["-vn", "-acodec", "pcm_s16le", "-f", "s16le"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(tcp_url(audio_addr));
    } else if audio_addr.is_some() {
        tracing::debug!("Ignoring audio sink for a source declared without audio");
    }

    args.extend(["-an", "-r"].iter().map(|s| s.to_string()));
    args.push(framerate.to_string());
    args.extend(
        ["-vcodec", "rawvideo", "-pix_fmt", "yuv420p", "-f", "rawvideo"]
            .iter()
            .map(|s| s.to_string()),
    );
    args.push(tcp_url(video_addr));

    Ok(args)
}
