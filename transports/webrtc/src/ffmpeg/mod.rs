//! Transcoder process management
//!
//! - [`args`]: command line for raw PCM + raw I420 TCP outputs
//! - [`probe`]: resolution / sample format discovery from FFmpeg's output
//! - [`process`]: spawn, output scanning, exit monitoring, kill sequence

pub mod args;
pub mod probe;
pub mod process;

pub use args::build_arguments;
pub use probe::OutputProbe;
pub use process::{ExitReason, TranscoderProcess};
