//! Integration test harness
//!
//! Provides a [`SignalingHandler`] over the in-memory engine and fake
//! `ffmpeg` executables (shell scripts) that print the stream lines the
//! output probe looks for.

#![allow(dead_code)]

use remotemedia_ffmpeg_webrtc::peer::memory::MemoryConnection;
use remotemedia_ffmpeg_webrtc::signaling::IceCandidate;
use remotemedia_ffmpeg_webrtc::{BridgeConfig, MemoryEngine, SignalingHandler, SourceDescriptor};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tempfile::TempDir;

/// Stream description lines printed by every fake transcoder
const STREAM_LINES: &str = r#"echo "  Stream #0:0: Video: rawvideo (I420 / 0x30323449), yuv420p, 16x16, q=2-31, 15 fps" >&2
echo "  Stream #0:1: Audio: pcm_s16le, 48000 Hz, stereo, s16, 1536 kb/s" >&2"#;

/// Fake transcoder behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFfmpeg {
    /// Prints stream lines, then runs until killed
    LongRunning,
    /// Prints stream lines, then exits after one second
    ExitsSoon,
}

struct Scripts {
    _dir: TempDir,
    long_running: PathBuf,
    exits_soon: PathBuf,
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n{}\n", STREAM_LINES, body))
        .expect("Failed to write fake ffmpeg");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("Failed to make fake ffmpeg executable");
    path
}

// Written once per test binary, before any test spawns a process from them
fn scripts() -> &'static Scripts {
    static SCRIPTS: OnceLock<Scripts> = OnceLock::new();
    SCRIPTS.get_or_init(|| {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let long_running = write_script(dir.path(), "ffmpeg-long", "exec sleep 3600");
        let exits_soon = write_script(dir.path(), "ffmpeg-exit", "sleep 1\nexit 0");
        Scripts {
            _dir: dir,
            long_running,
            exits_soon,
        }
    })
}

impl FakeFfmpeg {
    pub fn path(self) -> &'static Path {
        match self {
            FakeFfmpeg::LongRunning => &scripts().long_running,
            FakeFfmpeg::ExitsSoon => &scripts().exits_soon,
        }
    }
}

/// Initialize logging once; later calls are no-ops
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Handler wired to a [`MemoryEngine`] and a fake transcoder
pub struct BridgeHarness {
    pub engine: Arc<MemoryEngine>,
    pub handler: Arc<SignalingHandler>,
}

impl BridgeHarness {
    pub fn new(ffmpeg: FakeFfmpeg) -> Self {
        Self::with_config(ffmpeg, |config| config)
    }

    pub fn with_config(ffmpeg: FakeFfmpeg, adjust: impl FnOnce(BridgeConfig) -> BridgeConfig) -> Self {
        init_logging();
        let config = adjust(
            BridgeConfig::default()
                .with_ffmpeg_path(ffmpeg.path())
                .with_kill_grace(Duration::from_millis(200)),
        );
        let engine = Arc::new(MemoryEngine::new());
        let handler = SignalingHandler::new(engine.clone(), config)
            .expect("Failed to create signaling handler");
        Self {
            engine,
            handler: Arc::new(handler),
        }
    }

    /// Connection created for the most recent session
    pub fn connection(&self) -> Arc<MemoryConnection> {
        self.engine
            .last_connection()
            .expect("No connection has been created")
    }
}

pub fn test_source() -> SourceDescriptor {
    SourceDescriptor::new(["-re", "-i", "test.mp4"])
}

pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate::new(
        format!("candidate:{} 1 udp 2122260223 192.168.1.{} 5000{} typ host", n, n, n),
        Some("0".to_string()),
        Some(0),
    )
}
