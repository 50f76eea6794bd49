//! Configuration types for the FFmpeg → WebRTC bridge

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Frame rate the transcoder is asked to emit raw video at
pub const DEFAULT_VIDEO_FRAMERATE: u32 = 15;

/// How long a session may take to reach `connected`
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 60_000;

/// Delay between SIGTERM and SIGKILL in the transcoder kill sequence
pub const DEFAULT_KILL_GRACE_MS: u64 = 1_000;

/// How long the transcoder output may go without announcing a format
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 15_000;

/// Main configuration for the bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// FFmpeg executable (resolved through `PATH` when relative)
    pub ffmpeg_path: PathBuf,

    /// Address the raw-stream listeners bind to (default: 127.0.0.1)
    pub listen_host: String,

    /// ICE servers used when a signaling message carries no configuration
    pub ice_servers: Vec<IceServerConfig>,

    /// Raw video output frame rate (default: 15)
    pub video_framerate: u32,

    /// Connect deadline in milliseconds (default: 60000)
    pub connect_timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL in milliseconds (default: 1000)
    pub kill_grace_ms: u64,

    /// Maximum wait for resolution / sample format in the transcoder output (default: 15000)
    pub probe_timeout_ms: u64,
}

/// STUN/TURN server entry, serialized the way browsers expect `RTCIceServer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServerConfig {
    /// Server URLs (stun:, stuns:, turn: or turns:)
    pub urls: Vec<String>,

    /// Username for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Credential for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// TURN server with static credentials
    pub fn turn(
        urls: Vec<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls,
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            listen_host: "127.0.0.1".to_string(),
            ice_servers: vec![IceServerConfig::stun("stun:stun.l.google.com:19302")],
            video_framerate: DEFAULT_VIDEO_FRAMERATE,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
        }
    }
}

impl BridgeConfig {
    /// Load a configuration from a JSON file
    ///
    /// Missing fields fall back to their defaults. The result is validated.
    pub fn from_json_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `ffmpeg_path` is empty
    /// - `listen_host` is not an IP address
    /// - `video_framerate` is not in range 1-120
    /// - any timeout is zero
    /// - an ICE server has no URLs or an unsupported URL scheme
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.ffmpeg_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("ffmpeg_path must not be empty".to_string()));
        }

        self.listen_ip()?;

        if self.video_framerate == 0 || self.video_framerate > 120 {
            return Err(Error::InvalidConfig(format!(
                "video_framerate must be in range 1-120, got {}",
                self.video_framerate
            )));
        }

        if self.connect_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.kill_grace_ms == 0 {
            return Err(Error::InvalidConfig(
                "kill_grace_ms must be greater than 0".to_string(),
            ));
        }

        if self.probe_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "probe_timeout_ms must be greater than 0".to_string(),
            ));
        }

        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(Error::InvalidConfig(
                    "ICE server entry without urls".to_string(),
                ));
            }
            for url in &server.urls {
                let known = ["stun:", "stuns:", "turn:", "turns:"]
                    .iter()
                    .any(|scheme| url.starts_with(scheme));
                if !known {
                    return Err(Error::InvalidConfig(format!(
                        "ICE server url must start with stun:, stuns:, turn: or turns:, got {}",
                        url
                    )));
                }
            }
        }

        Ok(())
    }

    /// Listener bind address
    pub fn listen_ip(&self) -> crate::Result<IpAddr> {
        self.listen_host.parse().map_err(|_| {
            crate::Error::InvalidConfig(format!(
                "listen_host must be an IP address, got {}",
                self.listen_host
            ))
        })
    }

    /// Connect deadline as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Kill grace period as a `Duration`
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Probe timeout as a `Duration`
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Set the FFmpeg executable
    pub fn with_ffmpeg_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ffmpeg_path = path.into();
        self
    }

    /// Replace the default ICE servers
    pub fn with_ice_servers(mut self, ice_servers: Vec<IceServerConfig>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    /// Set the connect deadline
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the probe timeout
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the kill grace period
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace_ms = grace.as_millis() as u64;
        self
    }
}
