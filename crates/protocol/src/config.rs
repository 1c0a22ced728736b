use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub ice: IceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Signaling WebSocket URL (ws:// or wss://)
    #[serde(default = "default_signaling_url")]
    pub url: String,
    /// PEM certificate to pin for wss:// connections (system roots otherwise)
    pub tls_cert: Option<String>,
    /// Largest inbound signaling message accepted, in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// "auto" (first camera), "test" (synthetic pattern) or a device name substring
    #[serde(default = "default_device")]
    pub device: String,
    /// Target width in pixels
    #[serde(default = "default_width")]
    pub width: u32,
    /// Target height in pixels
    #[serde(default = "default_height")]
    pub height: u32,
    /// Minimum acceptable device frame rate
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    /// Pixel subtype requested from the device: NV12, I420, YUY2 or BGRA
    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Force a specific encoder: "nvh264enc", "vah264enc", "x264enc"
    pub encoder: Option<String>,
    /// Target bitrate in kbps
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Frames between forced keyframes
    #[serde(default = "default_keyframe_interval")]
    pub keyframe_interval: u32,
    /// How long one encode call may wait for output before reporting none
    #[serde(default = "default_encode_timeout_ms")]
    pub encode_timeout_ms: u64,
}

/// ICE/TURN server configuration for NAT traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN server)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: default_signaling_url(),
            tls_cert: None,
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            width: default_width(),
            height: default_height(),
            framerate: default_framerate(),
            pixel_format: default_pixel_format(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            encoder: None,
            bitrate: default_bitrate(),
            keyframe_interval: default_keyframe_interval(),
            encode_timeout_ms: default_encode_timeout_ms(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

pub const SUPPORTED_PIXEL_FORMATS: [&str; 4] = ["NV12", "I420", "YUY2", "BGRA"];

const KNOWN_ENCODERS: [&str; 3] = ["nvh264enc", "vah264enc", "x264enc"];

impl RelayConfig {
    /// Read and parse a TOML config file. Missing sections take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the agent should not start)
    /// or "WARNING:" (advisory).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- Signaling ---
        if !self.signaling.url.starts_with("ws://") && !self.signaling.url.starts_with("wss://") {
            issues.push(format!(
                "ERROR: signaling.url '{}' must start with 'ws://' or 'wss://'.",
                self.signaling.url
            ));
        }
        if self.signaling.tls_cert.is_some() && self.signaling.url.starts_with("ws://") {
            issues.push(
                "WARNING: signaling.tls_cert is set but signaling.url is not wss://; \
                 the certificate will not be used."
                    .to_string(),
            );
        }
        if self.signaling.max_message_size < 1024 {
            issues.push(format!(
                "ERROR: signaling.max_message_size must be at least 1024 bytes, got {}.",
                self.signaling.max_message_size
            ));
        }

        // --- Capture ---
        if self.capture.device.trim().is_empty() {
            issues.push(
                "ERROR: capture.device must be \"auto\", \"test\" or a device name.".to_string(),
            );
        }
        for (name, value) in [("width", self.capture.width), ("height", self.capture.height)] {
            if value == 0 {
                issues.push(format!("ERROR: capture.{name} must be non-zero."));
            } else if value % 2 != 0 {
                issues.push(format!(
                    "ERROR: capture.{name} must be even for 4:2:0 formats, got {value}."
                ));
            }
        }
        if self.capture.framerate == 0 || self.capture.framerate > 240 {
            issues.push(format!(
                "ERROR: capture.framerate must be between 1 and 240, got {}.",
                self.capture.framerate
            ));
        }
        if !SUPPORTED_PIXEL_FORMATS
            .iter()
            .any(|f| f.eq_ignore_ascii_case(&self.capture.pixel_format))
        {
            issues.push(format!(
                "ERROR: capture.pixel_format '{}' is not supported. Use one of: {}.",
                self.capture.pixel_format,
                SUPPORTED_PIXEL_FORMATS.join(", ")
            ));
        }

        // --- Encoder ---
        if let Some(ref encoder) = self.encoder.encoder
            && !KNOWN_ENCODERS.contains(&encoder.as_str())
        {
            issues.push(format!(
                "ERROR: encoder.encoder '{}' is unknown. Use nvh264enc, vah264enc or x264enc.",
                encoder
            ));
        }
        if self.encoder.bitrate == 0 {
            issues.push("ERROR: encoder.bitrate must be non-zero.".to_string());
        } else if self.encoder.bitrate > 100_000 {
            issues.push(format!(
                "WARNING: encoder.bitrate is {} kbps ({} Mbps), which is unusually high \
                 and may indicate a misconfiguration.",
                self.encoder.bitrate,
                self.encoder.bitrate / 1000
            ));
        }
        if self.encoder.keyframe_interval == 0 {
            issues.push("ERROR: encoder.keyframe_interval must be at least 1.".to_string());
        }
        if self.encoder.encode_timeout_ms == 0 {
            issues.push("ERROR: encoder.encode_timeout_ms must be non-zero.".to_string());
        }

        // --- ICE URLs ---
        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'.",
                    url
                ));
            }
        }
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'.",
                    url
                ));
            }
        }
        if self.ice.turn_username.is_some() != self.ice.turn_credential.is_some() {
            issues.push(
                "WARNING: ice.turn_username and ice.turn_credential should be set together."
                    .to_string(),
            );
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

fn default_signaling_url() -> String {
    "ws://localhost:8081/signaling".to_string()
}
fn default_max_message_size() -> usize {
    65_536
}
fn default_device() -> String {
    "auto".to_string()
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_framerate() -> u32 {
    30
}
fn default_pixel_format() -> String {
    "NV12".to_string()
}
fn default_bitrate() -> u32 {
    240
}
fn default_keyframe_interval() -> u32 {
    10
}
fn default_encode_timeout_ms() -> u64 {
    200
}
fn default_stun_urls() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}
