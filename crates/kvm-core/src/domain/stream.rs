//! Stream configuration, identity and lifecycle.
//!
//! The gateway never touches pixels.  A "stream" here is a supervised
//! background loop that either polls snapshots (MJPEG) or publishes status
//! heartbeats (WebRTC / H.264) while the remote unit delivers the media
//! itself.  These types describe which loops exist and how they are tuned.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::device::DeviceId;

/// Delivery mechanism of a stream.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    #[default]
    Webrtc,
    Mjpeg,
    H264,
}

impl StreamType {
    pub const ALL: [StreamType; 3] = [StreamType::Webrtc, StreamType::Mjpeg, StreamType::H264];

    pub fn as_str(self) -> &'static str {
        match self {
            StreamType::Webrtc => "webrtc",
            StreamType::Mjpeg => "mjpeg",
            StreamType::H264 => "h264",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quality tier requested by a viewer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamQuality {
    Low,
    #[default]
    Medium,
    High,
    Auto,
}

impl StreamQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamQuality::Low => "low",
            StreamQuality::Medium => "medium",
            StreamQuality::High => "high",
            StreamQuality::Auto => "auto",
        }
    }

    /// JPEG quality (0-100) pushed to the unit's streamer for this tier.
    pub fn jpeg_quality(self) -> u8 {
        match self {
            StreamQuality::Low => 50,
            StreamQuality::Medium | StreamQuality::Auto => 80,
            StreamQuality::High => 95,
        }
    }
}

impl fmt::Display for StreamQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Configuration ─────────────────────────────────────────────────────────────

fn default_fps() -> u32 {
    30
}

fn default_bitrate() -> u32 {
    2000
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

/// Tuning for one stream.  Bitrate is in kbps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub device_id: DeviceId,
    #[serde(default)]
    pub stream_type: StreamType,
    #[serde(default)]
    pub quality: StreamQuality,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default)]
    pub enable_audio: bool,
}

impl StreamConfig {
    /// A config with every field at its default for the given device.
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: device_id.into(),
            stream_type: StreamType::default(),
            quality: StreamQuality::default(),
            fps: default_fps(),
            bitrate: default_bitrate(),
            width: default_width(),
            height: default_height(),
            enable_audio: false,
        }
    }

    pub fn with_type(mut self, stream_type: StreamType) -> Self {
        self.stream_type = stream_type;
        self
    }

    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.device_id.clone(), self.stream_type)
    }

    /// Returns `"{width}x{height}"`.
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    /// Interval between MJPEG polls.  An fps of zero is treated as one.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }
}

/// Identity of an active stream: one per (device, type) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub device_id: DeviceId,
    pub stream_type: StreamType,
}

impl StreamKey {
    pub fn new(device_id: impl Into<DeviceId>, stream_type: StreamType) -> Self {
        Self {
            device_id: device_id.into(),
            stream_type,
        }
    }

    /// Returns `"{device_id}_{stream_type}"`.
    pub fn stream_id(&self) -> String {
        format!("{}_{}", self.device_id, self.stream_type)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.device_id, self.stream_type)
    }
}

/// Lifecycle of an active stream.  Absent keys have no state at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Starting,
    Active,
    Stopping,
}

/// Public URL a viewer uses to pull the media for a stream.
pub fn stream_url(stream_type: StreamType, stream_id: &str) -> String {
    match stream_type {
        StreamType::Webrtc => format!("/api/webrtc/{stream_id}"),
        StreamType::Mjpeg => format!("/api/stream/mjpeg/{stream_id}"),
        StreamType::H264 => format!("/api/stream/h264/{stream_id}"),
    }
}

/// Snapshot of an active stream as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub stream_id: String,
    pub device_id: DeviceId,
    pub stream_type: StreamType,
    pub quality: StreamQuality,
    pub fps: u32,
    pub bitrate: u32,
    pub resolution: String,
    pub subscriber_count: usize,
    pub stream_url: String,
    /// WebSocket path for SDP / ICE exchange; only set for WebRTC.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signaling_path: Option<String>,
    pub state: StreamState,
    /// True when `start_stream` found the stream already running.
    pub already_active: bool,
}

impl StreamDescriptor {
    pub fn from_config(config: &StreamConfig, state: StreamState, subscriber_count: usize) -> Self {
        let stream_id = config.key().stream_id();
        let signaling_path = match config.stream_type {
            StreamType::Webrtc => Some(format!("/webrtc/{}", config.device_id)),
            _ => None,
        };
        Self {
            stream_url: stream_url(config.stream_type, &stream_id),
            stream_id,
            device_id: config.device_id.clone(),
            stream_type: config.stream_type,
            quality: config.quality,
            fps: config.fps,
            bitrate: config.bitrate,
            resolution: config.resolution(),
            subscriber_count,
            signaling_path,
            state,
            already_active: false,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
