//! JSON messages exchanged with viewers over WebSocket.
//!
//! Viewers send small request objects; the gateway answers and broadcasts
//! [`GatewayEvent`]s.  Both directions are internally tagged JSON objects
//! whose `"type"` field selects the variant:
//!
//! ```json
//! {"type":"start_stream","stream_type":"mjpeg","quality":"medium"}
//! {"type":"mjpeg_frame","device_id":"rack-3","stream_id":"rack-3_mjpeg",...}
//! ```
//!
//! Serde's `#[serde(tag = "type")]` attribute handles this automatically.
//!
//! # Why separate request enums per channel?
//!
//! The signaling channel and the stream-control channel accept different
//! requests.  Parsing each channel's input into its own enum means an
//! `offer` sent to the stream-control socket is rejected as invalid JSON
//! for that channel rather than silently ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::device::{DeviceId, DeviceStatusReport};
use crate::domain::stream::{StreamConfig, StreamDescriptor, StreamQuality, StreamType};

/// Codecs advertised in `webrtc_init`.
pub const SUPPORTED_CODECS: &[&str] = &["H264", "VP8", "VP9"];

/// Public STUN servers advertised in `webrtc_init`.
pub const STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Placeholder SDP returned for an `offer`; media is negotiated by the unit.
pub const MINIMAL_ANSWER_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

// ── Viewer → gateway ──────────────────────────────────────────────────────────

/// Requests accepted on the `/webrtc/{device_id}` signaling channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingRequest {
    /// Viewer's SDP offer.  The content is not inspected.
    Offer {
        #[serde(default)]
        sdp: Value,
    },
    /// Trickled ICE candidate, echoed back in the acknowledgement.
    IceCandidate {
        #[serde(default)]
        candidate: Value,
    },
    QualityChange {
        #[serde(default)]
        quality: StreamQuality,
    },
}

/// Requests accepted on the `/stream/{device_id}` stream-control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamControlRequest {
    /// Start (or attach to) a stream.  Omitted tuning fields take the
    /// [`StreamConfig`] defaults.
    StartStream {
        #[serde(default)]
        stream_type: StreamType,
        #[serde(default)]
        quality: StreamQuality,
        #[serde(default)]
        fps: Option<u32>,
        #[serde(default)]
        bitrate: Option<u32>,
        #[serde(default)]
        width: Option<u32>,
        #[serde(default)]
        height: Option<u32>,
        #[serde(default)]
        enable_audio: bool,
    },
    /// Stop one stream type, or every stream of the device when absent.
    StopStream {
        #[serde(default)]
        stream_type: Option<StreamType>,
    },
    QualityChange {
        #[serde(default)]
        quality: StreamQuality,
    },
}

impl StreamControlRequest {
    /// Builds the stream config for a `start_stream` request.
    ///
    /// Returns `None` for every other request.
    pub fn start_config(&self, device_id: &str) -> Option<StreamConfig> {
        match self {
            StreamControlRequest::StartStream {
                stream_type,
                quality,
                fps,
                bitrate,
                width,
                height,
                enable_audio,
            } => {
                let mut cfg = StreamConfig::new(device_id).with_type(*stream_type);
                cfg.quality = *quality;
                if let Some(v) = fps {
                    cfg.fps = *v;
                }
                if let Some(v) = bitrate {
                    cfg.bitrate = *v;
                }
                if let Some(v) = width {
                    cfg.width = *v;
                }
                if let Some(v) = height {
                    cfg.height = *v;
                }
                cfg.enable_audio = *enable_audio;
                Some(cfg)
            }
            _ => None,
        }
    }
}

// ── Gateway → viewer ──────────────────────────────────────────────────────────

/// One ICE server entry as the browser's `RTCPeerConnection` expects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: String,
}

/// SDP payload of an `answer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// Everything the gateway sends to viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// First frame on a signaling channel.
    WebrtcInit {
        device_id: DeviceId,
        supported_codecs: Vec<String>,
        ice_servers: Vec<IceServer>,
    },
    Answer {
        device_id: DeviceId,
        sdp: SessionDescription,
    },
    IceCandidateAck {
        device_id: DeviceId,
        candidate: Value,
    },
    /// Heartbeat of an active WebRTC stream.
    WebrtcStatus {
        device_id: DeviceId,
        stream_id: String,
        status: String,
        quality: StreamQuality,
        timestamp: DateTime<Utc>,
    },
    /// Heartbeat of an active H.264 stream.
    H264Status {
        device_id: DeviceId,
        stream_id: String,
        status: String,
        bitrate: u32,
        resolution: String,
        fps: u32,
        timestamp: DateTime<Utc>,
    },
    /// One polled MJPEG frame, base64-encoded.
    MjpegFrame {
        device_id: DeviceId,
        stream_id: String,
        image_data: String,
        content_type: String,
        timestamp: DateTime<Utc>,
    },
    /// A stream iteration failed; the stream keeps running.
    StreamError {
        device_id: DeviceId,
        stream_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    QualityChanged {
        device_id: DeviceId,
        old_quality: StreamQuality,
        new_quality: StreamQuality,
        timestamp: DateTime<Utc>,
    },
    StreamStarted {
        device_id: DeviceId,
        stream: StreamDescriptor,
    },
    StreamStopped {
        device_id: DeviceId,
        stopped_streams: Vec<StreamType>,
    },
    /// Periodic reachability report published on the device event bus.
    DeviceStatus { report: DeviceStatusReport },
    /// Someone joined or left a room.
    RoomPresence {
        room_id: String,
        user: String,
        joined: bool,
        members: usize,
    },
    /// Sent only to the viewer whose request could not be handled.
    Error { message: String },
}

impl GatewayEvent {
    /// The `webrtc_init` frame for `device_id`.
    pub fn webrtc_init(device_id: impl Into<DeviceId>) -> Self {
        GatewayEvent::WebrtcInit {
            device_id: device_id.into(),
            supported_codecs: SUPPORTED_CODECS.iter().map(|c| c.to_string()).collect(),
            ice_servers: STUN_SERVERS
                .iter()
                .map(|u| IceServer { urls: u.to_string() })
                .collect(),
        }
    }

    /// The fixed `answer` frame for `device_id`.
    pub fn answer(device_id: impl Into<DeviceId>) -> Self {
        GatewayEvent::Answer {
            device_id: device_id.into(),
            sdp: SessionDescription {
                kind: "answer".to_string(),
                sdp: MINIMAL_ANSWER_SDP.to_string(),
            },
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        GatewayEvent::Error {
            message: message.into(),
        }
    }

    /// The `"type"` tag of this event, used for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            GatewayEvent::WebrtcInit { .. } => "webrtc_init",
            GatewayEvent::Answer { .. } => "answer",
            GatewayEvent::IceCandidateAck { .. } => "ice_candidate_ack",
            GatewayEvent::WebrtcStatus { .. } => "webrtc_status",
            GatewayEvent::H264Status { .. } => "h264_status",
            GatewayEvent::MjpegFrame { .. } => "mjpeg_frame",
            GatewayEvent::StreamError { .. } => "stream_error",
            GatewayEvent::QualityChanged { .. } => "quality_changed",
            GatewayEvent::StreamStarted { .. } => "stream_started",
            GatewayEvent::StreamStopped { .. } => "stream_stopped",
            GatewayEvent::DeviceStatus { .. } => "device_status",
            GatewayEvent::RoomPresence { .. } => "room_presence",
            GatewayEvent::Error { .. } => "error",
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
