//! JSON message protocol for the streaming connection.
//!
//! Every inbound frame carries an explicit `type` discriminator and is
//! validated into a closed tagged union at the connection boundary, before
//! anything else sees it. Unknown types and malformed payloads are reported
//! separately so the caller can log and drop them without tearing down the
//! connection.

use serde::{Deserialize, Serialize};

/// Requests sent by the client to the generation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Request narration (and images) for one paragraph.
    Tts { text: String, paragraph_number: u32 },
    /// Request a video clip for one paragraph, seeded with an image.
    Video {
        task_id: String,
        text: String,
        paragraph_number: u32,
        image_base64: String,
    },
    /// Liveness probe.
    Ping,
}

impl ClientRequest {
    /// Serialize request to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Base64 audio payload of a `tts_result` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioPayload {
    /// Base64-encoded audio bytes.
    pub data: String,
}

/// One image variant inside an `image_result` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageDatum {
    pub b64_json: String,
}

/// Payload of an `image_result` frame. `data` may hold several same-paragraph
/// variants (a carousel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePayload {
    pub data: Vec<ImageDatum>,
    #[serde(default)]
    pub output_format: Option<String>,
}

/// Frames received from the generation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Free-form processing status.
    Status {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        paragraph_number: Option<u32>,
    },
    /// One narrated audio fragment of a paragraph.
    TtsResult {
        data: AudioPayload,
        paragraph_number: u32,
        #[serde(default)]
        sequence_number: u32,
    },
    /// One or more illustrative images for a paragraph.
    ImageResult {
        data: ImagePayload,
        paragraph_number: u32,
        #[serde(default)]
        sequence_number: u32,
    },
    /// Finished video clip for a paragraph.
    VideoResult {
        video_url: String,
        paragraph_number: u32,
    },
    /// Real progress report for an in-flight video generation.
    VideoProgress {
        #[serde(default)]
        progress: u8,
        paragraph_number: u32,
    },
    /// Remote-side generation error, optionally scoped to a paragraph and a
    /// fragment sequence number.
    Error {
        message: String,
        #[serde(default)]
        paragraph_number: Option<u32>,
        #[serde(default)]
        sequence_number: Option<u32>,
    },
    /// The service finished processing the whole task.
    Complete {
        #[serde(default)]
        message: Option<String>,
    },
    /// Heartbeat acknowledgment, consumed by the connection manager.
    Pong,
}

/// Message type label used as the routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Status,
    TtsResult,
    ImageResult,
    VideoResult,
    VideoProgress,
    Error,
    Complete,
    Pong,
}

impl FrameKind {
    /// All frame kinds routable to subscribers (everything except the
    /// connection-internal heartbeat acknowledgment).
    pub const ROUTABLE: [FrameKind; 7] = [
        FrameKind::Status,
        FrameKind::TtsResult,
        FrameKind::ImageResult,
        FrameKind::VideoResult,
        FrameKind::VideoProgress,
        FrameKind::Error,
        FrameKind::Complete,
    ];

    /// Parse the wire label of a frame kind.
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "status" => Some(FrameKind::Status),
            "tts_result" => Some(FrameKind::TtsResult),
            "image_result" => Some(FrameKind::ImageResult),
            "video_result" => Some(FrameKind::VideoResult),
            "video_progress" => Some(FrameKind::VideoProgress),
            "error" => Some(FrameKind::Error),
            "complete" => Some(FrameKind::Complete),
            "pong" => Some(FrameKind::Pong),
            _ => None,
        }
    }

    /// Wire label of this frame kind.
    pub fn label(&self) -> &'static str {
        match self {
            FrameKind::Status => "status",
            FrameKind::TtsResult => "tts_result",
            FrameKind::ImageResult => "image_result",
            FrameKind::VideoResult => "video_result",
            FrameKind::VideoProgress => "video_progress",
            FrameKind::Error => "error",
            FrameKind::Complete => "complete",
            FrameKind::Pong => "pong",
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl ServerFrame {
    /// The routing key of this frame.
    pub fn kind(&self) -> FrameKind {
        match self {
            ServerFrame::Status { .. } => FrameKind::Status,
            ServerFrame::TtsResult { .. } => FrameKind::TtsResult,
            ServerFrame::ImageResult { .. } => FrameKind::ImageResult,
            ServerFrame::VideoResult { .. } => FrameKind::VideoResult,
            ServerFrame::VideoProgress { .. } => FrameKind::VideoProgress,
            ServerFrame::Error { .. } => FrameKind::Error,
            ServerFrame::Complete { .. } => FrameKind::Complete,
            ServerFrame::Pong => FrameKind::Pong,
        }
    }
}

/// Why a raw frame was rejected at the boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameError {
    /// The `type` label is not one we recognize. Logged and dropped.
    #[error("unrecognized message type: {0}")]
    UnknownType(String),
    /// The frame is not valid JSON, lacks a `type`, or has an invalid payload
    /// for its declared type. Logged and dropped.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Validate one raw text frame into a [`ServerFrame`].
///
/// Distinguishes unknown types from malformed payloads so callers can log
/// them differently; neither is fatal to the connection.
pub fn parse_frame(raw: &str) -> Result<ServerFrame, FrameError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| FrameError::Malformed(e.to_string()))?;

    let label = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| FrameError::Malformed("missing type discriminator".to_string()))?;

    if FrameKind::from_label(label).is_none() {
        return Err(FrameError::UnknownType(label.to_string()));
    }

    serde_json::from_value(value).map_err(|e| FrameError::Malformed(e.to_string()))
}
