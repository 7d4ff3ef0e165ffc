//! Wire protocol frame types.
//!
//! Every message exchanged with the rendezvous service and between peers is a
//! JSON object tagged by its `type` field. Direct sockets prefix each frame
//! with a 4-byte big-endian length header; WebSocket and data-channel links
//! carry one frame per message.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum single frame size on a direct socket (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Errors from the framing codec.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
}

impl From<WireError> for realm_types::RealmError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Io(e) => Self::Io(e.to_string()),
            WireError::ConnectionClosed => Self::Io("connection closed".into()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

/// Session description kind carried in a signaling frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An opaque session description (offer or answer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// An opaque connectivity candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// A wire frame. One variant per `type` value; anything else fails to parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Announce this instance to the rendezvous service.
    #[serde(rename = "register", rename_all = "camelCase")]
    Register {
        call_sign: String,
        #[serde(default)]
        address: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Registration acknowledgement.
    #[serde(rename = "registered", rename_all = "camelCase")]
    Registered { call_sign: String },
    /// Liveness ping to the rendezvous service.
    #[serde(rename = "heartbeat", rename_all = "camelCase")]
    Heartbeat { call_sign: String },
    /// Re-registration with a changed address.
    #[serde(rename = "update", rename_all = "camelCase")]
    Update {
        call_sign: String,
        #[serde(default)]
        address: Option<String>,
    },
    /// Ask the rendezvous service about a peer.
    #[serde(rename = "getPeer", rename_all = "camelCase")]
    GetPeer { target: String, request_id: String },
    /// Answer to `getPeer`.
    #[serde(rename = "peerInfo", rename_all = "camelCase")]
    PeerInfo {
        request_id: String,
        online: bool,
        #[serde(default)]
        address: Option<String>,
    },
    /// Negotiation payload relayed between two peers.
    #[serde(rename = "webrtc-signal")]
    Signal {
        to: String,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp: Option<SessionDescription>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        candidate: Option<IceCandidate>,
    },
    /// Fire-and-forget event.
    #[serde(rename = "beam", rename_all = "camelCase")]
    Beam {
        event_type: String,
        #[serde(default)]
        payload: Value,
        from: String,
    },
    /// Request expecting a `response`.
    #[serde(rename = "query", rename_all = "camelCase")]
    Query {
        query_type: String,
        #[serde(default)]
        payload: Value,
        request_id: String,
        from: String,
    },
    /// Answer to a `query`.
    #[serde(rename = "response", rename_all = "camelCase")]
    Response {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// First frame on a direct socket: declares the sender's call sign.
    #[serde(rename = "hello", rename_all = "camelCase")]
    Hello { call_sign: String },
    /// Acknowledges `hello` with the listener's call sign.
    #[serde(rename = "helloAck", rename_all = "camelCase")]
    HelloAck { call_sign: String },
    /// Rejection from the rendezvous service.
    #[serde(rename = "error")]
    Error { message: String },
}

impl Frame {
    /// The `type` tag of this frame, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Register { .. } => "register",
            Frame::Registered { .. } => "registered",
            Frame::Heartbeat { .. } => "heartbeat",
            Frame::Update { .. } => "update",
            Frame::GetPeer { .. } => "getPeer",
            Frame::PeerInfo { .. } => "peerInfo",
            Frame::Signal { .. } => "webrtc-signal",
            Frame::Beam { .. } => "beam",
            Frame::Query { .. } => "query",
            Frame::Response { .. } => "response",
            Frame::Hello { .. } => "hello",
            Frame::HelloAck { .. } => "helloAck",
            Frame::Error { .. } => "error",
        }
    }
}

/// Serialize a frame to a JSON string (WebSocket / data channel form).
pub fn to_json(frame: &Frame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

/// Parse a JSON frame. Unknown `type` values and missing fields are errors.
pub fn from_json(text: &[u8]) -> Result<Frame, serde_json::Error> {
    serde_json::from_slice(text)
}

/// Encode a frame for a direct socket (4-byte big-endian length + JSON).
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(frame)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}
