//! Wire schema for the rendezvous signaling channel.
//!
//! Every frame carried by the relay is a JSON object tagged by `type`. The
//! relay never looks inside a frame; agents decode with
//! [`SignalMessage::decode`] and drop whatever fails validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A single signaling frame exchanged between two agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { ice: IceCandidate },
    Close,
}

/// One trickled network candidate.
///
/// Field names follow the browser `RTCIceCandidateInit` JSON shape so that
/// frames produced by web clients decode unchanged. Any field this crate does
/// not know about is carried in `extra` and re-emitted verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
            extra: Map::new(),
        }
    }

    pub fn with_mid(mut self, sdp_mid: impl Into<String>, sdp_mline_index: u16) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self.sdp_mline_index = Some(sdp_mline_index);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Offer,
    Answer,
    Candidate,
    Close,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::Candidate => "candidate",
            MessageKind::Close => "close",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "offer" => Some(MessageKind::Offer),
            "answer" => Some(MessageKind::Answer),
            "candidate" => Some(MessageKind::Candidate),
            "close" => Some(MessageKind::Close),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons an inbound frame is refused by an agent.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid json: {0}")]
    Json(#[source] serde_json::Error),
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("malformed {kind} message: {source}")]
    Schema {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} message carries an empty session description")]
    EmptyDescription(MessageKind),
}

impl DecodeError {
    /// Unknown types are expected noise from newer peers and are only logged.
    pub fn is_unknown_type(&self) -> bool {
        matches!(self, DecodeError::UnknownType(_))
    }
}

impl SignalMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            SignalMessage::Offer { .. } => MessageKind::Offer,
            SignalMessage::Answer { .. } => MessageKind::Answer,
            SignalMessage::Candidate { .. } => MessageKind::Candidate,
            SignalMessage::Close => MessageKind::Close,
        }
    }

    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text).map_err(DecodeError::Json)?;
        Self::from_value(value)
    }

    pub fn decode_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(bytes).map_err(DecodeError::Json)?;
        Self::from_value(value)
    }

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        let kind = {
            let tag = value
                .get("type")
                .and_then(Value::as_str)
                .ok_or(DecodeError::MissingType)?;
            MessageKind::parse(tag).ok_or_else(|| DecodeError::UnknownType(tag.to_string()))?
        };
        let message: SignalMessage = serde_json::from_value(value)
            .map_err(|source| DecodeError::Schema { kind, source })?;
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> Result<(), DecodeError> {
        match self {
            SignalMessage::Offer { sdp } | SignalMessage::Answer { sdp }
                if sdp.trim().is_empty() =>
            {
                Err(DecodeError::EmptyDescription(self.kind()))
            }
            _ => Ok(()),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
