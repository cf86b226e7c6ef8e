//! Signaling message codec.
//!
//! Messages travel through the relay as node-dss JSON frames:
//! `{"MessageType": "offer", "Data": "<sdp>", "IceDataSeparator": "|"}`.
//! ICE candidates pack three fields into `Data` as
//! `candidate|sdpMlineIndex|sdpMid`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::CodecError;

/// Separator between the three ICE payload fields.
pub const ICE_DATA_SEPARATOR: char = '|';

const OFFER_TAG: &str = "offer";
const ANSWER_TAG: &str = "answer";
const ICE_TAG: &str = "ice";

/// Session description flavour handed to and reported by the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => OFFER_TAG,
            SdpKind::Answer => ANSWER_TAG,
        }
    }
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Offer,
    Answer,
    IceCandidate,
}

impl MessageKind {
    /// Tag written into `MessageType`.
    pub fn as_tag(&self) -> &'static str {
        match self {
            MessageKind::Offer => OFFER_TAG,
            MessageKind::Answer => ANSWER_TAG,
            MessageKind::IceCandidate => ICE_TAG,
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            OFFER_TAG => Some(MessageKind::Offer),
            ANSWER_TAG => Some(MessageKind::Answer),
            ICE_TAG => Some(MessageKind::IceCandidate),
            _ => None,
        }
    }

    /// Numeric codes used by signalers that serialize the type as an enum
    /// (`Unknown = 0, Offer, Answer, Ice`).
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(MessageKind::Offer),
            2 => Some(MessageKind::Answer),
            3 => Some(MessageKind::IceCandidate),
            _ => None,
        }
    }
}

impl From<SdpKind> for MessageKind {
    fn from(kind: SdpKind) -> Self {
        match kind {
            SdpKind::Offer => MessageKind::Offer,
            SdpKind::Answer => MessageKind::Answer,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Parsed ICE candidate as exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IceCandidateDescriptor {
    candidate: String,
    sdp_mline_index: u32,
    sdp_mid: String,
}

impl IceCandidateDescriptor {
    pub fn new(
        candidate: impl Into<String>,
        sdp_mline_index: u32,
        sdp_mid: impl Into<String>,
    ) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mline_index,
            sdp_mid: sdp_mid.into(),
        }
    }

    pub fn candidate(&self) -> &str {
        &self.candidate
    }

    pub fn sdp_mline_index(&self) -> u32 {
        self.sdp_mline_index
    }

    pub fn sdp_mid(&self) -> &str {
        &self.sdp_mid
    }

    /// Join the fields into the wire payload.
    ///
    /// Fields containing the separator are rejected rather than escaped so the
    /// payload stays readable by peers that split on `|` naively.
    pub fn encode_payload(&self) -> Result<String, CodecError> {
        if self.candidate.is_empty() {
            return Err(CodecError::EmptyCandidate);
        }
        if self.candidate.contains(ICE_DATA_SEPARATOR) {
            return Err(CodecError::DelimiterInField { field: "candidate" });
        }
        if self.sdp_mid.contains(ICE_DATA_SEPARATOR) {
            return Err(CodecError::DelimiterInField { field: "sdp_mid" });
        }
        Ok(format!(
            "{}{sep}{}{sep}{}",
            self.candidate,
            self.sdp_mline_index,
            self.sdp_mid,
            sep = ICE_DATA_SEPARATOR
        ))
    }

    /// Split a wire payload back into its three fields.
    pub fn parse_payload(payload: &str) -> Result<Self, CodecError> {
        let parts: Vec<&str> = payload.split(ICE_DATA_SEPARATOR).collect();
        if parts.len() != 3 {
            return Err(CodecError::FieldCount(parts.len()));
        }
        let candidate = parts[0];
        if candidate.is_empty() {
            return Err(CodecError::EmptyCandidate);
        }
        let sdp_mline_index = parts[1]
            .trim()
            .parse::<u32>()
            .map_err(|_| CodecError::InvalidMlineIndex(parts[1].to_string()))?;
        Ok(Self::new(candidate, sdp_mline_index, parts[2]))
    }
}

/// One signaling message: a kind plus its opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    pub kind: MessageKind,
    pub payload: String,
}

impl SignalingMessage {
    pub fn new(kind: MessageKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn description(kind: SdpKind, sdp: impl Into<String>) -> Self {
        Self::new(kind.into(), sdp)
    }

    pub fn ice_candidate(candidate: &IceCandidateDescriptor) -> Result<Self, CodecError> {
        Ok(Self::new(MessageKind::IceCandidate, candidate.encode_payload()?))
    }

    /// Parse the payload of an `IceCandidate` message.
    pub fn to_candidate(&self) -> Result<IceCandidateDescriptor, CodecError> {
        if self.kind != MessageKind::IceCandidate {
            return Err(CodecError::UnexpectedKind {
                expected: MessageKind::IceCandidate,
                found: self.kind,
            });
        }
        IceCandidateDescriptor::parse_payload(&self.payload)
    }

    pub fn to_json(&self) -> Result<String, CodecError> {
        serde_json::to_string(&WireMessage::from(self)).map_err(|e| CodecError::Json(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, CodecError> {
        let wire: WireMessage =
            serde_json::from_str(text).map_err(|e| CodecError::Json(e.to_string()))?;
        Self::try_from(wire)
    }
}

/// `MessageType` as found on the wire: a string tag or a numeric enum code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireKind {
    Tag(String),
    Code(u64),
}

/// JSON frame understood by node-dss style relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "MessageType")]
    pub message_type: WireKind,
    #[serde(rename = "Data", default)]
    pub data: String,
    #[serde(rename = "IceDataSeparator", default)]
    pub ice_data_separator: String,
}

impl From<&SignalingMessage> for WireMessage {
    fn from(msg: &SignalingMessage) -> Self {
        Self {
            message_type: WireKind::Tag(msg.kind.as_tag().to_string()),
            data: msg.payload.clone(),
            ice_data_separator: ICE_DATA_SEPARATOR.to_string(),
        }
    }
}

impl TryFrom<WireMessage> for SignalingMessage {
    type Error = CodecError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let kind = match &wire.message_type {
            WireKind::Tag(tag) => MessageKind::from_tag(tag),
            WireKind::Code(code) => MessageKind::from_code(*code),
        }
        .ok_or_else(|| {
            CodecError::UnknownKind(match wire.message_type {
                WireKind::Tag(tag) => tag,
                WireKind::Code(code) => code.to_string(),
            })
        })?;

        if kind == MessageKind::IceCandidate {
            let separator = wire.ice_data_separator.as_str();
            if !separator.is_empty() && separator != ICE_DATA_SEPARATOR.to_string() {
                return Err(CodecError::UnsupportedSeparator(separator.to_string()));
            }
        }

        Ok(Self {
            kind,
            payload: wire.data,
        })
    }
}
