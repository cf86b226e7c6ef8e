//! Core Tandem signaling types.
//!
//! This crate provides:
//! - The signaling message codec (offer, answer and ICE candidate frames)
//! - The offer/answer negotiation state machine with remote candidate buffering

#![forbid(unsafe_code)]

pub mod message;
pub mod negotiation;

pub use message::{
    IceCandidateDescriptor, MessageKind, SdpKind, SignalingMessage, WireKind, WireMessage,
    ICE_DATA_SEPARATOR,
};
pub use negotiation::{
    NegotiationAction, NegotiationEvent, NegotiationState, Negotiator, MAX_ANSWER_ATTEMPTS,
};

/// A signaling payload that could not be encoded or decoded.
///
/// Decode failures drop the single offending message; they never end a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unknown message type: {0}")]
    UnknownKind(String),
    #[error("expected {expected:?} message, got {found:?}")]
    UnexpectedKind {
        expected: MessageKind,
        found: MessageKind,
    },
    #[error("ice payload has {0} fields, expected 3")]
    FieldCount(usize),
    #[error("invalid sdp mline index: {0:?}")]
    InvalidMlineIndex(String),
    #[error("ice candidate string is empty")]
    EmptyCandidate,
    #[error("{field} contains the ice data separator")]
    DelimiterInField { field: &'static str },
    #[error("unsupported ice data separator: {0:?}")]
    UnsupportedSeparator(String),
    #[error("invalid json frame: {0}")]
    Json(String),
}
