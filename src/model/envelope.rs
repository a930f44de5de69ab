//! Signaling envelopes
//!
//! An [`Envelope`] is the unit the relay routes: sender, recipient and a typed
//! [`Signal`]. The JSON framing lives in [`crate::codec`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::model::client::ClientId;
use crate::model::sdp::{IceCandidate, SdpKind, SessionDescription};

/// The `type` field of a frame. Also the key of the router's dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Offer,
    Answer,
    NewIceCandidate,
}

impl MessageKind {
    pub const ALL: [MessageKind; 3] = [
        MessageKind::Offer,
        MessageKind::Answer,
        MessageKind::NewIceCandidate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::NewIceCandidate => "new-ice-candidate",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownKind(s.to_string()))
    }
}

/// `data` of an offer or answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
}

/// `data` of a new-ice-candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
}

/// Typed signaling payload; the variant decides the `data` shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Offer(SdpPayload),
    Answer(SdpPayload),
    NewIceCandidate(CandidatePayload),
}

impl Signal {
    pub fn kind(&self) -> MessageKind {
        match self {
            Signal::Offer(_) => MessageKind::Offer,
            Signal::Answer(_) => MessageKind::Answer,
            Signal::NewIceCandidate(_) => MessageKind::NewIceCandidate,
        }
    }

    pub fn description(desc: &SessionDescription) -> Self {
        let payload = SdpPayload {
            sdp: desc.sdp.clone(),
        };
        match desc.kind {
            SdpKind::Offer => Signal::Offer(payload),
            SdpKind::Answer => Signal::Answer(payload),
        }
    }

    pub fn candidate(candidate: IceCandidate) -> Self {
        Signal::NewIceCandidate(CandidatePayload { candidate })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub to: ClientId,
    pub from: ClientId,
    pub signal: Signal,
}

impl Envelope {
    pub fn new(to: ClientId, from: ClientId, signal: Signal) -> Self {
        Self { to, from, signal }
    }

    pub fn kind(&self) -> MessageKind {
        self.signal.kind()
    }
}
