//! Call events published to the application
//!
//! The call context publishes these on a broadcast channel so the UI layer (or
//! a test) can follow what the negotiation is doing without reaching into it.

use crate::media::MediaTrack;
use crate::model::{client::ClientId, negotiation::NegotiationState};

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// The relay channel opened (initially or after a reconnect).
    TransportOpened,

    /// The relay channel closed; a retry may follow.
    TransportClosed,

    /// Every reconnect attempt failed. Published once; nothing retries after it.
    ReconnectExhausted { attempts: u32 },

    /// A session moved to a new negotiation state.
    SessionState {
        remote: ClientId,
        state: NegotiationState,
    },

    /// The remote side of a session started sending a track.
    RemoteTrack { remote: ClientId, track: MediaTrack },

    /// A call attempt was abandoned.
    NegotiationFailed { remote: ClientId, reason: String },

    /// A candidate arrived for a remote with no session and was dropped.
    CandidateDropped { from: ClientId },

    /// A session was torn down and removed.
    SessionClosed { remote: ClientId },
}

impl CallEvent {
    /// The remote peer this event concerns, if any.
    pub fn remote(&self) -> Option<&ClientId> {
        match self {
            CallEvent::SessionState { remote, .. }
            | CallEvent::RemoteTrack { remote, .. }
            | CallEvent::NegotiationFailed { remote, .. }
            | CallEvent::SessionClosed { remote } => Some(remote),
            CallEvent::CandidateDropped { from } => Some(from),
            _ => None,
        }
    }
}
