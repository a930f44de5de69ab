//! Error types
//!
//! Transport failures drive the reconnect loop and never reach callers directly.
//! Protocol errors are logged and the offending frame dropped. Negotiation errors
//! abort the current call attempt only.

use std::time::Duration;

use thiserror::Error;

use crate::model::client::ClientId;
use crate::model::negotiation::{NegotiationState, Step};

/// Failures of the relay channel.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The relay could not be reached or refused the handshake
    #[error("failed to connect to relay at {url}: {reason}")]
    Connect { url: String, reason: String },

    /// A frame was sent while no channel was open
    #[error("relay channel is not open")]
    NotOpen,

    /// The channel closed underneath a pending operation
    #[error("relay channel closed")]
    Closed,

    /// Every reconnect attempt failed; no further retries are scheduled
    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },
}

/// Malformed or unexpected signaling frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type '{0}'")]
    UnknownKind(String),

    /// A `type:rest` frame from the retired delimited framing
    #[error("legacy delimited frame with prefix '{0}'")]
    LegacyFrame(String),

    #[error("invalid client id '{0}'")]
    InvalidClientId(String),

    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("unexpected {kind} from {from}: {reason}")]
    Unexpected {
        kind: &'static str,
        from: ClientId,
        reason: String,
    },
}

/// Failures while negotiating a single peer session.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("session description rejected: {0}")]
    Description(String),

    #[error("ice candidate rejected: {0}")]
    Candidate(String),

    #[error("media connection failed: {0}")]
    Connection(String),

    #[error("no answer from {remote} within {after:?}")]
    AnswerTimeout { remote: ClientId, after: Duration },

    #[error("cannot {step:?} while {state:?}")]
    InvalidTransition {
        state: NegotiationState,
        step: Step,
    },

    #[error("cannot call own client id {0}")]
    SelfCall(ClientId),

    #[error("call context is shut down")]
    Shutdown,
}

/// Invalid configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Top-level error for the crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
