//! Media layer seam
//!
//! The negotiation layer never touches codecs, sockets or capture devices; it
//! drives a [`MediaConnection`] created by a [`MediaBackend`] and reacts to the
//! [`MediaEvent`]s the connection reports back through [`MediaEvents`].

pub mod rtc;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::NegotiationError;
use crate::model::client::ClientId;
use crate::model::sdp::{IceCandidate, SessionDescription};

pub use rtc::Str0mBackend;

/// What to capture when placing a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// A captured local stream, ready to attach to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    pub stream_id: String,
    pub tracks: Vec<MediaTrack>,
}

/// Callbacks from a media connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// A local candidate was discovered and should be sent to the remote.
    LocalCandidate(IceCandidate),
    /// The remote started sending a track.
    RemoteTrack(MediaTrack),
    /// Media connectivity is established.
    Connected,
    /// The connection closed or failed.
    Disconnected,
}

/// A media event as delivered to the call context: remote, session
/// generation, event.
pub type TaggedEvent = (ClientId, u64, MediaEvent);

/// Sink handed to a connection so its callbacks land in the call context,
/// tagged with the remote peer and the session generation they belong to.
#[derive(Debug, Clone)]
pub struct MediaEvents {
    remote: ClientId,
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl MediaEvents {
    pub fn new(remote: ClientId, generation: u64, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self {
            remote,
            generation,
            tx,
        }
    }

    pub fn remote(&self) -> &ClientId {
        &self.remote
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver an event; silently dropped once the call context is gone.
    pub fn emit(&self, event: MediaEvent) {
        let _ = self.tx.send((self.remote.clone(), self.generation, event));
    }
}

#[async_trait]
pub trait MediaBackend: Send + Sync + 'static {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMedia, NegotiationError>;

    fn create_connection(
        &self,
        events: MediaEvents,
    ) -> Result<Box<dyn MediaConnection>, NegotiationError>;
}

/// One peer connection. All operations are synchronous; anything slow
/// (gathering, connectivity checks) reports back through [`MediaEvents`].
pub trait MediaConnection: Send {
    fn add_track(&mut self, stream_id: &str, track: &MediaTrack) -> Result<(), NegotiationError>;

    fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError>;

    fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError>;

    fn set_local_description(&mut self, desc: &SessionDescription) -> Result<(), NegotiationError>;

    fn set_remote_description(&mut self, desc: &SessionDescription) -> Result<(), NegotiationError>;

    /// Only valid after a remote description is set.
    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), NegotiationError>;

    fn close(&mut self);
}
