//! Scripted in-memory media backend
//!
//! Records every operation so tests can assert on what the negotiation layer
//! did, and enforces the one ordering rule real stacks enforce: no remote
//! candidates before a remote description.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::NegotiationError;
use crate::media::{
    LocalMedia, MediaBackend, MediaConnection, MediaConstraints, MediaEvent, MediaEvents,
    MediaTrack, TrackKind,
};
use crate::model::client::ClientId;
use crate::model::sdp::{IceCandidate, SdpKind, SessionDescription};

/// Everything one fake connection was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionLog {
    pub remote: ClientId,
    pub tracks: Vec<MediaTrack>,
    pub local_descriptions: Vec<SessionDescription>,
    pub remote_descriptions: Vec<SessionDescription>,
    pub candidates: Vec<IceCandidate>,
    pub rejected_candidates: Vec<IceCandidate>,
    pub closed: bool,
}

#[derive(Debug)]
struct Script {
    offer_sdp: String,
    answer_sdp: String,
    fail_acquire: bool,
    fail_remote_description: bool,
    local_candidates: Vec<IceCandidate>,
    connect_on_negotiated: bool,
    connections: Vec<ConnectionLog>,
    sinks: Vec<MediaEvents>,
}

#[derive(Debug, Clone)]
pub struct FakeMedia {
    script: Arc<Mutex<Script>>,
}

impl Default for FakeMedia {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMedia {
    /// Offers read `OFFER`, answers `ANSWER`, one local candidate, and the
    /// connection reports connectivity once both descriptions are set.
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                offer_sdp: "OFFER".to_string(),
                answer_sdp: "ANSWER".to_string(),
                fail_acquire: false,
                fail_remote_description: false,
                local_candidates: vec![IceCandidate {
                    candidate: "candidate:1 1 udp 2122260223 192.0.2.1 50000 typ host".to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_m_line_index: Some(0),
                }],
                connect_on_negotiated: true,
                connections: Vec::new(),
                sinks: Vec::new(),
            })),
        }
    }

    pub fn with_sdp(self, offer: &str, answer: &str) -> Self {
        {
            let mut script = self.lock();
            script.offer_sdp = offer.to_string();
            script.answer_sdp = answer.to_string();
        }
        self
    }

    pub fn failing_acquisition(self) -> Self {
        self.lock().fail_acquire = true;
        self
    }

    pub fn rejecting_remote_descriptions(self) -> Self {
        self.lock().fail_remote_description = true;
        self
    }

    pub fn with_local_candidates(self, candidates: Vec<IceCandidate>) -> Self {
        self.lock().local_candidates = candidates;
        self
    }

    pub fn without_connectivity(self) -> Self {
        self.lock().connect_on_negotiated = false;
        self
    }

    pub fn connections(&self) -> Vec<ConnectionLog> {
        self.lock().connections.clone()
    }

    /// The most recent connection created for `remote`.
    pub fn connection(&self, remote: &str) -> Option<ConnectionLog> {
        self.lock()
            .connections
            .iter()
            .rev()
            .find(|c| c.remote.as_str() == remote)
            .cloned()
    }

    /// Report `event` from the `index`th connection created, as the media
    /// stack would, whether or not that connection is still in use.
    pub fn emit(&self, index: usize, event: MediaEvent) {
        let sink = self.lock().sinks.get(index).cloned();
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        // a panicking test thread must not hide the log from the others
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MediaBackend for FakeMedia {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMedia, NegotiationError> {
        if self.lock().fail_acquire {
            return Err(NegotiationError::MediaUnavailable(
                "camera permission denied".to_string(),
            ));
        }

        let mut tracks = Vec::new();
        if constraints.video {
            tracks.push(MediaTrack {
                id: "fake-video".to_string(),
                kind: TrackKind::Video,
            });
        }
        if constraints.audio {
            tracks.push(MediaTrack {
                id: "fake-audio".to_string(),
                kind: TrackKind::Audio,
            });
        }

        Ok(LocalMedia {
            stream_id: "fake-stream".to_string(),
            tracks,
        })
    }

    fn create_connection(
        &self,
        events: MediaEvents,
    ) -> Result<Box<dyn MediaConnection>, NegotiationError> {
        let index = {
            let mut script = self.lock();
            script.connections.push(ConnectionLog {
                remote: events.remote().clone(),
                tracks: Vec::new(),
                local_descriptions: Vec::new(),
                remote_descriptions: Vec::new(),
                candidates: Vec::new(),
                rejected_candidates: Vec::new(),
                closed: false,
            });
            script.sinks.push(events.clone());
            script.connections.len() - 1
        };

        Ok(Box::new(FakeConnection {
            media: self.clone(),
            index,
            events,
            has_local: false,
            has_remote: false,
        }))
    }
}

struct FakeConnection {
    media: FakeMedia,
    index: usize,
    events: MediaEvents,
    has_local: bool,
    has_remote: bool,
}

impl FakeConnection {
    fn with_log<T>(&self, f: impl FnOnce(&mut ConnectionLog) -> T) -> T {
        let mut script = self.media.lock();
        f(&mut script.connections[self.index])
    }

    fn maybe_connected(&self) {
        if self.has_local && self.has_remote && self.media.lock().connect_on_negotiated {
            self.events.emit(MediaEvent::Connected);
        }
    }
}

impl MediaConnection for FakeConnection {
    fn add_track(&mut self, _stream_id: &str, track: &MediaTrack) -> Result<(), NegotiationError> {
        self.with_log(|log| log.tracks.push(track.clone()));
        Ok(())
    }

    fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        Ok(SessionDescription::offer(self.media.lock().offer_sdp.clone()))
    }

    fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        if !self.has_remote {
            return Err(NegotiationError::Description(
                "no remote offer to answer".to_string(),
            ));
        }
        Ok(SessionDescription::answer(self.media.lock().answer_sdp.clone()))
    }

    fn set_local_description(&mut self, desc: &SessionDescription) -> Result<(), NegotiationError> {
        self.with_log(|log| log.local_descriptions.push(desc.clone()));
        self.has_local = true;

        // gathering starts once the local description is in place
        let candidates = self.media.lock().local_candidates.clone();
        for candidate in candidates {
            self.events.emit(MediaEvent::LocalCandidate(candidate));
        }
        self.maybe_connected();
        Ok(())
    }

    fn set_remote_description(&mut self, desc: &SessionDescription) -> Result<(), NegotiationError> {
        if self.media.lock().fail_remote_description {
            return Err(NegotiationError::Description("malformed sdp".to_string()));
        }
        self.with_log(|log| log.remote_descriptions.push(desc.clone()));
        self.has_remote = true;

        if desc.kind == SdpKind::Offer {
            self.events.emit(MediaEvent::RemoteTrack(MediaTrack {
                id: "remote-video".to_string(),
                kind: TrackKind::Video,
            }));
        }
        self.maybe_connected();
        Ok(())
    }

    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        if !self.has_remote {
            self.with_log(|log| log.rejected_candidates.push(candidate.clone()));
            return Err(NegotiationError::Candidate(
                "remote description not set".to_string(),
            ));
        }
        self.with_log(|log| log.candidates.push(candidate.clone()));
        Ok(())
    }

    fn close(&mut self) {
        self.with_log(|log| log.closed = true);
    }
}
