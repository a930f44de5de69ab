//! Peer sessions
//!
//! A [`PeerSession`] holds the negotiation state and media connection for one
//! remote peer. The [`SessionTable`] keeps at most one live session per remote
//! id so inbound candidates can be routed to the right connection.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::NegotiationError;
use crate::media::{MediaConnection, MediaTrack};
use crate::model::client::ClientId;
use crate::model::negotiation::{NegotiationState, Role, Step};
use crate::model::sdp::{IceCandidate, SessionDescription};
use crate::router::HandlerId;

/// What happened to an inbound remote candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    /// Held until the remote description is set.
    Queued,
}

/// Point-in-time view of a session for the application.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub remote: ClientId,
    pub role: Role,
    pub state: NegotiationState,
    pub pending_candidates: usize,
    pub remote_tracks: usize,
    pub created_at: DateTime<Utc>,
}

pub struct PeerSession {
    remote: ClientId,
    role: Role,
    state: NegotiationState,
    connection: Box<dyn MediaConnection>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    remote_tracks: Vec<MediaTrack>,
    /// Distinguishes a session from a later one for the same remote.
    generation: u64,
    answer_handler: Option<HandlerId>,
    created_at: DateTime<Utc>,
}

impl PeerSession {
    pub fn new(
        remote: ClientId,
        role: Role,
        connection: Box<dyn MediaConnection>,
        generation: u64,
    ) -> Self {
        Self {
            remote,
            role,
            state: NegotiationState::Idle,
            connection,
            remote_description_set: false,
            pending_candidates: vec![],
            remote_tracks: vec![],
            generation,
            answer_handler: None,
            created_at: Utc::now(),
        }
    }

    pub fn remote(&self) -> &ClientId {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connection(&mut self) -> &mut dyn MediaConnection {
        self.connection.as_mut()
    }

    pub fn advance(&mut self, step: Step) -> Result<NegotiationState, NegotiationError> {
        let next = self.state.next(self.role, step)?;
        debug!("Session {}: {:?} -> {:?}", self.remote, self.state, next);
        self.state = next;
        Ok(next)
    }

    /// Move to `Failed`; a no-op on an already failed session.
    pub fn fail(&mut self) {
        if let Err(e) = self.advance(Step::Fail) {
            debug!("Session {}: {}", self.remote, e);
        }
    }

    /// Apply the remote description, then flush any candidates that were
    /// waiting for it. Failures of individual queued candidates are logged
    /// only; ICE is best-effort.
    pub fn apply_remote_description(
        &mut self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.connection.set_remote_description(desc)?;
        self.remote_description_set = true;

        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.connection.add_ice_candidate(&candidate) {
                info!("Dropping queued candidate for {}: {}", self.remote, e);
            }
        }
        Ok(())
    }

    pub fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<CandidateOutcome, NegotiationError> {
        if !self.remote_description_set {
            self.pending_candidates.push(candidate);
            return Ok(CandidateOutcome::Queued);
        }
        self.connection.add_ice_candidate(&candidate)?;
        Ok(CandidateOutcome::Applied)
    }

    pub fn add_remote_track(&mut self, track: MediaTrack) {
        self.remote_tracks.push(track);
    }

    pub fn set_answer_handler(&mut self, id: HandlerId) {
        self.answer_handler = Some(id);
    }

    pub fn take_answer_handler(&mut self) -> Option<HandlerId> {
        self.answer_handler.take()
    }

    pub fn close(&mut self) {
        self.connection.close();
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            remote: self.remote.clone(),
            role: self.role,
            state: self.state,
            pending_candidates: self.pending_candidates.len(),
            remote_tracks: self.remote_tracks.len(),
            created_at: self.created_at,
        }
    }
}

/// One live session per remote id.
#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<ClientId, PeerSession>,
    next_generation: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Insert `session`, closing and returning whatever it replaces.
    pub fn insert(&mut self, session: PeerSession) -> Option<PeerSession> {
        let mut prior = self.sessions.insert(session.remote.clone(), session)?;
        info!("Replacing existing session with {}", prior.remote);
        prior.close();
        Some(prior)
    }

    pub fn get_mut(&mut self, remote: &ClientId) -> Option<&mut PeerSession> {
        self.sessions.get_mut(remote)
    }

    pub fn get(&self, remote: &ClientId) -> Option<&PeerSession> {
        self.sessions.get(remote)
    }

    /// Remove and close the session for `remote`.
    pub fn remove(&mut self, remote: &ClientId) -> Option<PeerSession> {
        let mut session = self.sessions.remove(remote)?;
        session.close();
        Some(session)
    }

    pub fn drain(&mut self) -> Vec<PeerSession> {
        self.sessions
            .drain()
            .map(|(_, mut s)| {
                s.close();
                s
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn infos(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<_> = self.sessions.values().map(PeerSession::info).collect();
        infos.sort_by(|a, b| a.remote.cmp(&b.remote));
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testing::FakeMedia;
    use crate::media::{MediaBackend, MediaEvents};
    use tokio::sync::mpsc;

    fn session(media: &FakeMedia, remote: &str, role: Role, generation: u64) -> PeerSession {
        let (tx, _rx) = mpsc::unbounded_channel();
        let remote = ClientId::new(remote).unwrap();
        let connection = media
            .create_connection(MediaEvents::new(remote.clone(), generation, tx))
            .unwrap();
        PeerSession::new(remote, role, connection, generation)
    }

    #[test]
    fn candidates_wait_for_remote_description() {
        let media = FakeMedia::new();
        let mut s = session(&media, "222", Role::Caller, 1);

        let early = IceCandidate::new("candidate:early");
        assert_eq!(s.add_remote_candidate(early.clone()).unwrap(), CandidateOutcome::Queued);
        assert_eq!(s.info().pending_candidates, 1);

        s.apply_remote_description(&SessionDescription::answer("ANSWER")).unwrap();
        let late = IceCandidate::new("candidate:late");
        assert_eq!(s.add_remote_candidate(late.clone()).unwrap(), CandidateOutcome::Applied);

        let log = media.connection("222").unwrap();
        assert_eq!(log.candidates, vec![early, late]);
        assert!(log.rejected_candidates.is_empty());
        assert_eq!(s.info().pending_candidates, 0);
    }

    #[test]
    fn inserting_for_same_remote_replaces_and_closes_prior() {
        let media = FakeMedia::new();
        let mut table = SessionTable::new();

        assert!(table.insert(session(&media, "222", Role::Callee, 1)).is_none());
        let prior = table.insert(session(&media, "222", Role::Callee, 2)).unwrap();

        assert_eq!(prior.generation(), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&ClientId::new("222").unwrap()).unwrap().generation(), 2);

        let logs = media.connections();
        assert!(logs[0].closed);
        assert!(!logs[1].closed);
    }

    #[test]
    fn remove_closes_connection() {
        let media = FakeMedia::new();
        let mut table = SessionTable::new();
        table.insert(session(&media, "333", Role::Caller, 1));

        assert!(table.remove(&ClientId::new("333").unwrap()).is_some());
        assert!(table.is_empty());
        assert!(media.connection("333").unwrap().closed);
    }

    #[test]
    fn state_advances_through_role_table() {
        let media = FakeMedia::new();
        let mut s = session(&media, "222", Role::Caller, 1);

        assert_eq!(s.advance(Step::CreateOffer).unwrap(), NegotiationState::OfferCreated);
        assert!(s.advance(Step::ReceiveAnswer).is_err());
        assert_eq!(s.state(), NegotiationState::OfferCreated);

        s.fail();
        s.fail();
        assert_eq!(s.state(), NegotiationState::Failed);
        assert!(s.advance(Step::SendOffer).is_err());
    }
}
