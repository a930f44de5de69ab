//! Negotiation state machine and call context
//!
//! A [`CallContext`] owns everything one client needs to place and accept
//! calls: the transport handle, the router, the session table and the media
//! backend. It runs as a single task; inbound frames, media callbacks, timers
//! and application commands are all processed in turn on that task, so no
//! state is shared across threads.
//!
//! The callee side is wired up at startup (`offer` and `new-ice-candidate`
//! handlers). Each outgoing call adds an `answer` handler scoped to the
//! remote it called, removed once the answer is applied or the call ends.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::{CallConfig, NegotiationConfig};
use crate::error::{Error, NegotiationError, ProtocolError, Result, TransportError};
use crate::media::{LocalMedia, MediaBackend, MediaEvent, MediaEvents, TaggedEvent};
use crate::model::client::ClientId;
use crate::model::envelope::{Envelope, MessageKind, Signal};
use crate::model::event::CallEvent;
use crate::model::negotiation::{NegotiationState, Role, Step};
use crate::model::sdp::SessionDescription;
use crate::router::{HandlerId, Router};
use crate::session::{CandidateOutcome, PeerSession, SessionInfo, SessionTable};
use crate::transport::{Dialer, Transport, TransportEvent, TransportHandle, WsDialer};

const EVENT_CAPACITY: usize = 256;

enum Command {
    Call {
        remote: ClientId,
        reply: oneshot::Sender<Result<()>>,
    },
    HangUp {
        remote: ClientId,
    },
    Sessions {
        reply: oneshot::Sender<Vec<SessionInfo>>,
    },
    Shutdown,
}

/// Work scheduled by the context for itself.
enum Internal {
    MediaAcquired {
        remote: ClientId,
        media: std::result::Result<LocalMedia, NegotiationError>,
        reply: oneshot::Sender<Result<()>>,
    },
    AnswerDeadline {
        remote: ClientId,
        generation: u64,
    },
}

/// Cloneable handle for the application side of a call context.
#[derive(Clone)]
pub struct CallHandle {
    local_id: ClientId,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<CallEvent>,
    transport: TransportHandle,
}

impl CallHandle {
    pub fn local_id(&self) -> &ClientId {
        &self.local_id
    }

    /// Place a call. Resolves once the offer is handed to the transport, or
    /// with the error that aborted the attempt before that point. Delivery of
    /// the offer is not confirmed.
    pub async fn call(&self, remote: ClientId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Call { remote, reply })
            .map_err(|_| NegotiationError::Shutdown)?;
        rx.await.map_err(|_| NegotiationError::Shutdown)?
    }

    pub fn hang_up(&self, remote: ClientId) {
        let _ = self.commands.send(Command::HangUp { remote });
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Sessions { reply }).is_err() {
            return vec![];
        }
        rx.await.unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    /// Close every session and the relay channel, then stop the context.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// State the router's handlers operate on.
struct CallState {
    local_id: ClientId,
    transport: TransportHandle,
    backend: Arc<dyn MediaBackend>,
    sessions: SessionTable,
    config: NegotiationConfig,
    media_tx: mpsc::UnboundedSender<TaggedEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    events: broadcast::Sender<CallEvent>,
    /// Handlers to unregister once the current dispatch returns.
    retired: Vec<HandlerId>,
}

pub struct CallContext {
    state: CallState,
    router: Router<CallState>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    media_rx: mpsc::UnboundedReceiver<TaggedEvent>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    commands: mpsc::UnboundedReceiver<Command>,
}

/// Connect to the relay over WebSocket and start a call context.
pub fn connect(
    config: CallConfig,
    local_id: ClientId,
    backend: Arc<dyn MediaBackend>,
) -> Result<(CallHandle, JoinHandle<()>)> {
    config.validate()?;
    let dialer = WsDialer::from_config(&config.transport);
    Ok(connect_with(dialer, config, local_id, backend))
}

/// Like [`connect`], with a caller-supplied dialer.
pub fn connect_with<D: Dialer>(
    dialer: D,
    config: CallConfig,
    local_id: ClientId,
    backend: Arc<dyn MediaBackend>,
) -> (CallHandle, JoinHandle<()>) {
    let (transport, transport_rx, _transport_task) =
        Transport::connect(dialer, local_id.clone(), &config.transport);
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (media_tx, media_rx) = mpsc::unbounded_channel();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(EVENT_CAPACITY);

    let state = CallState {
        local_id: local_id.clone(),
        transport: transport.clone(),
        backend,
        sessions: SessionTable::new(),
        config: config.negotiation,
        media_tx,
        internal_tx,
        events: events.clone(),
        retired: vec![],
    };

    let mut context = CallContext {
        state,
        router: Router::new(),
        transport_rx,
        media_rx,
        internal_rx,
        commands: command_rx,
    };
    context.register_callee_handlers();
    let task = tokio::spawn(context.run());

    let handle = CallHandle {
        local_id,
        commands: command_tx,
        events,
        transport,
    };
    (handle, task)
}

impl CallContext {
    fn register_callee_handlers(&mut self) {
        self.router
            .add_handler(MessageKind::Offer, |state, env| state.on_offer(env));
        self.router
            .add_handler(MessageKind::NewIceCandidate, |state, env| state.on_candidate(env));
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(event) = self.transport_rx.recv() => self.on_transport_event(event),
                Some((remote, generation, event)) = self.media_rx.recv() => {
                    self.state.on_media_event(remote, generation, event)
                }
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
            }

            for id in self.state.retired.drain(..) {
                self.router.remove_handler(id);
            }
        }

        info!("Shutting down call context for {}", self.state.local_id);
        for session in self.state.sessions.drain() {
            self.state.publish(CallEvent::SessionClosed {
                remote: session.remote().clone(),
            });
        }
        self.state.transport.disconnect();
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.state.publish(CallEvent::TransportOpened),
            TransportEvent::Closed => self.state.publish(CallEvent::TransportClosed),
            TransportEvent::Exhausted { attempts } => {
                error!("Relay unreachable: {}", TransportError::ReconnectExhausted { attempts });
                self.state.publish(CallEvent::ReconnectExhausted { attempts });
            }
            TransportEvent::Message(text) => self.on_frame(&text),
        }
    }

    fn on_frame(&mut self, text: &str) {
        let envelope = match codec::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping frame: {}", e);
                return;
            }
        };

        if envelope.to != self.state.local_id {
            warn!(
                "Dropping {} from {} addressed to {}",
                envelope.kind(),
                envelope.from,
                envelope.to
            );
            return;
        }

        debug!("Received {} from {}", envelope.kind(), envelope.from);
        if self.router.dispatch(&mut self.state, &envelope) == 0 {
            warn!(
                "{}",
                ProtocolError::Unexpected {
                    kind: envelope.kind().as_str(),
                    from: envelope.from.clone(),
                    reason: "no outstanding negotiation".to_string(),
                }
            );
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Call { remote, reply } => self.begin_call(remote, reply),
            Command::HangUp { remote } => {
                info!("Hanging up on {}", remote);
                self.state.end_session(&remote);
            }
            Command::Sessions { reply } => {
                let _ = reply.send(self.state.sessions.infos());
            }
            Command::Shutdown => {}
        }
    }

    /// Caller step 1: acquire local media off the loop so inbound events keep
    /// flowing meanwhile.
    fn begin_call(&mut self, remote: ClientId, reply: oneshot::Sender<Result<()>>) {
        if remote == self.state.local_id {
            let _ = reply.send(Err(NegotiationError::SelfCall(remote).into()));
            return;
        }

        info!("Calling {}", remote);
        let backend = self.state.backend.clone();
        let constraints = self.state.config.constraints;
        let internal_tx = self.state.internal_tx.clone();
        tokio::spawn(async move {
            let media = backend.acquire_local_media(&constraints).await;
            let _ = internal_tx.send(Internal::MediaAcquired {
                remote,
                media,
                reply,
            });
        });
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::MediaAcquired {
                remote,
                media,
                reply,
            } => {
                let result = match media {
                    Ok(local) => self.offer(remote, local),
                    Err(e) => {
                        warn!("Call to {} aborted: {}", remote, e);
                        self.state.publish(CallEvent::NegotiationFailed {
                            remote,
                            reason: e.to_string(),
                        });
                        Err(e.into())
                    }
                };
                let _ = reply.send(result);
            }
            Internal::AnswerDeadline { remote, generation } => {
                self.state.on_answer_deadline(&remote, generation)
            }
        }
    }

    /// Caller steps 2-5: connection, tracks, offer, and the answer handler.
    fn offer(&mut self, remote: ClientId, local: LocalMedia) -> Result<()> {
        let generation = self.state.sessions.next_generation();
        let events = MediaEvents::new(remote.clone(), generation, self.state.media_tx.clone());
        let connection = match self.state.backend.create_connection(events) {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Call to {} aborted: {}", remote, e);
                self.state.publish(CallEvent::NegotiationFailed {
                    remote,
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };
        let session = PeerSession::new(remote.clone(), Role::Caller, connection, generation);
        if let Some(mut prior) = self.state.sessions.insert(session) {
            if let Some(id) = prior.take_answer_handler() {
                self.router.remove_handler(id);
            }
        }

        let offer = match self.state.create_offer(&remote, &local) {
            Ok(offer) => offer,
            Err(e) => {
                self.state.fail_session(&remote, &e);
                return Err(e.into());
            }
        };

        let handler = self.router.add_scoped_handler(
            MessageKind::Answer,
            remote.clone(),
            |state, env| state.on_answer(env),
        );
        if let Some(session) = self.state.sessions.get_mut(&remote) {
            session.set_answer_handler(handler);
        }

        self.state.send(&remote, Signal::description(&offer));
        self.state.step(&remote, Step::SendOffer)?;
        self.state.schedule_answer_deadline(remote, generation);
        Ok(())
    }
}

impl CallState {
    fn publish(&self, event: CallEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn send(&self, to: &ClientId, signal: Signal) {
        let envelope = Envelope::new(to.clone(), self.local_id.clone(), signal);
        self.transport.send(&envelope);
    }

    fn step(&mut self, remote: &ClientId, step: Step) -> std::result::Result<(), NegotiationError> {
        let Some(session) = self.sessions.get_mut(remote) else {
            return Ok(());
        };
        let state = session.advance(step)?;
        self.publish(CallEvent::SessionState {
            remote: remote.clone(),
            state,
        });
        Ok(())
    }

    fn create_offer(
        &mut self,
        remote: &ClientId,
        local: &LocalMedia,
    ) -> std::result::Result<SessionDescription, NegotiationError> {
        let session = self
            .sessions
            .get_mut(remote)
            .ok_or(NegotiationError::Shutdown)?;

        for track in &local.tracks {
            session.connection().add_track(&local.stream_id, track)?;
        }
        let offer = session.connection().create_offer()?;
        self.step(remote, Step::CreateOffer)?;

        if let Some(session) = self.sessions.get_mut(remote) {
            session.connection().set_local_description(&offer)?;
        }
        Ok(offer)
    }

    /// Callee: build a fresh session for the offer and answer it.
    fn on_offer(&mut self, env: &Envelope) -> Result<()> {
        let Signal::Offer(payload) = &env.signal else {
            return Ok(());
        };
        let remote = env.from.clone();
        info!("Received offer from {}", remote);

        let generation = self.sessions.next_generation();
        let connection = self
            .backend
            .create_connection(MediaEvents::new(remote.clone(), generation, self.media_tx.clone()))?;
        if let Some(mut prior) = self
            .sessions
            .insert(PeerSession::new(remote.clone(), Role::Callee, connection, generation))
        {
            if let Some(id) = prior.take_answer_handler() {
                self.retired.push(id);
            }
        }

        if let Err(e) = self.answer(&remote, SessionDescription::offer(payload.sdp.clone())) {
            self.fail_session(&remote, &e);
            return Err(e.into());
        }
        Ok(())
    }

    fn answer(
        &mut self,
        remote: &ClientId,
        offer: SessionDescription,
    ) -> std::result::Result<(), NegotiationError> {
        self.step(remote, Step::ReceiveOffer)?;

        let session = self
            .sessions
            .get_mut(remote)
            .ok_or(NegotiationError::Shutdown)?;
        session.apply_remote_description(&offer)?;
        let answer = session.connection().create_answer()?;
        self.step(remote, Step::CreateAnswer)?;

        if let Some(session) = self.sessions.get_mut(remote) {
            session.connection().set_local_description(&answer)?;
        }
        info!("Sending answer to {}", remote);
        self.send(remote, Signal::description(&answer));
        self.step(remote, Step::SendAnswer)
    }

    /// Caller: apply the answer from the remote we offered to.
    fn on_answer(&mut self, env: &Envelope) -> Result<()> {
        let Signal::Answer(payload) = &env.signal else {
            return Ok(());
        };
        let remote = &env.from;

        let Some(session) = self.sessions.get_mut(remote) else {
            return Err(unexpected(env, "no session"));
        };
        if session.state() != NegotiationState::OfferSent {
            return Err(unexpected(env, &format!("session is {:?}", session.state())));
        }

        info!("Received answer from {}", remote);
        let applied = session.apply_remote_description(&SessionDescription::answer(payload.sdp.clone()));
        if let Some(id) = session.take_answer_handler() {
            self.retired.push(id);
        }
        if let Err(e) = applied {
            self.fail_session(remote, &e);
            return Err(e.into());
        }

        self.step(remote, Step::ReceiveAnswer)?;
        self.step(remote, Step::Connect)?;
        Ok(())
    }

    fn on_candidate(&mut self, env: &Envelope) -> Result<()> {
        let Signal::NewIceCandidate(payload) = &env.signal else {
            return Ok(());
        };

        let Some(session) = self.sessions.get_mut(&env.from) else {
            info!("Dropping ice candidate from {}: no session", env.from);
            self.publish(CallEvent::CandidateDropped {
                from: env.from.clone(),
            });
            return Ok(());
        };

        match session.add_remote_candidate(payload.candidate.clone()) {
            Ok(CandidateOutcome::Applied) => debug!("Added ice candidate from {}", env.from),
            Ok(CandidateOutcome::Queued) => debug!("Queued ice candidate from {}", env.from),
            // best-effort: a bad candidate never fails the session
            Err(e) => warn!("Ignoring ice candidate from {}: {}", env.from, e),
        }
        Ok(())
    }

    fn on_media_event(&mut self, remote: ClientId, generation: u64, event: MediaEvent) {
        let Some(session) = self.sessions.get_mut(&remote) else {
            debug!("Media event for closed session {}: {:?}", remote, event);
            return;
        };
        // queued by a connection that has since been replaced
        if session.generation() != generation {
            debug!("Stale media event for {}: {:?}", remote, event);
            return;
        }

        match event {
            MediaEvent::LocalCandidate(candidate) => {
                if session.state().is_terminal() {
                    return;
                }
                self.send(&remote, Signal::candidate(candidate));
            }
            MediaEvent::RemoteTrack(track) => {
                info!("Remote track {} from {}", track.id, remote);
                session.add_remote_track(track.clone());
                self.publish(CallEvent::RemoteTrack { remote, track });
            }
            MediaEvent::Connected => {
                if session.role() == Role::Callee && session.state() == NegotiationState::AnswerSent {
                    if let Err(e) = self.step(&remote, Step::Connect) {
                        warn!("Session {}: {}", remote, e);
                    }
                }
            }
            MediaEvent::Disconnected => {
                info!("Media connection with {} closed", remote);
                self.end_session(&remote);
            }
        }
    }

    fn schedule_answer_deadline(&self, remote: ClientId, generation: u64) {
        let after = self.config.answer_timeout();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = internal_tx.send(Internal::AnswerDeadline { remote, generation });
        });
    }

    fn on_answer_deadline(&mut self, remote: &ClientId, generation: u64) {
        let waiting = self.sessions.get(remote).is_some_and(|s| {
            s.generation() == generation && s.state() == NegotiationState::OfferSent
        });
        if waiting {
            let e = NegotiationError::AnswerTimeout {
                remote: remote.clone(),
                after: self.config.answer_timeout(),
            };
            self.fail_session(remote, &e);
        }
    }

    /// Abandon a session after a negotiation error. No retry.
    fn fail_session(&mut self, remote: &ClientId, e: &NegotiationError) {
        warn!("Negotiation with {} failed: {}", remote, e);
        if let Some(session) = self.sessions.get_mut(remote) {
            session.fail();
        }
        self.publish(CallEvent::SessionState {
            remote: remote.clone(),
            state: NegotiationState::Failed,
        });
        self.publish(CallEvent::NegotiationFailed {
            remote: remote.clone(),
            reason: e.to_string(),
        });
        self.end_session(remote);
    }

    fn end_session(&mut self, remote: &ClientId) {
        if let Some(mut session) = self.sessions.remove(remote) {
            if let Some(id) = session.take_answer_handler() {
                self.retired.push(id);
            }
            self.publish(CallEvent::SessionClosed {
                remote: remote.clone(),
            });
        }
    }
}

fn unexpected(env: &Envelope, reason: &str) -> Error {
    ProtocolError::Unexpected {
        kind: env.kind().as_str(),
        from: env.from.clone(),
        reason: reason.to_string(),
    }
    .into()
}
