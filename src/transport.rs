//! Relay transport with reconnect
//!
//! A single tokio task owns the link to the relay and the reconnect policy.
//! Callers talk to it through a cloneable [`TransportHandle`] and receive
//! [`TransportEvent`]s on a channel, in arrival order.
//!
//! Sends are fire-and-forget: a frame offered while the link is not open is
//! logged and dropped, never queued for a later connection.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::{IdentityMode, TransportConfig};
use crate::error::TransportError;
use crate::model::client::ClientId;
use crate::model::envelope::Envelope;

/// Announce frame prefix used by [`IdentityMode::Announce`].
pub const ANNOUNCE_PREFIX: &str = "clientId:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Not started yet.
    Disconnected,
    /// Dialing; `attempt` is 0 for the first dial.
    Connecting { attempt: u32 },
    /// Link is up. `epoch` increases with every successful open.
    Open { epoch: u64 },
    /// Waiting out the backoff before reconnect attempt `attempt`.
    Retrying { attempt: u32 },
    /// Gave up after the configured number of attempts.
    Exhausted,
    /// Closed on request; no reconnect.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Message(String),
    Closed,
    Exhausted { attempts: u32 },
}

/// An open duplex text channel to the relay.
///
/// Dropping `outbound` closes the link; `inbound` yields `None` once the
/// remote side is gone.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens links to the relay on behalf of the transport task.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, identity: &ClientId) -> Result<Link, TransportError>;
}

/// What to do after a failed dial or a dropped link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    After { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

/// Fixed-backoff reconnect bookkeeping. `max_attempts` counts reconnects,
/// not the initial dial.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    attempts: u32,
    max_attempts: u32,
    backoff: Duration,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            backoff,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on_open(&mut self) {
        self.attempts = 0;
    }

    pub fn on_failure(&mut self) -> Retry {
        if self.attempts < self.max_attempts {
            self.attempts += 1;
            Retry::After {
                attempt: self.attempts,
                delay: self.backoff,
            }
        } else {
            Retry::Exhausted {
                attempts: self.attempts,
            }
        }
    }
}

enum Command {
    Send { epoch: u64, text: String },
    Disconnect,
}

/// Cloneable handle to the transport task.
#[derive(Clone)]
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<TransportState>,
}

impl TransportHandle {
    /// Encode and send `envelope` if the link is open; otherwise log and drop it.
    pub fn send(&self, envelope: &Envelope) {
        let text = match codec::encode(envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping unencodable {} for {}: {}", envelope.kind(), envelope.to, e);
                return;
            }
        };

        if let Err(e) = self.send_text(text) {
            warn!("{}, dropping {} for {}", e, envelope.kind(), envelope.to);
        }
    }

    /// Hand an encoded frame to the current connection. Never queued: fails
    /// with `NotOpen` unless a link is up, `Closed` once the task has ended.
    pub fn send_text(&self, text: String) -> Result<(), TransportError> {
        let TransportState::Open { epoch } = *self.state.borrow() else {
            return Err(TransportError::NotOpen);
        };

        debug!("-> {}", text);
        self.commands
            .send(Command::Send { epoch, text })
            .map_err(|_| TransportError::Closed)
    }

    /// Close the link and suppress any further reconnects.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.state.clone()
    }
}

pub struct Transport<D> {
    dialer: D,
    identity: ClientId,
    policy: ReconnectPolicy,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: watch::Sender<TransportState>,
    epoch: u64,
    disconnect_requested: bool,
}

impl<D: Dialer> Transport<D> {
    /// Spawn the transport task. The identity is kept for every reconnect.
    pub fn connect(
        dialer: D,
        identity: ClientId,
        config: &TransportConfig,
    ) -> (TransportHandle, mpsc::UnboundedReceiver<TransportEvent>, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(TransportState::Disconnected);

        let transport = Transport {
            dialer,
            identity,
            policy: ReconnectPolicy::new(config.max_attempts, config.backoff()),
            commands: command_rx,
            events: event_tx,
            state: state_tx,
            epoch: 0,
            disconnect_requested: false,
        };
        let task = tokio::spawn(transport.run());

        let handle = TransportHandle {
            commands: command_tx,
            state: state_rx,
        };
        (handle, event_rx, task)
    }

    async fn run(mut self) {
        loop {
            self.set_state(TransportState::Connecting {
                attempt: self.policy.attempts(),
            });

            match self.dialer.dial(&self.identity).await {
                Ok(link) => {
                    self.policy.on_open();
                    self.epoch += 1;
                    self.set_state(TransportState::Open { epoch: self.epoch });
                    info!("Connected to relay as {}", self.identity);
                    if !self.emit(TransportEvent::Opened) {
                        return;
                    }

                    self.pump(link).await;

                    if self.disconnect_requested {
                        info!("Relay channel closed on request");
                        self.set_state(TransportState::Shutdown);
                        self.emit(TransportEvent::Closed);
                        return;
                    }
                    info!("Relay channel closed");
                    if !self.emit(TransportEvent::Closed) {
                        return;
                    }
                }
                Err(e) => warn!("Relay connect failed: {}", e),
            }

            // a disconnect issued while dialing is only seen here
            self.drain_commands();
            if self.disconnect_requested {
                info!("Relay channel closed on request");
                self.set_state(TransportState::Shutdown);
                return;
            }

            match self.policy.on_failure() {
                Retry::After { attempt, delay } => {
                    info!(
                        "Attempting to reconnect in {:?} ({}/{})",
                        delay, attempt, self.policy.max_attempts
                    );
                    self.set_state(TransportState::Retrying { attempt });
                    self.backoff(delay).await;
                    if self.disconnect_requested {
                        self.set_state(TransportState::Shutdown);
                        return;
                    }
                }
                Retry::Exhausted { attempts } => {
                    error!("{}", TransportError::ReconnectExhausted { attempts });
                    self.set_state(TransportState::Exhausted);
                    self.emit(TransportEvent::Exhausted { attempts });
                    return;
                }
            }
        }
    }

    /// Move frames both ways until the link drops or a disconnect arrives.
    async fn pump(&mut self, mut link: Link) {
        loop {
            tokio::select! {
                inbound = link.inbound.recv() => match inbound {
                    Some(text) => {
                        debug!("<- {}", text);
                        if !self.emit(TransportEvent::Message(text)) {
                            self.disconnect_requested = true;
                            return;
                        }
                    }
                    None => return,
                },
                command = self.commands.recv() => match command {
                    Some(Command::Send { epoch, text }) if epoch == self.epoch => {
                        if link.outbound.send(text).is_err() {
                            warn!("Relay link dropped while sending");
                            return;
                        }
                    }
                    Some(Command::Send { .. }) => {
                        warn!("Dropping frame addressed to a previous relay connection");
                    }
                    Some(Command::Disconnect) | None => {
                        self.disconnect_requested = true;
                        return;
                    }
                },
            }
        }
    }

    /// Sleep for `delay`, dropping any sends that arrive meanwhile. A
    /// disconnect does not cut the sleep short, it only cancels the next dial.
    async fn backoff(&mut self, delay: Duration) {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return,
                command = self.commands.recv(), if !self.disconnect_requested => match command {
                    Some(Command::Send { .. }) => warn!("{}, dropping frame", TransportError::NotOpen),
                    Some(Command::Disconnect) | None => self.disconnect_requested = true,
                },
            }
        }
    }

    /// Consume commands queued while no link was being pumped.
    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Send { .. } => warn!("{}, dropping frame", TransportError::NotOpen),
                Command::Disconnect => self.disconnect_requested = true,
            }
        }
    }

    fn set_state(&self, state: TransportState) {
        self.state.send_replace(state);
    }

    /// False once nobody listens for events any more.
    fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

/// Dials the relay over WebSocket with `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsDialer {
    url: String,
    mode: IdentityMode,
}

impl WsDialer {
    pub fn new(url: impl Into<String>, mode: IdentityMode) -> Self {
        Self {
            url: url.into(),
            mode,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.relay_url.clone(), config.identity_mode)
    }

    fn url_for(&self, identity: &ClientId) -> String {
        match self.mode {
            IdentityMode::QueryParam => {
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}clientId={}", self.url, sep, identity)
            }
            IdentityMode::Announce => self.url.clone(),
        }
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, identity: &ClientId) -> Result<Link, TransportError> {
        let url = self.url_for(identity);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        let (mut sink, mut stream) = ws_stream.split();

        if self.mode == IdentityMode::Announce {
            sink.send(Message::Text(format!("{}{}", ANNOUNCE_PREFIX, identity)))
                .await
                .map_err(|e| TransportError::Connect {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        // Writer: ends when the link's sender is dropped.
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!("Failed to write to relay: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: ends on close, error, or when nobody reads any more.
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Relay read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
