//! Signaling relay
//!
//! Keeps one WebSocket per client id and forwards every text frame, verbatim,
//! to the client named in its `to` field. The relay never looks at payloads.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::RelayConfig;
use crate::error::{ProtocolError, Result};
use crate::model::client::ClientId;
use crate::transport::ANNOUNCE_PREFIX;

const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

struct Peer {
    conn: u64,
    tx: mpsc::UnboundedSender<Message>,
}

type Registry = Arc<RwLock<HashMap<ClientId, Peer>>>;

pub struct RelayServer {
    listener: TcpListener,
    registry: Registry,
    next_conn: Arc<AtomicU64>,
}

impl RelayServer {
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        Ok(Self {
            listener,
            registry: Arc::default(),
            next_conn: Arc::default(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever. Accept errors are logged and the loop
    /// carries on.
    pub async fn run(self) -> Result<()> {
        info!("Relay listening on ws://{}", self.listener.local_addr()?);

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    let pause = accept_pause(&e);
                    warn!("Accept failed: {}", e);
                    if !pause.is_zero() {
                        tokio::time::sleep(pause).await;
                    }
                    continue;
                }
            };
            let registry = self.registry.clone();
            let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, conn, registry).await {
                    warn!("Connection from {} ended: {}", peer_addr, e);
                }
            });
        }
    }
}

/// How long to wait before accepting again after `e`. A connection that died
/// during accept costs nothing; anything else (out of file descriptors, say)
/// is given a moment to clear.
fn accept_pause(e: &io::Error) -> Duration {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted => Duration::ZERO,
        _ => ACCEPT_ERROR_PAUSE,
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    conn: u64,
    registry: Registry,
) -> Result<()> {
    let mut query = None;
    let callback = |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
        query = req.uri().query().map(str::to_owned);
        Ok(resp)
    };
    let mut ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", peer_addr, e);
            return Ok(());
        }
    };

    let id = match query.as_deref().and_then(client_id_param) {
        Some(id) => id?,
        None => match announced_id(&mut ws).await {
            Some(id) => id?,
            None => {
                debug!("{} left before announcing an id", peer_addr);
                return Ok(());
            }
        },
    };
    info!("Client {} connected from {}", id, peer_addr);

    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(prior) = registry.write().await.insert(id.clone(), Peer { conn, tx }) {
        info!("Replacing earlier connection for {}", id);
        let _ = prior.tx.send(Message::Close(None));
    }

    let (mut sink, mut stream) = ws.split();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let close = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || close {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => forward(&registry, &id, text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Read from {} failed: {}", id, e);
                break;
            }
        }
    }

    {
        let mut registry = registry.write().await;
        // only deregister if not already replaced by a newer connection
        if registry.get(&id).is_some_and(|p| p.conn == conn) {
            registry.remove(&id);
        }
    }
    writer.abort();
    info!("Client {} disconnected", id);
    Ok(())
}

async fn forward(registry: &Registry, from: &ClientId, text: String) {
    let to = match codec::route(&text) {
        Ok(to) => to,
        Err(e) => {
            warn!("Dropping frame from {}: {}", from, e);
            return;
        }
    };

    match registry.read().await.get(&to) {
        Some(peer) => {
            debug!("{} -> {}", from, to);
            let _ = peer.tx.send(Message::Text(text));
        }
        None => warn!("Dropping frame from {} for unknown client {}", from, to),
    }
}

/// `clientId` from a request query string, if present.
fn client_id_param(query: &str) -> Option<std::result::Result<ClientId, ProtocolError>> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "clientId")
        .map(|(_, value)| ClientId::new(value))
}

/// Wait for the `clientId:<id>` frame. `None` if the socket closes first.
async fn announced_id(
    ws: &mut WebSocketStream<TcpStream>,
) -> Option<std::result::Result<ClientId, ProtocolError>> {
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                return Some(match text.strip_prefix(ANNOUNCE_PREFIX) {
                    Some(id) => ClientId::new(id.trim()),
                    None => Err(ProtocolError::InvalidClientId(text)),
                });
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}
