use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use rtc_call::codec;
use rtc_call::error::NegotiationError;
use rtc_call::media::testing::FakeMedia;
use rtc_call::model::envelope::{Envelope, MessageKind, Signal};
use rtc_call::model::negotiation::NegotiationState;
use rtc_call::model::sdp::{IceCandidate, SessionDescription};
use rtc_call::{
    CallConfig, CallEvent, CallHandle, ClientId, Error, IdentityMode, RelayConfig, RelayServer,
    TransportConfig,
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay() -> SocketAddr {
    let config = RelayConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
    };
    let server = RelayServer::bind(&config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

fn id(s: &str) -> ClientId {
    ClientId::new(s).unwrap()
}

fn config(addr: SocketAddr, mode: IdentityMode) -> CallConfig {
    CallConfig {
        transport: TransportConfig {
            relay_url: format!("ws://{}/signal", addr),
            identity_mode: mode,
            max_attempts: 3,
            backoff_ms: 50,
        },
        ..CallConfig::default()
    }
}

fn start_peer(
    config: CallConfig,
    local: &str,
    media: &FakeMedia,
) -> (CallHandle, broadcast::Receiver<CallEvent>) {
    let (handle, _task) = rtc_call::connect(config, id(local), Arc::new(media.clone())).unwrap();
    let events = handle.subscribe();
    (handle, events)
}

async fn wait_for(
    events: &mut broadcast::Receiver<CallEvent>,
    pred: impl Fn(&CallEvent) -> bool,
) -> CallEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

async fn opened(events: &mut broadcast::Receiver<CallEvent>) {
    wait_for(events, |e| *e == CallEvent::TransportOpened).await;
}

fn connected_with(remote: &str) -> impl Fn(&CallEvent) -> bool + '_ {
    move |e| {
        *e == CallEvent::SessionState {
            remote: id(remote),
            state: NegotiationState::Connected,
        }
    }
}

/// A bare WebSocket client registered under `local`.
async fn raw_client(addr: SocketAddr, local: &str) -> Ws {
    let (ws, _) = connect_async(format!("ws://{}/signal?clientId={}", addr, local))
        .await
        .unwrap();
    ws
}

async fn send(ws: &mut Ws, from: &str, to: &str, signal: Signal) {
    let text = codec::encode(&Envelope::new(id(to), id(from), signal)).unwrap();
    ws.send(Message::Text(text)).await.unwrap();
}

async fn recv(ws: &mut Ws, within: Duration) -> Option<Envelope> {
    loop {
        match tokio::time::timeout(within, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Some(codec::decode(&text).unwrap()),
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

/// The relay registers a client after its handshake; give it a moment.
async fn registered() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn two_peers_complete_a_call_through_the_relay() {
    let addr = start_relay().await;
    let media_a = FakeMedia::new();
    let media_b = FakeMedia::new();
    let (a, mut events_a) = start_peer(config(addr, IdentityMode::QueryParam), "111", &media_a);
    let (b, mut events_b) = start_peer(config(addr, IdentityMode::QueryParam), "222", &media_b);
    opened(&mut events_a).await;
    opened(&mut events_b).await;
    registered().await;

    a.call(id("222")).await.unwrap();

    wait_for(&mut events_a, connected_with("222")).await;
    // the callee sees the caller's track before connectivity
    let track = wait_for(&mut events_b, |e| matches!(e, CallEvent::RemoteTrack { .. })).await;
    assert_eq!(track.remote(), Some(&id("111")));
    wait_for(&mut events_b, connected_with("111")).await;

    let caller = media_a.connection("222").unwrap();
    assert_eq!(caller.remote_descriptions, vec![SessionDescription::answer("ANSWER")]);
    let callee = media_b.connection("111").unwrap();
    assert_eq!(callee.remote_descriptions, vec![SessionDescription::offer("OFFER")]);

    assert_eq!(a.sessions().await[0].state, NegotiationState::Connected);
    assert_eq!(b.sessions().await[0].state, NegotiationState::Connected);
}

#[tokio::test]
async fn announce_mode_identifies_after_connect() {
    let addr = start_relay().await;
    let media_a = FakeMedia::new();
    let media_b = FakeMedia::new();
    let (a, mut events_a) = start_peer(config(addr, IdentityMode::Announce), "111", &media_a);
    let (_b, mut events_b) = start_peer(config(addr, IdentityMode::Announce), "222", &media_b);
    opened(&mut events_a).await;
    opened(&mut events_b).await;
    registered().await;

    a.call(id("222")).await.unwrap();

    wait_for(&mut events_a, connected_with("222")).await;
    wait_for(&mut events_b, connected_with("111")).await;
}

#[tokio::test]
async fn duplicate_answer_over_the_wire_is_applied_once() {
    let addr = start_relay().await;
    let media = FakeMedia::new();
    let (a, mut events) = start_peer(config(addr, IdentityMode::QueryParam), "111", &media);
    let mut callee = raw_client(addr, "222").await;
    opened(&mut events).await;
    registered().await;

    a.call(id("222")).await.unwrap();
    let offer = recv(&mut callee, Duration::from_secs(5)).await.unwrap();
    assert_eq!(offer.kind(), MessageKind::Offer);
    assert_eq!(offer.from, id("111"));

    let answer = Signal::description(&SessionDescription::answer("ANSWER"));
    send(&mut callee, "222", "111", answer.clone()).await;
    send(&mut callee, "222", "111", answer).await;

    wait_for(&mut events, connected_with("222")).await;
    registered().await;
    assert_eq!(media.connection("222").unwrap().remote_descriptions.len(), 1);
}

#[tokio::test]
async fn stray_candidate_is_dropped_and_context_keeps_working() {
    let addr = start_relay().await;
    let media = FakeMedia::new();
    let (a, mut events) = start_peer(config(addr, IdentityMode::QueryParam), "111", &media);
    let mut stranger = raw_client(addr, "333").await;
    opened(&mut events).await;
    registered().await;

    send(
        &mut stranger,
        "333",
        "111",
        Signal::candidate(IceCandidate::new("candidate:1 1 udp 1 192.0.2.9 9 typ host")),
    )
    .await;

    let dropped = wait_for(&mut events, |e| matches!(e, CallEvent::CandidateDropped { .. })).await;
    assert_eq!(dropped, CallEvent::CandidateDropped { from: id("333") });
    assert!(a.sessions().await.is_empty());

    // still answers offers afterwards
    send(
        &mut stranger,
        "333",
        "111",
        Signal::description(&SessionDescription::offer("OFFER")),
    )
    .await;
    let answer = recv(&mut stranger, Duration::from_secs(5)).await.unwrap();
    assert_eq!(answer.kind(), MessageKind::Answer);
}

#[tokio::test]
async fn failed_media_acquisition_sends_nothing() {
    let addr = start_relay().await;
    let media = FakeMedia::new().failing_acquisition();
    let (a, mut events) = start_peer(config(addr, IdentityMode::QueryParam), "111", &media);
    let mut callee = raw_client(addr, "222").await;
    opened(&mut events).await;
    registered().await;

    let err = a.call(id("222")).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Negotiation(NegotiationError::MediaUnavailable(_))
    ));
    assert!(recv(&mut callee, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn answer_timeout_fails_the_call() {
    let addr = start_relay().await;
    let media = FakeMedia::new();
    let mut config = config(addr, IdentityMode::QueryParam);
    config.negotiation.answer_timeout_ms = 200;
    let (a, mut events) = start_peer(config, "111", &media);
    let _silent = raw_client(addr, "222").await;
    opened(&mut events).await;
    registered().await;

    a.call(id("222")).await.unwrap();

    let failed = wait_for(&mut events, |e| matches!(e, CallEvent::NegotiationFailed { .. })).await;
    assert_eq!(failed.remote(), Some(&id("222")));
    wait_for(&mut events, |e| *e == CallEvent::SessionClosed { remote: id("222") }).await;
    assert!(a.sessions().await.is_empty());
}

#[tokio::test]
async fn relay_drops_legacy_and_misrouted_frames() {
    let addr = start_relay().await;
    let mut alice = raw_client(addr, "111").await;
    let mut bob = raw_client(addr, "222").await;
    registered().await;

    alice.send(Message::Text("offer:222:v=0".into())).await.unwrap();
    send(&mut alice, "111", "999", Signal::candidate(IceCandidate::new("c"))).await;
    send(&mut alice, "111", "222", Signal::candidate(IceCandidate::new("c"))).await;

    let env = recv(&mut bob, Duration::from_secs(5)).await.unwrap();
    assert_eq!(env.kind(), MessageKind::NewIceCandidate);
    assert_eq!(env.from, id("111"));
}

#[tokio::test]
async fn newer_connection_replaces_older_for_same_id() {
    let addr = start_relay().await;
    let mut sender = raw_client(addr, "111").await;
    let mut old = raw_client(addr, "222").await;
    registered().await;
    let mut new = raw_client(addr, "222").await;
    registered().await;

    send(&mut sender, "111", "222", Signal::candidate(IceCandidate::new("c"))).await;

    assert!(recv(&mut new, Duration::from_secs(5)).await.is_some());
    assert!(recv(&mut old, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn peer_connects_once_relay_comes_up() {
    // reserve a port, then free it for the relay to take later
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let media = FakeMedia::new();
    let mut config = config(addr, IdentityMode::QueryParam);
    config.transport.max_attempts = 20;
    let (_a, mut events) = start_peer(config, "111", &media);

    tokio::time::sleep(Duration::from_millis(120)).await;
    let server = RelayServer::bind(&RelayConfig { bind: addr }).await.unwrap();
    tokio::spawn(server.run());

    opened(&mut events).await;
}

#[tokio::test]
async fn unreachable_relay_reports_exhaustion_once() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let media = FakeMedia::new();
    let mut config = config(addr, IdentityMode::QueryParam);
    config.transport.max_attempts = 2;
    config.transport.backoff_ms = 10;
    let (_a, mut events) = start_peer(config, "111", &media);

    let event = wait_for(&mut events, |e| matches!(e, CallEvent::ReconnectExhausted { .. })).await;
    assert_eq!(event, CallEvent::ReconnectExhausted { attempts: 2 });

    let again = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            if let Ok(CallEvent::ReconnectExhausted { .. }) = events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(again.is_err());
}
