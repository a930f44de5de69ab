//! Media backend on the sans-IO `str0m` stack
//!
//! Each connection owns an [`Rtc`] and a UDP socket bound to the selected host
//! address. A tokio task drives the `Rtc`: it feeds socket input and timeouts
//! in, sends transmits out, and turns `str0m` events into [`MediaEvent`]s.
//! Description and candidate operations lock the same `Rtc` from the call
//! context and wake the driver so new output is polled right away.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::media::{Direction, MediaKind};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::NegotiationError;
use crate::media::{
    LocalMedia, MediaBackend, MediaConnection, MediaConstraints, MediaEvent, MediaEvents,
    MediaTrack, TrackKind,
};
use crate::model::sdp::{IceCandidate, SdpKind, SessionDescription};
use crate::util::select_host_address;

pub struct Str0mBackend {
    host: IpAddr,
}

impl Str0mBackend {
    pub fn new(host: IpAddr) -> Self {
        Self { host }
    }
}

impl Default for Str0mBackend {
    fn default() -> Self {
        Self::new(select_host_address())
    }
}

#[async_trait]
impl MediaBackend for Str0mBackend {
    /// `str0m` has no capture devices; the local stream declares which
    /// tracks will be negotiated as send-receive.
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMedia, NegotiationError> {
        let mut tracks = vec![];
        if constraints.video {
            tracks.push(MediaTrack {
                id: uuid::Uuid::new_v4().simple().to_string(),
                kind: TrackKind::Video,
            });
        }
        if constraints.audio {
            tracks.push(MediaTrack {
                id: uuid::Uuid::new_v4().simple().to_string(),
                kind: TrackKind::Audio,
            });
        }
        if tracks.is_empty() {
            return Err(NegotiationError::MediaUnavailable(
                "no audio or video requested".to_string(),
            ));
        }

        Ok(LocalMedia {
            stream_id: uuid::Uuid::new_v4().simple().to_string(),
            tracks,
        })
    }

    fn create_connection(
        &self,
        events: MediaEvents,
    ) -> Result<Box<dyn MediaConnection>, NegotiationError> {
        let connection_error = |e: std::io::Error| NegotiationError::Connection(e.to_string());

        let socket = std::net::UdpSocket::bind(SocketAddr::new(self.host, 0)).map_err(connection_error)?;
        let addr = socket.local_addr().map_err(connection_error)?;
        socket.set_nonblocking(true).map_err(connection_error)?;
        let socket = UdpSocket::from_std(socket).map_err(connection_error)?;
        info!("Bound UDP port {} for {}", addr, events.remote());

        let candidate = Candidate::host(addr, Protocol::Udp)
            .map_err(|e| NegotiationError::Connection(format!("{:?}", e)))?;

        let mut rtc = Rtc::builder().build();
        rtc.add_local_candidate(candidate.clone());

        let shared = Arc::new(Shared {
            rtc: Mutex::new(rtc),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(drive(shared.clone(), socket, addr, events.clone()));

        Ok(Box::new(Str0mConnection {
            shared,
            events,
            candidate,
            tracks: vec![],
            pending: None,
            remote_offer: None,
        }))
    }
}

struct Shared {
    rtc: Mutex<Rtc>,
    wake: Notify,
    closed: AtomicBool,
}

impl Shared {
    fn rtc(&self) -> MutexGuard<'_, Rtc> {
        self.rtc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct Str0mConnection {
    shared: Arc<Shared>,
    events: MediaEvents,
    candidate: Candidate,
    tracks: Vec<(String, MediaTrack)>,
    pending: Option<SdpPendingOffer>,
    remote_offer: Option<SdpOffer>,
}

fn media_kind(kind: TrackKind) -> MediaKind {
    match kind {
        TrackKind::Audio => MediaKind::Audio,
        TrackKind::Video => MediaKind::Video,
    }
}

fn rejected(e: impl std::fmt::Debug) -> NegotiationError {
    NegotiationError::Description(format!("{:?}", e))
}

impl MediaConnection for Str0mConnection {
    fn add_track(&mut self, stream_id: &str, track: &MediaTrack) -> Result<(), NegotiationError> {
        self.tracks.push((stream_id.to_string(), track.clone()));
        Ok(())
    }

    fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        let mut rtc = self.shared.rtc();
        let mut change = rtc.sdp_api();

        for (stream_id, track) in &self.tracks {
            change.add_media(
                media_kind(track.kind),
                Direction::SendRecv,
                Some(stream_id.clone()),
                Some(track.id.clone()),
                None,
            );
        }
        if !change.has_changes() {
            // receive-only, like offerToReceiveVideo
            change.add_media(MediaKind::Video, Direction::RecvOnly, None, None, None);
        }

        let Some((offer, pending)) = change.apply() else {
            return Err(NegotiationError::Description("nothing to offer".to_string()));
        };
        self.pending = Some(pending);

        Ok(SessionDescription::offer(offer.to_sdp_string()))
    }

    fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.remote_offer.take().ok_or_else(|| {
            NegotiationError::Description("no remote offer to answer".to_string())
        })?;
        let answer = self
            .shared
            .rtc()
            .sdp_api()
            .accept_offer(offer)
            .map_err(rejected)?;

        Ok(SessionDescription::answer(answer.to_sdp_string()))
    }

    /// `str0m` applies local descriptions as it creates them; this marks the
    /// start of gathering, which for a single host candidate is immediate.
    fn set_local_description(&mut self, _desc: &SessionDescription) -> Result<(), NegotiationError> {
        self.events.emit(MediaEvent::LocalCandidate(IceCandidate {
            candidate: self.candidate.to_sdp_string(),
            sdp_mid: None,
            sdp_m_line_index: Some(0),
        }));
        self.shared.wake.notify_one();
        Ok(())
    }

    fn set_remote_description(&mut self, desc: &SessionDescription) -> Result<(), NegotiationError> {
        match desc.kind {
            SdpKind::Offer => {
                self.remote_offer = Some(SdpOffer::from_sdp_string(&desc.sdp).map_err(rejected)?);
            }
            SdpKind::Answer => {
                let answer = SdpAnswer::from_sdp_string(&desc.sdp).map_err(rejected)?;
                let pending = self.pending.take().ok_or_else(|| {
                    NegotiationError::Description("answer without a pending offer".to_string())
                })?;
                self.shared
                    .rtc()
                    .sdp_api()
                    .accept_answer(pending, answer)
                    .map_err(rejected)?;
                self.shared.wake.notify_one();
            }
        }
        Ok(())
    }

    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        let candidate = Candidate::from_sdp_string(&candidate.candidate)
            .map_err(|e| NegotiationError::Candidate(format!("{:?}", e)))?;
        self.shared.rtc().add_remote_candidate(candidate);
        self.shared.wake.notify_one();
        Ok(())
    }

    fn close(&mut self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            self.shared.rtc().disconnect();
            self.shared.wake.notify_one();
        }
    }
}

impl Drop for Str0mConnection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn drive(shared: Arc<Shared>, socket: UdpSocket, local: SocketAddr, events: MediaEvents) {
    let mut buf = vec![0; 2000];

    loop {
        if shared.is_closed() {
            break;
        }

        let timeout = {
            let mut rtc = shared.rtc();
            match poll_until_timeout(&mut rtc, &socket, &events) {
                Some(t) => t,
                None => break,
            }
        };

        // The timeout is not allowed to be 0.
        let duration = timeout
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1));

        buf.resize(2000, 0);
        tokio::select! {
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(duration) => {
                let mut rtc = shared.rtc();
                if let Err(e) = rtc.handle_input(Input::Timeout(Instant::now())) {
                    warn!("Connection to {} failed: {:?}", events.remote(), e);
                    rtc.disconnect();
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, source)) => {
                    buf.truncate(n);
                    // Parse data to a DatagramRecv, which demultiplexes
                    // STUN, DTLS and RTP arriving on the one port.
                    let Ok(contents) = buf.as_slice().try_into() else {
                        continue;
                    };
                    let input = Input::Receive(
                        Instant::now(),
                        Receive {
                            proto: Protocol::Udp,
                            source,
                            destination: local,
                            contents,
                        },
                    );
                    let mut rtc = shared.rtc();
                    if let Err(e) = rtc.handle_input(input) {
                        warn!("Connection to {} failed: {:?}", events.remote(), e);
                        rtc.disconnect();
                    }
                }
                Err(e) => debug!("UDP read for {} failed: {}", events.remote(), e),
            },
        }
    }

    if !shared.is_closed() {
        events.emit(MediaEvent::Disconnected);
    }
    debug!("Media driver for {} stopped", events.remote());
}

/// Poll all output until `str0m` asks to be woken at a deadline. `None` once
/// the connection is dead.
fn poll_until_timeout(rtc: &mut Rtc, socket: &UdpSocket, events: &MediaEvents) -> Option<Instant> {
    loop {
        if !rtc.is_alive() {
            return None;
        }

        match rtc.poll_output() {
            Ok(Output::Timeout(t)) => return Some(t),
            Ok(Output::Transmit(transmit)) => {
                if let Err(e) = socket.try_send_to(&transmit.contents, transmit.destination) {
                    debug!("UDP send to {} failed: {}", transmit.destination, e);
                }
            }
            Ok(Output::Event(event)) => handle_event(rtc, event, events),
            Err(e) => {
                warn!("Connection to {} poll_output failed: {:?}", events.remote(), e);
                rtc.disconnect();
                return None;
            }
        }
    }
}

fn handle_event(rtc: &mut Rtc, event: Event, events: &MediaEvents) {
    match event {
        Event::Connected => {
            info!("Media connected with {}", events.remote());
            events.emit(MediaEvent::Connected);
        }
        Event::IceConnectionStateChange(state) => {
            info!("ICE state with {} = {:?}", events.remote(), state);
            if state == IceConnectionState::Disconnected {
                // no ICE restart; the session is torn down instead
                rtc.disconnect();
            }
        }
        Event::MediaAdded(added) => {
            let kind = match added.kind {
                MediaKind::Audio => TrackKind::Audio,
                MediaKind::Video => TrackKind::Video,
            };
            events.emit(MediaEvent::RemoteTrack(MediaTrack {
                id: added.mid.to_string(),
                kind,
            }));
        }
        _ => {}
    }
}
