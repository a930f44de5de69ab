//! Wire framing for envelopes
//!
//! One framing only: a JSON object, version 1.
//!
//! ```json
//! {"v":1,"to":"222","from":"111","type":"offer","data":{"sdp":"..."}}
//! ```
//!
//! Frames without `v` are read as version 1. Text in the retired `type:rest`
//! delimited framing is recognised only to be rejected with
//! [`ProtocolError::LegacyFrame`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::model::client::ClientId;
use crate::model::envelope::{CandidatePayload, Envelope, MessageKind, SdpPayload, Signal};

pub const WIRE_VERSION: u8 = 1;

#[derive(Serialize)]
struct FrameOut<'a> {
    v: u8,
    to: &'a ClientId,
    from: &'a ClientId,
    #[serde(rename = "type")]
    kind: &'static str,
    data: Value,
}

#[derive(Deserialize)]
struct FrameIn {
    #[serde(default)]
    v: Option<u8>,
    to: ClientId,
    from: ClientId,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Only the routing part of a frame, for the relay.
#[derive(Deserialize)]
struct Route {
    to: ClientId,
}

pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    let data = match &envelope.signal {
        Signal::Offer(p) | Signal::Answer(p) => serde_json::to_value(p)?,
        Signal::NewIceCandidate(p) => serde_json::to_value(p)?,
    };

    let frame = FrameOut {
        v: WIRE_VERSION,
        to: &envelope.to,
        from: &envelope.from,
        kind: envelope.kind().as_str(),
        data,
    };

    Ok(serde_json::to_string(&frame)?)
}

pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    reject_legacy(text)?;

    let frame: FrameIn = serde_json::from_str(text)?;
    let version = frame.v.unwrap_or(WIRE_VERSION);
    if version != WIRE_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let kind: MessageKind = frame.kind.parse()?;
    let signal = match kind {
        MessageKind::Offer => Signal::Offer(payload::<SdpPayload>(kind, frame.data)?),
        MessageKind::Answer => Signal::Answer(payload::<SdpPayload>(kind, frame.data)?),
        MessageKind::NewIceCandidate => {
            Signal::NewIceCandidate(payload::<CandidatePayload>(kind, frame.data)?)
        }
    };

    Ok(Envelope::new(frame.to, frame.from, signal))
}

/// Recipient of a frame, without decoding its payload.
pub fn route(text: &str) -> Result<ClientId, ProtocolError> {
    reject_legacy(text)?;
    let route: Route = serde_json::from_str(text)?;
    Ok(route.to)
}

fn payload<T: serde::de::DeserializeOwned>(
    kind: MessageKind,
    data: Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidPayload {
        kind: kind.as_str(),
        source,
    })
}

fn reject_legacy(text: &str) -> Result<(), ProtocolError> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') {
        return Ok(());
    }

    match trimmed.split_once(':') {
        Some((prefix, _)) => Err(ProtocolError::LegacyFrame(prefix.to_string())),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::sdp::IceCandidate;

    fn id(s: &str) -> ClientId {
        ClientId::new(s).unwrap()
    }

    #[test]
    fn encodes_versioned_flat_frame() {
        let env = Envelope::new(
            id("222"),
            id("111"),
            Signal::Offer(SdpPayload { sdp: "OFFER".into() }),
        );
        let value: Value = serde_json::from_str(&encode(&env).unwrap()).unwrap();

        assert_eq!(value["v"], 1);
        assert_eq!(value["to"], "222");
        assert_eq!(value["from"], "111");
        assert_eq!(value["type"], "offer");
        assert_eq!(value["data"]["sdp"], "OFFER");
    }

    #[test]
    fn decodes_candidate_in_browser_shape() {
        let text = r#"{"v":1,"to":"111","from":"222","type":"new-ice-candidate",
            "data":{"candidate":{"candidate":"candidate:1 1 udp 2122 10.0.0.2 5000 typ host",
            "sdpMid":"0","sdpMLineIndex":0}}}"#;
        let env = decode(text).unwrap();

        let Signal::NewIceCandidate(p) = env.signal else {
            panic!("expected candidate, got {:?}", env.signal);
        };
        assert_eq!(p.candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(p.candidate.sdp_m_line_index, Some(0));
    }

    #[test]
    fn missing_version_reads_as_v1() {
        let env = decode(r#"{"to":"1","from":"2","type":"answer","data":{"sdp":"x"}}"#).unwrap();
        assert_eq!(env.kind(), MessageKind::Answer);
    }

    #[test]
    fn rejects_other_versions() {
        let err = decode(r#"{"v":2,"to":"1","from":"2","type":"answer","data":{"sdp":"x"}}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedVersion(2)));
    }

    #[test]
    fn rejects_unknown_type() {
        let err =
            decode(r#"{"to":"1","from":"2","type":"findClient","data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownKind(k) if k == "findClient"));
    }

    #[test]
    fn rejects_empty_addresses() {
        assert!(decode(r#"{"to":"","from":"2","type":"offer","data":{"sdp":"x"}}"#).is_err());
        let env = Envelope::new(
            id("1"),
            id("2"),
            Signal::candidate(IceCandidate::new("candidate:x")),
        );
        assert!(encode(&env).is_ok());
    }

    #[test]
    fn payload_shape_follows_type() {
        let err = decode(r#"{"to":"1","from":"2","type":"offer","data":{"candidate":"x"}}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { kind: "offer", .. }));
    }

    #[test]
    fn legacy_delimited_frames_are_rejected() {
        let err = decode("answer:111").unwrap_err();
        assert!(matches!(err, ProtocolError::LegacyFrame(p) if p == "answer"));
        assert!(matches!(route("remote:222"), Err(ProtocolError::LegacyFrame(_))));
    }

    #[test]
    fn route_reads_recipient_only() {
        let to = route(r#"{"to":"222","from":"111","type":"whatever","data":null}"#).unwrap();
        assert_eq!(to.as_str(), "222");
    }
}
