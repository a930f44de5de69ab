//! Data models for call signaling
//!
//! Plain data shared by the transport, router and negotiation layers: client
//! identities, envelopes, session descriptions, negotiation states and the
//! events published to the application.

pub mod client;
pub mod envelope;
pub mod event;
pub mod negotiation;
pub mod sdp;
