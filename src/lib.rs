//! Peer-to-peer call signaling
//!
//! Clients exchange offers, answers and ICE candidates through a WebSocket
//! relay, then talk media directly. The [`negotiation`] module ties the pieces
//! together; [`relay`] is the server side.

pub mod codec;
pub mod config;
pub mod error;
pub mod media;
pub mod model;
pub mod negotiation;
pub mod relay;
pub mod router;
pub mod session;
pub mod transport;
pub mod util;

pub use config::{CallConfig, IdentityMode, NegotiationConfig, RelayConfig, TransportConfig};
pub use error::{Error, Result};
pub use model::client::ClientId;
pub use model::event::CallEvent;
pub use negotiation::{connect, connect_with, CallHandle};
pub use relay::RelayServer;
