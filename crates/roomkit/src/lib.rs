//! Resilient client SDK for SFU media sessions
//!
//! The crate keeps one signaling connection and two transport legs (send and
//! receive) alive against an SFU, recovering from ICE drops, transport loss
//! and signaling reconnects without the application noticing more than a
//! stream pause.
//!
//! # Architecture
//!
//! - [`signaling`]: the websocket wire protocol and the [`SignalConnection`]
//!   trait the rest of the crate consumes
//! - [`engine`]: traits the actual WebRTC implementation plugs into
//! - [`router`]: per-router capability devices, primary router election
//! - [`transport`]: connectors and the restart state machines that keep each
//!   transport leg alive
//! - [`consumers`]: incoming streams of remote peers
//! - [`stream`]: outgoing stream handles
//! - [`session`]: the façade tying it all together
//! - [`client`]: provisioning and connect bootstrap
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use roomkit::{RoomClient, SessionConfig, SessionEvent};
//! # use roomkit::engine::MediaEngine;
//!
//! # async fn run(engine: Arc<dyn MediaEngine>) -> roomkit::Result<()> {
//! let config = SessionConfig::new("https://api.example.com").with_auth_token("token");
//! let client = RoomClient::new(config)?;
//! let session = client.connect("lobby", engine).await?;
//!
//! let mut events = session.events();
//! session.join().await?;
//! while let Ok(event) = events.recv().await {
//!     if matches!(event, SessionEvent::Ready) {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod consumers;
pub mod engine;
pub mod error;
pub mod retry;
pub mod router;
pub mod session;
pub mod signaling;
pub mod stream;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{RoomClient, SessionDescriptor};
pub use config::{IceServer, IceTransportPolicy, SessionConfig, TransportPolicy};
pub use consumers::{PeerStreamEvent, PeerStreamsController};
pub use error::{Error, Result};
pub use retry::RetryPolicy;
pub use session::{RtcSession, SessionEvent};
pub use signaling::{ConnectionEvent, SignalConnection, WsSignalConnection};
pub use stream::{OutgoingStream, OutgoingStreamEvent};
