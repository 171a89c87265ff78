//! Signaling connection contract and the websocket implementation
//!
//! Controllers consume the [`SignalConnection`] trait only: request/ack round
//! trips, fire-and-forget notifications, an arrival-ordered message stream per
//! subscriber, and connection lifecycle events.

pub mod protocol;
mod websocket;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::error::Result;

pub use protocol::{ClientMessage, ServerMessage};
pub use websocket::WsSignalConnection;

/// Connection lifecycle events
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The underlying channel is (re)established
    Connected { recovered: bool },
    /// The channel dropped; the implementation may still recover it
    Disconnected,
    /// The channel is gone for good
    Closed,
}

/// Bidirectional signaling channel with request/acknowledgement semantics
///
/// Messages are delivered to each subscriber in arrival order. A request's
/// acknowledgement is never observed out of order relative to other messages
/// on the same channel.
#[async_trait]
pub trait SignalConnection: Send + Sync {
    fn connected(&self) -> bool;

    /// Send a request and await its acknowledgement payload. Server-side
    /// errors surface as [`crate::Error::Server`].
    async fn request(&self, message: ClientMessage) -> Result<serde_json::Value>;

    /// Fire-and-forget notification; delivery failures are logged, not raised
    fn notify(&self, message: ClientMessage);

    /// Stream of server-pushed messages, in arrival order
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ServerMessage>;

    /// Lifecycle event stream
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Close the channel irreversibly; pending requests are rejected
    fn close(&self);
}
