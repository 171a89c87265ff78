//! Outgoing stream handle
//!
//! Wraps one producer. Pause and resume are acknowledged round trips: the
//! local producer only changes state after the server accepted the toggle.
//! Server-initiated state changes and closes arrive through the session and
//! are applied locally without another round trip.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::engine::{MediaKind, MediaProducer, MediaTrack};
use crate::error::{Error, Result};
use crate::signaling::protocol::{ProducerClosePayload, ProducerTogglePayload};
use crate::signaling::{ClientMessage, SignalConnection};

#[derive(Clone, Debug)]
pub enum OutgoingStreamEvent {
    /// Pause state changed, locally or server-side
    Toggle { paused: bool },
    Closed,
}

struct Inner {
    conn: Arc<dyn SignalConnection>,
    producer: Arc<dyn MediaProducer>,
    label: String,
    closed: AtomicBool,
    events: broadcast::Sender<OutgoingStreamEvent>,
}

impl Inner {
    fn emit(&self, event: OutgoingStreamEvent) {
        let _ = self.events.send(event);
    }

    /// Teardown without the server notification; used when the close
    /// originated remotely or from the transport
    fn close_local(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.producer.close();
        info!(id = %self.producer.id(), label = %self.label, "outgoing stream closed");
        self.emit(OutgoingStreamEvent::Closed);
    }
}

/// Handle to one outgoing media stream
#[derive(Clone)]
pub struct OutgoingStream {
    inner: Arc<Inner>,
}

impl OutgoingStream {
    pub(crate) fn new(conn: Arc<dyn SignalConnection>, producer: Arc<dyn MediaProducer>) -> Self {
        let (events, _) = broadcast::channel(16);
        let label = producer.label();
        let inner = Arc::new(Inner {
            conn,
            producer,
            label,
            closed: AtomicBool::new(false),
            events,
        });
        let weak = Arc::downgrade(&inner);
        inner.producer.set_transport_close_handler(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.close_local();
            }
        }));
        Self { inner }
    }

    pub fn id(&self) -> String {
        self.inner.producer.id()
    }

    pub fn label(&self) -> String {
        self.inner.label.clone()
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.producer.kind()
    }

    pub fn paused(&self) -> bool {
        self.inner.producer.paused()
    }

    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> broadcast::Receiver<OutgoingStreamEvent> {
        self.inner.events.subscribe()
    }

    pub async fn pause(&self) -> Result<()> {
        self.set_paused(true).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.set_paused(false).await
    }

    /// Acknowledged pause toggle; a no-op if already in the target state
    pub async fn set_paused(&self, paused: bool) -> Result<()> {
        if self.closed() {
            return Err(Error::StreamClosed);
        }
        if self.inner.producer.paused() == paused {
            return Ok(());
        }
        self.inner
            .conn
            .request(ClientMessage::ProducerToggle(ProducerTogglePayload {
                id: self.inner.producer.id(),
                paused,
            }))
            .await?;
        if paused {
            self.inner.producer.pause();
        } else {
            self.inner.producer.resume();
        }
        self.inner.emit(OutgoingStreamEvent::Toggle { paused });
        Ok(())
    }

    /// Swap the media track feeding this stream
    pub async fn set_media_track(&self, track: Arc<dyn MediaTrack>) -> Result<()> {
        if self.closed() {
            return Err(Error::StreamClosed);
        }
        self.inner.producer.replace_track(track).await
    }

    pub fn set_max_spatial_layer(&self, layer: u8) {
        if !self.closed() {
            self.inner.producer.set_max_spatial_layer(layer);
        }
    }

    /// Close the stream and release the server-side producer; idempotent
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner
            .conn
            .notify(ClientMessage::ProducerClose(ProducerClosePayload {
                id: self.inner.producer.id(),
            }));
        self.inner.producer.close();
        info!(id = %self.inner.producer.id(), label = %self.inner.label, "outgoing stream closed");
        self.inner.emit(OutgoingStreamEvent::Closed);
    }

    /// Server toggled the producer; apply locally without a round trip
    pub(crate) fn handle_producer_state(&self, paused: bool) {
        if self.closed() || self.inner.producer.paused() == paused {
            return;
        }
        debug!(id = %self.inner.producer.id(), paused, "producer toggled server-side");
        if paused {
            self.inner.producer.pause();
        } else {
            self.inner.producer.resume();
        }
        self.inner.emit(OutgoingStreamEvent::Toggle { paused });
    }

    /// Server closed the producer. `"client"` closes are echoes of our own
    /// [`close`](Self::close) and ignored.
    pub(crate) fn handle_producer_closed(&self, reason: &str) {
        if reason == "client" {
            return;
        }
        self.inner.close_local();
    }
}
