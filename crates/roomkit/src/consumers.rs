//! Incoming peer streams
//!
//! Tracks every consumer the server creates for us, keyed by consumer id and
//! indexed by (peer, label). Consumers are born paused server-side; the
//! controller resumes them with an acknowledged round trip and afterwards
//! mirrors pause state changes from both sides. Availability of a stream is
//! `!paused && !producer_paused`; subscribers only hear about availability
//! flips, not every state echo.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{ConsumerOptions, MediaConsumer, MediaKind, MediaTrack};
use crate::signaling::protocol::{
    ConsumerClosedPayload, ConsumerCreatedPayload, ConsumerKeyFrameRequestPayload,
    ConsumerLayersSetPayload, ConsumerPriorityPayload, ConsumerStatePayload, ConsumerTogglePayload,
};
use crate::signaling::{ClientMessage, ServerMessage, SignalConnection};
use crate::transport::MultiTransportConnector;

/// Changes to the set of incoming streams
#[derive(Clone, Debug)]
pub enum PeerStreamEvent {
    /// A consumer exists; `available` is false until the resume round trip
    /// completes
    Created {
        consumer_id: String,
        peer_id: String,
        label: String,
        kind: MediaKind,
        available: bool,
    },
    /// Availability flipped
    Toggle {
        consumer_id: String,
        peer_id: String,
        label: String,
        available: bool,
    },
    Closed {
        consumer_id: String,
        peer_id: String,
        label: String,
    },
}

struct Entry {
    consumer: Arc<dyn MediaConsumer>,
    peer_id: String,
    label: String,
    router_id: Option<String>,
    paused: bool,
    producer_paused: bool,
}

impl Entry {
    fn available(&self) -> bool {
        !self.paused && !self.producer_paused
    }
}

struct ControllerState {
    /// Consumer ids seen, including ones still being set up
    known: HashSet<String>,
    entries: HashMap<String, Entry>,
    by_peer_label: HashMap<(String, String), String>,
    listener: Option<JoinHandle<()>>,
    closed: bool,
}

struct Inner {
    conn: Arc<dyn SignalConnection>,
    transports: Arc<MultiTransportConnector>,
    state: Mutex<ControllerState>,
    events: broadcast::Sender<PeerStreamEvent>,
}

impl Inner {
    fn emit(&self, event: PeerStreamEvent) {
        let _ = self.events.send(event);
    }

    async fn handle_created(self: Arc<Self>, payload: ConsumerCreatedPayload) {
        {
            let mut state = self.state.lock();
            if state.closed || !state.known.insert(payload.id.clone()) {
                debug!(id = %payload.id, "duplicate consumer announcement ignored");
                return;
            }
        }

        let transport = match self.transports.transport(Some(&payload.transport_id)).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(id = %payload.id, error = %e, "no transport for announced consumer");
                self.state.lock().known.remove(&payload.id);
                return;
            }
        };
        let options = ConsumerOptions {
            id: payload.id.clone(),
            producer_id: payload.producer_id.clone(),
            kind: payload.kind,
            rtp_parameters: payload.rtp_parameters.clone(),
            label: payload.label.clone(),
            peer_id: payload.peer_id.clone(),
        };
        let consumer = match transport.consume(options).await {
            Ok(consumer) => consumer,
            Err(e) => {
                warn!(id = %payload.id, error = %e, "consume failed");
                self.state.lock().known.remove(&payload.id);
                return;
            }
        };

        // Consumers are created paused server-side
        consumer.pause();

        let ended_weak = Arc::downgrade(&self);
        let ended_id = payload.id.clone();
        consumer.set_track_ended_handler(Arc::new(move || {
            if let Some(inner) = ended_weak.upgrade() {
                inner.close_consumer(&ended_id);
            }
        }));
        let closed_weak = Arc::downgrade(&self);
        let closed_id = payload.id.clone();
        consumer.set_transport_close_handler(Arc::new(move || {
            if let Some(inner) = closed_weak.upgrade() {
                inner.close_consumer(&closed_id);
            }
        }));

        {
            let mut state = self.state.lock();
            if state.closed {
                consumer.close();
                return;
            }
            state.by_peer_label.insert(
                (payload.peer_id.clone(), payload.label.clone()),
                payload.id.clone(),
            );
            state.entries.insert(
                payload.id.clone(),
                Entry {
                    consumer: Arc::clone(&consumer),
                    peer_id: payload.peer_id.clone(),
                    label: payload.label.clone(),
                    router_id: payload.router_id.clone(),
                    paused: true,
                    producer_paused: payload.producer_paused,
                },
            );
        }
        info!(id = %payload.id, peer = %payload.peer_id, label = %payload.label, "consumer created");
        self.emit(PeerStreamEvent::Created {
            consumer_id: payload.id.clone(),
            peer_id: payload.peer_id.clone(),
            label: payload.label.clone(),
            kind: payload.kind,
            available: false,
        });

        // Resume round trip; only an acknowledged resume makes the stream live
        let resume = ClientMessage::ConsumerToggle(ConsumerTogglePayload {
            id: payload.id.clone(),
            paused: false,
            router_id: payload.router_id.clone(),
        });
        match self.conn.request(resume).await {
            Ok(_) => {
                let available = {
                    let mut state = self.state.lock();
                    let Some(entry) = state.entries.get_mut(&payload.id) else { return };
                    entry.paused = false;
                    if entry.available() {
                        entry.consumer.resume();
                    }
                    entry.available()
                };
                self.emit(PeerStreamEvent::Toggle {
                    consumer_id: payload.id,
                    peer_id: payload.peer_id,
                    label: payload.label,
                    available,
                });
            }
            Err(e) => warn!(id = %payload.id, error = %e, "consumer resume rejected"),
        }
    }

    fn handle_state(&self, payload: ConsumerStatePayload) {
        let flip = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(&payload.id) else { return };
            let before = entry.available();
            entry.paused = payload.paused;
            entry.producer_paused = payload.producer_paused;
            let after = entry.available();
            if after {
                entry.consumer.resume();
            } else {
                entry.consumer.pause();
            }
            (before != after).then(|| PeerStreamEvent::Toggle {
                consumer_id: payload.id.clone(),
                peer_id: entry.peer_id.clone(),
                label: entry.label.clone(),
                available: after,
            })
        };
        if let Some(event) = flip {
            self.emit(event);
        }
    }

    /// Single teardown path for server close, track end and transport close
    fn close_consumer(&self, consumer_id: &str) {
        let entry = {
            let mut state = self.state.lock();
            state.known.remove(consumer_id);
            let entry = state.entries.remove(consumer_id);
            if let Some(entry) = &entry {
                state
                    .by_peer_label
                    .remove(&(entry.peer_id.clone(), entry.label.clone()));
            }
            entry
        };
        if let Some(entry) = entry {
            entry.consumer.close();
            info!(id = %consumer_id, peer = %entry.peer_id, "consumer closed");
            self.emit(PeerStreamEvent::Closed {
                consumer_id: consumer_id.to_string(),
                peer_id: entry.peer_id,
                label: entry.label,
            });
        }
    }

    fn with_entry<R>(&self, peer_id: &str, label: &str, f: impl FnOnce(&Entry) -> R) -> Option<R> {
        let state = self.state.lock();
        let id = state
            .by_peer_label
            .get(&(peer_id.to_string(), label.to_string()))?;
        state.entries.get(id).map(f)
    }
}

/// All consumers of remote peers' media
pub struct PeerStreamsController {
    inner: Arc<Inner>,
}

impl PeerStreamsController {
    pub fn new(conn: Arc<dyn SignalConnection>, transports: Arc<MultiTransportConnector>) -> Self {
        let (events, _) = broadcast::channel(64);
        let inner = Arc::new(Inner {
            conn: Arc::clone(&conn),
            transports,
            state: Mutex::new(ControllerState {
                known: HashSet::new(),
                entries: HashMap::new(),
                by_peer_label: HashMap::new(),
                listener: None,
                closed: false,
            }),
            events,
        });

        let loop_inner = Arc::clone(&inner);
        let mut messages = conn.subscribe();
        let listener = tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                match message {
                    ServerMessage::ConsumerCreated(payload) => {
                        tokio::spawn(Arc::clone(&loop_inner).handle_created(payload));
                    }
                    ServerMessage::ConsumerState(payload) => loop_inner.handle_state(payload),
                    ServerMessage::ConsumerClosed(ConsumerClosedPayload { id }) => {
                        loop_inner.close_consumer(&id)
                    }
                    _ => {}
                }
            }
        });
        inner.state.lock().listener = Some(listener);

        Self { inner }
    }

    pub fn events(&self) -> broadcast::Receiver<PeerStreamEvent> {
        self.inner.events.subscribe()
    }

    /// The live track of a peer's stream; None while it isn't flowing
    pub fn media_track(&self, peer_id: &str, label: &str) -> Option<Arc<dyn MediaTrack>> {
        self.inner.with_entry(peer_id, label, |entry| {
            (!entry.consumer.closed() && entry.available()).then(|| entry.consumer.track())
        })?
    }

    /// Ask the producer side for a key frame
    pub fn request_key_frame(&self, peer_id: &str, label: &str) {
        let Some((id, router_id)) = self.lookup(peer_id, label) else { return };
        self.inner
            .conn
            .notify(ClientMessage::ConsumerKeyFrameRequest(
                ConsumerKeyFrameRequestPayload { id, router_id },
            ));
    }

    /// Pin preferred simulcast/SVC layers
    pub fn set_preferred_layers(&self, peer_id: &str, label: &str, spatial: u8, temporal: u8) {
        let Some((id, router_id)) = self.lookup(peer_id, label) else { return };
        self.inner
            .conn
            .notify(ClientMessage::ConsumerLayersSet(ConsumerLayersSetPayload {
                id,
                spatial_layer: spatial,
                temporal_layer: temporal,
                router_id,
            }));
    }

    pub fn set_priority(&self, peer_id: &str, label: &str, priority: u8) {
        let Some((id, router_id)) = self.lookup(peer_id, label) else { return };
        self.inner
            .conn
            .notify(ClientMessage::ConsumerPriority(ConsumerPriorityPayload {
                id,
                priority,
                router_id,
            }));
    }

    fn lookup(&self, peer_id: &str, label: &str) -> Option<(String, Option<String>)> {
        self.inner.with_entry(peer_id, label, |entry| {
            (entry.consumer.id(), entry.router_id.clone())
        })
    }

    pub fn close(&self) {
        let entries = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            if let Some(listener) = state.listener.take() {
                listener.abort();
            }
            state.known.clear();
            state.by_peer_label.clear();
            state.entries.drain().collect::<Vec<_>>()
        };
        for (_, entry) in entries {
            entry.consumer.close();
        }
    }
}

impl Drop for PeerStreamsController {
    fn drop(&mut self) {
        self.close();
    }
}
