//! Session façade
//!
//! Ties the signaling connection, the router devices, both transport legs,
//! the incoming stream controller and the outgoing stream handles together.
//! A session is Ready when receiving works and sending either works too or
//! is knowingly impossible (no media permission granted).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::consumers::{PeerStreamEvent, PeerStreamsController};
use crate::engine::{MediaDevice, MediaEngine, MediaKind, MediaTrack, ProducerOptions};
use crate::error::{Error, Result};
use crate::router::{CapsFilters, RouterConnector};
use crate::signaling::protocol::{
    ConnectedPayload, EndpointCapsPayload, PermissionsPayload, ProducerClosedPayload,
    ProducerStatePayload,
};
use crate::signaling::{ClientMessage, ServerMessage, SignalConnection};
use crate::stream::{OutgoingStream, OutgoingStreamEvent};
use crate::transport::{MultiTransportConnector, SendTransportConnector, TransportEvent};

/// Session lifecycle notifications
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// The server (re)established our session
    Connected {
        peer_id: String,
        room_id: String,
        recovered: bool,
    },
    Joined,
    /// Receiving works and sending works or is knowingly impossible
    Ready,
    Permissions {
        available: HashMap<String, bool>,
        current: HashMap<String, bool>,
    },
    /// Incoming stream change
    PeerStream(PeerStreamEvent),
    /// A transport leg gave up on recovery
    Failure { reason: String },
    Closed,
}

struct SessionState {
    peer_id: Option<String>,
    room_id: Option<String>,
    joined: bool,
    consuming_ready: bool,
    producing_ready: bool,
    perms_received: bool,
    permissions: PermissionsPayload,
    send_closed: bool,
    ready_emitted: bool,
    /// Outgoing streams by label
    streams: HashMap<String, OutgoingStream>,
    /// Producer id to label, for routing server producer messages
    producer_labels: HashMap<String, String>,
    primary_device: Option<Arc<dyn MediaDevice>>,
    listeners: Vec<JoinHandle<()>>,
    closed: bool,
}

struct Inner {
    conn: Arc<dyn SignalConnection>,
    config: SessionConfig,
    routers: RouterConnector,
    send: SendTransportConnector,
    recv: Arc<MultiTransportConnector>,
    peers: PeerStreamsController,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn on_device_ready(
        self: &Arc<Self>,
        router_id: String,
        device: Arc<dyn MediaDevice>,
        is_primary: bool,
    ) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if is_primary {
                state.primary_device = Some(Arc::clone(&device));
            }
        }
        if is_primary {
            self.send.add_router(router_id.clone(), Arc::clone(&device));
        }
        // Every loaded device announces what this endpoint can receive on it
        self.conn
            .notify(ClientMessage::EndpointCaps(EndpointCapsPayload {
                rtp_capabilities: device.rtp_capabilities(),
                sctp_capabilities: Some(device.sctp_capabilities()),
            }));
        self.recv.add_router(router_id, device);
    }

    fn handle_connected(self: &Arc<Self>, payload: ConnectedPayload) {
        let rejoin = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.peer_id = Some(payload.peer_id.clone());
            state.room_id = Some(payload.room_id.clone());
            // The media path is rebuilt from scratch after a reconnect
            state.consuming_ready = false;
            state.producing_ready = false;
            state.ready_emitted = false;
            self.config.auto_rejoin && state.joined
        };
        info!(peer_id = %payload.peer_id, recovered = payload.recovered, "session connected");
        self.emit(SessionEvent::Connected {
            peer_id: payload.peer_id,
            room_id: payload.room_id,
            recovered: payload.recovered,
        });
        if rejoin {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = inner.conn.request(ClientMessage::Join).await {
                    warn!(error = %e, "automatic re-join failed");
                }
            });
        }
    }

    fn handle_permissions(&self, payload: PermissionsPayload) {
        let producible = payload.current.values().any(|granted| *granted);
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.perms_received = true;
            state.permissions = payload.clone();
        }
        if producible {
            debug!("media permitted, starting send transport");
            self.send.start();
        } else {
            // Nothing to send, ever: the recv leg alone decides readiness
            debug!("no media permission, closing send transport");
            self.state.lock().send_closed = true;
            self.send.close();
        }
        self.emit(SessionEvent::Permissions {
            available: payload.available,
            current: payload.current,
        });
        self.check_ready();
    }

    fn route_producer_state(&self, payload: ProducerStatePayload) {
        if let Some(stream) = self.stream_by_producer(&payload.id) {
            stream.handle_producer_state(payload.paused);
        }
    }

    fn route_producer_closed(&self, payload: ProducerClosedPayload) {
        if let Some(stream) = self.stream_by_producer(&payload.id) {
            stream.handle_producer_closed(&payload.reason);
        }
    }

    fn stream_by_producer(&self, producer_id: &str) -> Option<OutgoingStream> {
        let state = self.state.lock();
        let label = state.producer_labels.get(producer_id)?;
        state.streams.get(label).cloned()
    }

    fn check_ready(&self) {
        let ready = {
            let mut state = self.state.lock();
            if state.closed || state.ready_emitted {
                return;
            }
            let producible = state.permissions.current.values().any(|granted| *granted);
            let sending_settled =
                state.producing_ready || (state.perms_received && !producible);
            if state.consuming_ready && sending_settled {
                state.ready_emitted = true;
                true
            } else {
                false
            }
        };
        if ready {
            info!("session ready");
            self.emit(SessionEvent::Ready);
        }
    }

    fn forget_stream(&self, label: &str) {
        let mut state = self.state.lock();
        if let Some(stream) = state.streams.remove(label) {
            state.producer_labels.remove(&stream.id());
        }
    }
}

/// A connected media session
pub struct RtcSession {
    inner: Arc<Inner>,
}

impl RtcSession {
    /// Build a session on an established signaling connection. Most callers
    /// go through [`RoomClient::connect`](crate::client::RoomClient::connect)
    /// instead.
    pub fn new(
        conn: Arc<dyn SignalConnection>,
        engine: Arc<dyn MediaEngine>,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let recv = Arc::new(MultiTransportConnector::new(
            Arc::clone(&conn),
            config.recv_transport.clone(),
            config.ice_servers.clone(),
            config.ice_transport_policy,
        ));
        let send = SendTransportConnector::new(
            Arc::clone(&conn),
            config.send_transport.clone(),
            config.ice_servers.clone(),
            config.ice_transport_policy,
        );
        let peers = PeerStreamsController::new(Arc::clone(&conn), Arc::clone(&recv));
        let (events, _) = broadcast::channel(64);

        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<Inner>| {
            let device_weak = std::sync::Weak::clone(weak);
            let failed_weak = std::sync::Weak::clone(weak);
            let routers = RouterConnector::new(
                Arc::clone(&conn),
                engine,
                CapsFilters::default(),
                Arc::new(move |router_id, device, is_primary| {
                    if let Some(inner) = device_weak.upgrade() {
                        inner.on_device_ready(router_id, device, is_primary);
                    }
                }),
                Arc::new(move |error| {
                    if let Some(inner) = failed_weak.upgrade() {
                        inner.emit(SessionEvent::Failure {
                            reason: error.to_string(),
                        });
                    }
                }),
            );
            Inner {
                conn,
                config,
                routers,
                send,
                recv,
                peers,
                state: Mutex::new(SessionState {
                    peer_id: None,
                    room_id: None,
                    joined: false,
                    consuming_ready: false,
                    producing_ready: false,
                    perms_received: false,
                    permissions: PermissionsPayload::default(),
                    send_closed: false,
                    ready_emitted: false,
                    streams: HashMap::new(),
                    producer_labels: HashMap::new(),
                    primary_device: None,
                    listeners: Vec::new(),
                    closed: false,
                }),
                events,
            }
        });

        Self::spawn_listeners(&inner);
        Ok(Self { inner })
    }

    fn spawn_listeners(inner: &Arc<Inner>) {
        let mut listeners = Vec::new();

        let msg_inner = Arc::clone(inner);
        let mut messages = inner.conn.subscribe();
        listeners.push(tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                match message {
                    ServerMessage::Connected(payload) => msg_inner.handle_connected(payload),
                    ServerMessage::Joined(_) => {
                        msg_inner.state.lock().joined = true;
                        msg_inner.emit(SessionEvent::Joined);
                    }
                    ServerMessage::Permissions(payload) => msg_inner.handle_permissions(payload),
                    ServerMessage::ProducerState(payload) => {
                        msg_inner.route_producer_state(payload)
                    }
                    ServerMessage::ProducerClosed(payload) => {
                        msg_inner.route_producer_closed(payload)
                    }
                    _ => {}
                }
            }
        }));

        let send_inner = Arc::clone(inner);
        let mut send_events = inner.send.events();
        listeners.push(tokio::spawn(async move {
            while let Ok(event) = send_events.recv().await {
                match event {
                    TransportEvent::Ready { .. } => {
                        send_inner.state.lock().producing_ready = true;
                        send_inner.check_ready();
                    }
                    TransportEvent::Failure => send_inner.emit(SessionEvent::Failure {
                        reason: "send transport failed".to_string(),
                    }),
                }
            }
        }));

        let recv_inner = Arc::clone(inner);
        let mut recv_events = inner.recv.events();
        listeners.push(tokio::spawn(async move {
            while let Ok(event) = recv_events.recv().await {
                match event {
                    TransportEvent::Ready { .. } => {
                        recv_inner.state.lock().consuming_ready = true;
                        recv_inner.check_ready();
                    }
                    TransportEvent::Failure => recv_inner.emit(SessionEvent::Failure {
                        reason: "recv transport failed".to_string(),
                    }),
                }
            }
        }));

        let peers_inner = Arc::clone(inner);
        let mut peer_events = inner.peers.events();
        listeners.push(tokio::spawn(async move {
            while let Ok(event) = peer_events.recv().await {
                peers_inner.emit(SessionEvent::PeerStream(event));
            }
        }));

        inner.state.lock().listeners = listeners;
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn peer_id(&self) -> Option<String> {
        self.inner.state.lock().peer_id.clone()
    }

    pub fn room_id(&self) -> Option<String> {
        self.inner.state.lock().room_id.clone()
    }

    pub fn ready(&self) -> bool {
        self.inner.state.lock().ready_emitted
    }

    /// Incoming streams of remote peers
    pub fn peer_streams(&self) -> &PeerStreamsController {
        &self.inner.peers
    }

    /// Join the room; required before media flows
    pub async fn join(&self) -> Result<()> {
        self.inner.conn.request(ClientMessage::Join).await?;
        let first = {
            let mut state = self.inner.state.lock();
            !std::mem::replace(&mut state.joined, true)
        };
        if first {
            self.inner.emit(SessionEvent::Joined);
        }
        Ok(())
    }

    /// Whether this endpoint can produce `kind` at all
    pub fn can_stream(&self, kind: MediaKind) -> bool {
        self.inner.send.can_produce(kind)
    }

    /// Publish (or replace) the outgoing stream under `label`.
    ///
    /// Idempotent per label: a second call swaps the track on the existing
    /// producer instead of creating another one. Calls for the same label
    /// must not race each other.
    pub async fn send_stream(
        &self,
        label: &str,
        track: Arc<dyn MediaTrack>,
    ) -> Result<OutgoingStream> {
        let existing = {
            let state = self.inner.state.lock();
            if state.closed {
                return Err(Error::TransportClosed);
            }
            if !state.producing_ready || state.send_closed {
                if !state.streams.contains_key(label) {
                    return Err(Error::NotReadyForStreaming);
                }
            }
            state.streams.get(label).cloned()
        };
        if let Some(stream) = existing {
            stream.set_media_track(track).await?;
            return Ok(stream);
        }

        let kind = track.kind();
        if !self.inner.send.can_produce(kind) {
            return Err(Error::CannotStreamKind(kind.to_string()));
        }

        let producer = self
            .inner
            .send
            .produce(ProducerOptions::new(track, label))
            .await?;
        let stream = OutgoingStream::new(Arc::clone(&self.inner.conn), producer);
        {
            let mut state = self.inner.state.lock();
            state.producer_labels.insert(stream.id(), label.to_string());
            state.streams.insert(label.to_string(), stream.clone());
        }

        // Drop the handle from the session once the stream dies
        let weak = Arc::downgrade(&self.inner);
        let watch_label = label.to_string();
        let mut stream_events = stream.events();
        tokio::spawn(async move {
            while let Ok(event) = stream_events.recv().await {
                if matches!(event, OutgoingStreamEvent::Closed) {
                    if let Some(inner) = weak.upgrade() {
                        inner.forget_stream(&watch_label);
                    }
                    break;
                }
            }
        });

        info!(label, id = %stream.id(), "outgoing stream published");
        Ok(stream)
    }

    /// The outgoing stream under `label`, if any
    pub fn stream(&self, label: &str) -> Option<OutgoingStream> {
        self.inner.state.lock().streams.get(label).cloned()
    }

    /// Close the session and everything under it; idempotent
    pub fn close(&self) {
        let streams = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            for listener in state.listeners.drain(..) {
                listener.abort();
            }
            state.streams.drain().map(|(_, s)| s).collect::<Vec<_>>()
        };
        for stream in streams {
            stream.close();
        }
        self.inner.peers.close();
        self.inner.send.close();
        self.inner.recv.close();
        self.inner.routers.close();
        self.inner.conn.close();
        self.inner.emit(SessionEvent::Closed);
    }
}

impl Drop for RtcSession {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        for listener in state.listeners.drain(..) {
            listener.abort();
        }
    }
}
