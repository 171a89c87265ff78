//! Test doubles: an in-memory signaling connection and a scriptable media
//! engine. Only compiled for tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::engine::{
    ConnectHandler, ConnectionState, ConsumerOptions, DtlsParameters, EventHandler, IceParameters,
    MediaConsumer, MediaDevice, MediaEngine, MediaKind, MediaProducer, MediaTrack, MediaTransport,
    ProduceHandler, ProduceRequest, ProducerOptions, RtpCapabilities, SctpCapabilities,
    StateHandler, TransportCreateParams, TransportDirection,
};
use crate::error::{Error, Result};
use crate::signaling::{ClientMessage, ConnectionEvent, ServerMessage, SignalConnection};

type Responder = Box<dyn Fn(&ClientMessage) -> Result<serde_json::Value> + Send + Sync>;

/// Scriptable [`SignalConnection`]: records outgoing traffic, answers
/// requests through a responder closure, lets tests push server messages.
pub struct MockSignalConnection {
    connected: AtomicBool,
    requests: Mutex<Vec<ClientMessage>>,
    notifications: Mutex<Vec<ClientMessage>>,
    responder: Mutex<Option<Responder>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ServerMessage>>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl MockSignalConnection {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            connected: AtomicBool::new(true),
            requests: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn respond_with(
        &self,
        responder: impl Fn(&ClientMessage) -> Result<serde_json::Value> + Send + Sync + 'static,
    ) {
        *self.responder.lock() = Some(Box::new(responder));
    }

    /// Push a server message to every subscriber
    pub fn push(&self, message: ServerMessage) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(message.clone()).is_ok());
    }

    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<ClientMessage> {
        self.requests.lock().clone()
    }

    pub fn notifications(&self) -> Vec<ClientMessage> {
        self.notifications.lock().clone()
    }
}

#[async_trait]
impl SignalConnection for MockSignalConnection {
    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request(&self, message: ClientMessage) -> Result<serde_json::Value> {
        self.requests.lock().push(message.clone());
        match &*self.responder.lock() {
            Some(responder) => responder(&message),
            None => Ok(serde_json::Value::Null),
        }
    }

    fn notify(&self, message: ClientMessage) {
        self.notifications.lock().push(message);
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.subscribers.lock().clear();
        let _ = self.events.send(ConnectionEvent::Closed);
    }
}

/// A static track stub
pub struct MockTrack {
    pub id: String,
    pub kind: MediaKind,
}

impl MockTrack {
    pub fn audio(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind: MediaKind::Audio,
        })
    }

    pub fn video(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind: MediaKind::Video,
        })
    }
}

impl MediaTrack for MockTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }
}

pub struct MockProducer {
    pub id: String,
    pub kind: MediaKind,
    pub label: String,
    paused: AtomicBool,
    closed: AtomicBool,
    pub replace_count: AtomicU32,
    pub max_spatial_layer: Mutex<Option<u8>>,
    transport_close: Mutex<Option<EventHandler>>,
}

impl MockProducer {
    pub fn trigger_transport_close(&self) {
        if let Some(handler) = self.transport_close.lock().clone() {
            handler();
        }
    }
}

#[async_trait]
impl MediaProducer for MockProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    async fn replace_track(&self, _track: Arc<dyn MediaTrack>) -> Result<()> {
        self.replace_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_max_spatial_layer(&self, layer: u8) {
        *self.max_spatial_layer.lock() = Some(layer);
    }

    fn set_transport_close_handler(&self, handler: EventHandler) {
        *self.transport_close.lock() = Some(handler);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockConsumer {
    pub id: String,
    pub kind: MediaKind,
    track: Arc<MockTrack>,
    paused: AtomicBool,
    closed: AtomicBool,
    track_ended: Mutex<Option<EventHandler>>,
    transport_close: Mutex<Option<EventHandler>>,
}

impl MockConsumer {
    pub fn trigger_track_ended(&self) {
        if let Some(handler) = self.track_ended.lock().clone() {
            handler();
        }
    }

    pub fn trigger_transport_close(&self) {
        if let Some(handler) = self.transport_close.lock().clone() {
            handler();
        }
    }
}

impl MediaConsumer for MockConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> Arc<dyn MediaTrack> {
        Arc::clone(&self.track) as Arc<dyn MediaTrack>
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn set_track_ended_handler(&self, handler: EventHandler) {
        *self.track_ended.lock() = Some(handler);
    }

    fn set_transport_close_handler(&self, handler: EventHandler) {
        *self.transport_close.lock() = Some(handler);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockTransport {
    pub id: String,
    pub direction: TransportDirection,
    pub router_id: Option<String>,
    closed: AtomicBool,
    pub fail_restart_ice: AtomicBool,
    pub fail_consume: AtomicBool,
    connect_handler: Mutex<Option<ConnectHandler>>,
    produce_handler: Mutex<Option<ProduceHandler>>,
    state_handler: Mutex<Option<StateHandler>>,
    pub restart_calls: Mutex<Vec<IceParameters>>,
    pub producers: Mutex<Vec<Arc<MockProducer>>>,
    pub consumers: Mutex<Vec<Arc<MockConsumer>>>,
}

impl MockTransport {
    /// Deliver a connection-state transition the way an engine would
    pub fn fire_state(&self, state: ConnectionState) {
        if let Some(handler) = self.state_handler.lock().clone() {
            handler(state);
        }
    }

    /// Run the DTLS connect handshake through the registered handler
    pub async fn trigger_connect(&self) -> Result<()> {
        let handler = self
            .connect_handler
            .lock()
            .clone()
            .ok_or_else(|| Error::Engine("no connect handler".to_string()))?;
        handler(DtlsParameters(serde_json::json!({ "role": "client" }))).await
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn direction(&self) -> TransportDirection {
        self.direction
    }

    fn router_id(&self) -> Option<String> {
        self.router_id.clone()
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn set_connect_handler(&self, handler: ConnectHandler) {
        *self.connect_handler.lock() = Some(handler);
    }

    fn set_produce_handler(&self, handler: ProduceHandler) {
        *self.produce_handler.lock() = Some(handler);
    }

    fn set_state_handler(&self, handler: StateHandler) {
        *self.state_handler.lock() = Some(handler);
    }

    async fn produce(&self, options: ProducerOptions) -> Result<Arc<dyn MediaProducer>> {
        let kind = options.track.kind();
        // Clone the handler out first; the guard must not live across the await
        let handler = self.produce_handler.lock().clone();
        let id = match handler {
            Some(handler) => {
                handler(ProduceRequest {
                    kind,
                    rtp_parameters: crate::engine::RtpParameters(serde_json::json!({})),
                    label: options.label.clone(),
                })
                .await?
            }
            None => format!("producer-{}", options.track.id()),
        };
        let producer = Arc::new(MockProducer {
            id,
            kind,
            label: options.label,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            replace_count: AtomicU32::new(0),
            max_spatial_layer: Mutex::new(None),
            transport_close: Mutex::new(None),
        });
        self.producers.lock().push(Arc::clone(&producer));
        Ok(producer)
    }

    async fn consume(&self, options: ConsumerOptions) -> Result<Arc<dyn MediaConsumer>> {
        if self.fail_consume.load(Ordering::SeqCst) {
            return Err(Error::Engine("consume failed".to_string()));
        }
        let consumer = Arc::new(MockConsumer {
            id: options.id.clone(),
            kind: options.kind,
            track: Arc::new(MockTrack {
                id: format!("track-{}", options.id),
                kind: options.kind,
            }),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            track_ended: Mutex::new(None),
            transport_close: Mutex::new(None),
        });
        self.consumers.lock().push(Arc::clone(&consumer));
        Ok(consumer)
    }

    async fn restart_ice(&self, ice_parameters: IceParameters) -> Result<()> {
        self.restart_calls.lock().push(ice_parameters);
        if self.fail_restart_ice.load(Ordering::SeqCst) {
            return Err(Error::Engine("restartIce failed".to_string()));
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockDevice {
    loaded: AtomicBool,
    caps: Mutex<RtpCapabilities>,
    pub can_produce_audio: AtomicBool,
    pub can_produce_video: AtomicBool,
    pub fail_load: AtomicBool,
    pub fail_create_transport: AtomicBool,
    pub transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockDevice {
    pub fn last_transport(&self) -> Option<Arc<MockTransport>> {
        self.transports.lock().last().cloned()
    }
}

#[async_trait]
impl MediaDevice for MockDevice {
    async fn load(&self, router_rtp_capabilities: RtpCapabilities) -> Result<()> {
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(Error::Engine("device load failed".to_string()));
        }
        *self.caps.lock() = router_rtp_capabilities;
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.caps.lock().clone()
    }

    fn sctp_capabilities(&self) -> SctpCapabilities {
        SctpCapabilities(serde_json::json!({ "numStreams": { "OS": 1024, "MIS": 1024 } }))
    }

    fn can_produce(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.can_produce_audio.load(Ordering::SeqCst),
            MediaKind::Video => self.can_produce_video.load(Ordering::SeqCst),
        }
    }

    fn create_transport(&self, params: TransportCreateParams) -> Result<Arc<dyn MediaTransport>> {
        if self.fail_create_transport.load(Ordering::SeqCst) {
            return Err(Error::Engine("transport construction failed".to_string()));
        }
        let transport = Arc::new(MockTransport {
            id: params.id,
            direction: params.direction,
            router_id: params.router_id,
            closed: AtomicBool::new(false),
            fail_restart_ice: AtomicBool::new(false),
            fail_consume: AtomicBool::new(false),
            connect_handler: Mutex::new(None),
            produce_handler: Mutex::new(None),
            state_handler: Mutex::new(None),
            restart_calls: Mutex::new(Vec::new()),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        });
        self.transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

pub struct MockEngine {
    pub devices: Mutex<Vec<Arc<MockDevice>>>,
    /// Seeds `fail_load` on every device created afterwards
    pub fail_device_load: AtomicBool,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(Vec::new()),
            fail_device_load: AtomicBool::new(false),
        })
    }

    pub fn last_device(&self) -> Option<Arc<MockDevice>> {
        self.devices.lock().last().cloned()
    }
}

impl MediaEngine for MockEngine {
    fn create_device(&self) -> Arc<dyn MediaDevice> {
        let device = Arc::new(MockDevice {
            loaded: AtomicBool::new(false),
            caps: Mutex::new(RtpCapabilities::default()),
            can_produce_audio: AtomicBool::new(true),
            can_produce_video: AtomicBool::new(true),
            fail_load: AtomicBool::new(self.fail_device_load.load(Ordering::SeqCst)),
            fail_create_transport: AtomicBool::new(false),
            transports: Mutex::new(Vec::new()),
        });
        self.devices.lock().push(Arc::clone(&device));
        device
    }
}

/// Router capability announcement used across tests
pub fn router_caps() -> RtpCapabilities {
    serde_json::from_value(serde_json::json!({
        "codecs": [
            { "mimeType": "audio/opus", "kind": "audio", "clockRate": 48000, "channels": 2 },
            { "mimeType": "video/VP8", "kind": "video", "clockRate": 90000 }
        ],
        "headerExtensions": [
            { "uri": "urn:ietf:params:rtp-hdrext:sdes:mid" }
        ]
    }))
    .unwrap()
}

/// A remote transport announcement for `id` in direction `dir`
pub fn transport_created(
    id: &str,
    dir: TransportDirection,
    router_id: Option<&str>,
) -> crate::signaling::protocol::TransportCreatedPayload {
    crate::signaling::protocol::TransportCreatedPayload {
        id: id.to_string(),
        dir,
        router_id: router_id.map(str::to_string),
        ice_parameters: IceParameters(serde_json::json!({ "usernameFragment": "u", "password": "p" })),
        ice_candidates: Vec::new(),
        dtls_parameters: DtlsParameters(serde_json::json!({ "role": "auto" })),
        sctp_parameters: None,
    }
}
