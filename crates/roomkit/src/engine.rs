//! Media engine seam
//!
//! The SDK drives session and transport lifecycle; the actual WebRTC work
//! (SDP, ICE, encoding) belongs to an engine implementing these traits.
//! Controllers own engine objects exclusively and expose them only through
//! their accessors.
//!
//! Parameter blobs that the SDK merely relays between the server and the
//! engine (ICE/DTLS/RTP parameters) are transparent JSON newtypes; only the
//! router capabilities are structured, because the router connector filters
//! them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::config::{IceServer, IceTransportPolicy};
use crate::error::Result;

/// Media kind of a track, producer or consumer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Direction of a transport leg
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDirection::Send => write!(f, "send"),
            TransportDirection::Recv => write!(f, "recv"),
        }
    }
}

/// WebRTC-level connection state of a transport
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// One codec entry in a router's capability announcement
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub mime_type: String,
    pub kind: MediaKind,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub parameters: serde_json::Value,
}

/// One RTP header extension entry in a router's capability announcement
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtension {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<MediaKind>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub parameters: serde_json::Value,
}

/// Router / endpoint RTP capabilities
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtension>,
}

macro_rules! json_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub serde_json::Value);
    };
}

json_newtype!(
    /// ICE parameters (ufrag/pwd), relayed verbatim between server and engine
    IceParameters
);
json_newtype!(
    /// One ICE candidate from the remote transport announcement
    IceCandidate
);
json_newtype!(
    /// DTLS parameters, relayed verbatim
    DtlsParameters
);
json_newtype!(
    /// SCTP parameters of a remote transport
    SctpParameters
);
json_newtype!(
    /// SCTP capabilities of the local endpoint
    SctpCapabilities
);
json_newtype!(
    /// RTP send/receive parameters of a producer or consumer
    RtpParameters
);

/// Everything needed to construct a local transport bound to the remote one
#[derive(Clone, Debug)]
pub struct TransportCreateParams {
    pub id: String,
    pub direction: TransportDirection,
    pub router_id: Option<String>,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
    pub sctp_parameters: Option<SctpParameters>,
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
}

/// Options for creating a producer on a send transport
#[derive(Clone)]
pub struct ProducerOptions {
    pub track: Arc<dyn MediaTrack>,
    pub label: String,
    /// Replace outgoing RTP with silence/black instead of stopping it on pause
    pub zero_rtp_on_pause: bool,
    /// Stop the underlying track when the producer closes
    pub stop_tracks: bool,
    /// Simulcast/SVC encodings, engine-specific
    pub encodings: Option<serde_json::Value>,
}

impl ProducerOptions {
    pub fn new(track: Arc<dyn MediaTrack>, label: impl Into<String>) -> Self {
        Self {
            track,
            label: label.into(),
            zero_rtp_on_pause: true,
            stop_tracks: false,
            encodings: None,
        }
    }
}

/// Options for creating a consumer on a recv transport
#[derive(Clone, Debug)]
pub struct ConsumerOptions {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub label: String,
    pub peer_id: String,
}

/// The transport asks for its DTLS parameters to be delivered to the server;
/// resolving the future completes the connect handshake.
pub type ConnectHandler =
    Arc<dyn Fn(DtlsParameters) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Request issued by a send transport when a producer is being created;
/// the future resolves to the server-assigned producer id.
pub type ProduceHandler =
    Arc<dyn Fn(ProduceRequest) -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Connection-state notifications from a transport
pub type StateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Parameterless lifecycle notification (track ended, transport closed)
pub type EventHandler = Arc<dyn Fn() + Send + Sync>;

/// Produce request payload handed to the [`ProduceHandler`]
#[derive(Clone, Debug)]
pub struct ProduceRequest {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub label: String,
}

/// Factory for per-router devices
pub trait MediaEngine: Send + Sync {
    fn create_device(&self) -> Arc<dyn MediaDevice>;
}

/// Capability-bound device for one router
#[async_trait]
pub trait MediaDevice: Send + Sync {
    /// Load the router's RTP capabilities; must be called once before any
    /// transport is created
    async fn load(&self, router_rtp_capabilities: RtpCapabilities) -> Result<()>;

    fn loaded(&self) -> bool;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    fn sctp_capabilities(&self) -> SctpCapabilities;

    fn can_produce(&self, kind: MediaKind) -> bool;

    /// Construct the local transport bound to the remote parameters.
    /// Synchronous: a failure here is a non-retriable local error.
    fn create_transport(&self, params: TransportCreateParams) -> Result<Arc<dyn MediaTransport>>;
}

/// One ICE/DTLS leg carrying producers or consumers
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> String;

    fn direction(&self) -> TransportDirection;

    fn router_id(&self) -> Option<String>;

    fn closed(&self) -> bool;

    fn set_connect_handler(&self, handler: ConnectHandler);

    fn set_produce_handler(&self, handler: ProduceHandler);

    fn set_state_handler(&self, handler: StateHandler);

    async fn produce(&self, options: ProducerOptions) -> Result<Arc<dyn MediaProducer>>;

    async fn consume(&self, options: ConsumerOptions) -> Result<Arc<dyn MediaConsumer>>;

    async fn restart_ice(&self, ice_parameters: IceParameters) -> Result<()>;

    fn close(&self);
}

/// Local outgoing media binding
#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> String;

    fn kind(&self) -> MediaKind;

    fn label(&self) -> String;

    fn paused(&self) -> bool;

    fn closed(&self) -> bool;

    fn pause(&self);

    fn resume(&self);

    async fn replace_track(&self, track: Arc<dyn MediaTrack>) -> Result<()>;

    fn set_max_spatial_layer(&self, layer: u8);

    fn set_transport_close_handler(&self, handler: EventHandler);

    fn close(&self);
}

/// Remote incoming media binding
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> String;

    fn kind(&self) -> MediaKind;

    fn track(&self) -> Arc<dyn MediaTrack>;

    fn paused(&self) -> bool;

    fn closed(&self) -> bool;

    fn pause(&self);

    fn resume(&self);

    fn set_track_ended_handler(&self, handler: EventHandler);

    fn set_transport_close_handler(&self, handler: EventHandler);

    fn close(&self);
}

/// A media track handed to or received from the engine
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> String;

    fn kind(&self) -> MediaKind;
}
