//! Sending-side connector
//!
//! A [`TransportConnector`] for the send direction plus the produce plumbing:
//! every transport it builds gets a produce handler that registers the
//! producer with the server and hands back the server-assigned id.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{IceServer, IceTransportPolicy, TransportPolicy};
use crate::engine::{
    MediaDevice, MediaKind, MediaProducer, MediaTransport, ProducerOptions, TransportDirection,
};
use crate::error::{Error, Result};
use crate::signaling::protocol::{ProduceAck, ProducePayload};
use crate::signaling::{ClientMessage, ServerMessage, SignalConnection};
use crate::transport::connector::{TransportConnector, TransportEvent};

/// Send transport bound to the primary router
pub struct SendTransportConnector {
    connector: Arc<TransportConnector>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SendTransportConnector {
    pub fn new(
        conn: Arc<dyn SignalConnection>,
        policy: TransportPolicy,
        ice_servers: Vec<IceServer>,
        ice_transport_policy: IceTransportPolicy,
    ) -> Self {
        let connector = Arc::new(TransportConnector::new(
            Arc::clone(&conn),
            TransportDirection::Send,
            policy,
            ice_servers,
            ice_transport_policy,
        ));

        let hook_conn = Arc::clone(&conn);
        connector.set_transport_hook(Arc::new(move |transport: &Arc<dyn MediaTransport>| {
            bind_produce_handler(&hook_conn, transport);
        }));

        let loop_connector = Arc::clone(&connector);
        let mut messages = conn.subscribe();
        let listener = tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                if let ServerMessage::TransportCreated(payload) = message {
                    if payload.dir == TransportDirection::Send {
                        loop_connector.handle_transport_created(payload);
                    }
                }
            }
        });

        Self {
            connector,
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Bind the primary router's device; later routers are ignored, sending
    /// always goes through the primary
    pub fn add_router(&self, router_id: String, device: Arc<dyn MediaDevice>) {
        self.connector.device_ready(Some(router_id), device);
    }

    /// Begin transport creation (the send side never starts eagerly)
    pub fn start(&self) {
        self.connector.start();
    }

    pub fn can_produce(&self, kind: MediaKind) -> bool {
        self.connector
            .device()
            .is_some_and(|device| device.loaded() && device.can_produce(kind))
    }

    /// Create a producer on the send transport, waiting for the transport if
    /// creation is still in flight
    pub async fn produce(&self, options: ProducerOptions) -> Result<Arc<dyn MediaProducer>> {
        if !self
            .connector
            .device()
            .is_some_and(|device| device.loaded())
        {
            return Err(Error::DeviceNotReady);
        }
        let transport = self.connector.transport(None).await?;
        transport.produce(options).await
    }

    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.connector.events()
    }

    pub fn current_transport(&self) -> Option<Arc<dyn MediaTransport>> {
        self.connector.current_transport()
    }

    pub fn close(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.connector.close();
    }
}

impl Drop for SendTransportConnector {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }
}

fn bind_produce_handler(conn: &Arc<dyn SignalConnection>, transport: &Arc<dyn MediaTransport>) {
    let conn = Arc::clone(conn);
    let transport_id = transport.id();
    transport.set_produce_handler(Arc::new(move |request| {
        let conn = Arc::clone(&conn);
        let transport_id = transport_id.clone();
        Box::pin(async move {
            let ack = conn
                .request(ClientMessage::Produce(ProducePayload {
                    transport_id,
                    kind: request.kind,
                    rtp_parameters: request.rtp_parameters,
                    label: request.label,
                }))
                .await?;
            let ack: ProduceAck = serde_json::from_value(ack)?;
            Ok(ack.id)
        })
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MediaEngine;
    use crate::testing::{router_caps, transport_created, MockEngine, MockSignalConnection, MockTrack};

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    async fn started_sender(
        conn: &Arc<MockSignalConnection>,
    ) -> (SendTransportConnector, Arc<MockEngine>) {
        let engine = MockEngine::new();
        let device = engine.create_device();
        device.load(router_caps()).await.unwrap();
        let sender = SendTransportConnector::new(
            Arc::clone(conn) as Arc<dyn SignalConnection>,
            TransportPolicy::send(),
            Vec::new(),
            IceTransportPolicy::All,
        );
        sender.add_router("r1".to_string(), device);
        (sender, engine)
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_create_until_started() {
        let conn = MockSignalConnection::new();
        let (sender, _) = started_sender(&conn).await;
        settle().await;
        assert!(conn.requests().is_empty());

        sender.start();
        settle().await;
        assert!(matches!(
            conn.requests().first(),
            Some(ClientMessage::TransportCreate(p)) if p.dir == TransportDirection::Send
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_produce_registers_with_server() {
        let conn = MockSignalConnection::new();
        conn.respond_with(|message| match message {
            ClientMessage::Produce(_) => Ok(serde_json::json!({ "id": "prod-42" })),
            _ => Ok(serde_json::Value::Null),
        });
        let (sender, _) = started_sender(&conn).await;
        sender.start();
        settle().await;

        conn.push(ServerMessage::TransportCreated(transport_created(
            "st1",
            TransportDirection::Send,
            Some("r1"),
        )));
        settle().await;

        let producer = sender
            .produce(ProducerOptions::new(MockTrack::audio("mic"), "camera-audio"))
            .await
            .unwrap();
        assert_eq!(producer.id(), "prod-42");
        assert!(conn
            .requests()
            .iter()
            .any(|m| matches!(m, ClientMessage::Produce(p) if p.transport_id == "st1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_produce_requires_loaded_device() {
        let conn = MockSignalConnection::new();
        let sender = SendTransportConnector::new(
            Arc::clone(&conn) as Arc<dyn SignalConnection>,
            TransportPolicy::send(),
            Vec::new(),
            IceTransportPolicy::All,
        );

        // No router was ever bound
        let err = sender
            .produce(ProducerOptions::new(MockTrack::audio("mic"), "mic"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::DeviceNotReady));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_announcements_are_ignored() {
        let conn = MockSignalConnection::new();
        let (sender, _) = started_sender(&conn).await;
        sender.start();
        settle().await;

        conn.push(ServerMessage::TransportCreated(transport_created(
            "rt1",
            TransportDirection::Recv,
            Some("r1"),
        )));
        settle().await;
        assert!(sender.current_transport().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_can_produce_follows_device() {
        let conn = MockSignalConnection::new();
        let (sender, engine) = started_sender(&conn).await;
        assert!(sender.can_produce(MediaKind::Audio));

        engine.last_device().unwrap().can_produce_video.store(
            false,
            std::sync::atomic::Ordering::SeqCst,
        );
        assert!(!sender.can_produce(MediaKind::Video));
    }
}
