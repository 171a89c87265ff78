//! WebSocket signaling connection

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::signaling::protocol::{ClientMessage, RequestEnvelope, ServerFrame, ServerMessage};
use crate::signaling::{ConnectionEvent, SignalConnection};

type AckSender = oneshot::Sender<Result<serde_json::Value>>;

struct Inner {
    connected: AtomicBool,
    closed: AtomicBool,
    pending: Mutex<HashMap<String, AckSender>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ServerMessage>>>,
    events: broadcast::Sender<ConnectionEvent>,
    outbound: mpsc::UnboundedSender<WsMessage>,
    request_timeout: Duration,
}

impl Inner {
    fn fan_out(&self, message: ServerMessage) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(message.clone()).is_ok());
    }

    fn resolve_ack(&self, id: &str, result: Result<serde_json::Value>) {
        if let Some(tx) = self.pending.lock().remove(id) {
            let _ = tx.send(result);
        } else {
            debug!(id, "ack for unknown or timed-out request");
        }
    }

    fn reject_pending(&self, reason: &str) {
        let pending: Vec<AckSender> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let _ = tx.send(Err(Error::Signaling(reason.to_string())));
        }
    }

    fn shutdown(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.reject_pending(reason);
        self.subscribers.lock().clear();
        let _ = self.events.send(ConnectionEvent::Closed);
    }
}

/// [`SignalConnection`] over a websocket, with request correlation by id
pub struct WsSignalConnection {
    inner: Arc<Inner>,
}

impl WsSignalConnection {
    /// Connect to the signaling endpoint. `token`, when given, is passed as
    /// the `st` query parameter.
    pub async fn connect(
        url: &str,
        token: Option<&str>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let mut url = url::Url::parse(url).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(token) = token {
            url.query_pairs_mut().append_pair("st", token);
        }

        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        info!(url = %url.host_str().unwrap_or_default(), "signaling connected");

        let (mut sink, mut stream) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
        let (events, _) = broadcast::channel(64);

        let inner = Arc::new(Inner {
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            events,
            outbound,
            request_timeout,
        });

        // Writer: forwards queued frames to the socket
        let writer_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let is_close = matches!(frame, WsMessage::Close(_));
                if let Err(e) = sink.send(frame).await {
                    warn!(error = %e, "signaling send failed");
                    writer_inner.shutdown("send failed");
                    return;
                }
                if is_close {
                    let _ = sink.flush().await;
                    return;
                }
            }
        });

        // Reader: resolves acks, fans messages out in arrival order
        let reader_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match ServerFrame::parse(&text) {
                        Ok(ServerFrame::Ack(ack)) => {
                            let result = match ack.error {
                                Some(e) => Err(e.into()),
                                None => Ok(ack.data),
                            };
                            reader_inner.resolve_ack(&ack.ack, result);
                        }
                        Ok(ServerFrame::Message(message)) => reader_inner.fan_out(message),
                        Err(e) => warn!(error = %e, "unparseable signaling frame"),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "signaling read failed");
                        break;
                    }
                }
            }
            reader_inner.shutdown("connection lost");
        });

        let _ = inner.events.send(ConnectionEvent::Connected { recovered: false });

        Ok(Self { inner })
    }

    fn send_frame(&self, frame: WsMessage) -> Result<()> {
        self.inner
            .outbound
            .send(frame)
            .map_err(|_| Error::Signaling("connection closed".to_string()))
    }
}

#[async_trait]
impl SignalConnection for WsSignalConnection {
    fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst) && !self.inner.closed.load(Ordering::SeqCst)
    }

    async fn request(&self, message: ClientMessage) -> Result<serde_json::Value> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Signaling("connection closed".to_string()));
        }
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id.clone(), tx);

        let envelope = RequestEnvelope {
            id: id.clone(),
            message,
        };
        let text = serde_json::to_string(&envelope)?;
        if let Err(e) = self.send_frame(WsMessage::Text(text)) {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Signaling("connection closed".to_string())),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                Err(Error::OperationTimeout("signaling request".to_string()))
            }
        }
    }

    fn notify(&self, message: ClientMessage) {
        match serde_json::to_string(&message) {
            Ok(text) => {
                if let Err(e) = self.send_frame(WsMessage::Text(text)) {
                    warn!(error = %e, "dropping notification");
                }
            }
            Err(e) => warn!(error = %e, "unserializable notification"),
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    fn close(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.send_frame(WsMessage::Close(None));
        self.inner.shutdown("closed by client");
    }
}
