//! Single transport connector
//!
//! Binds one local transport to its server-side counterpart for one
//! direction. Creation is driven by the [`TransportRestartControl`]: the
//! connector dispatches the create request, waits (bounded) for the remote
//! announcement, constructs the local transport through the device and wires
//! its handlers. Callers obtain the transport through [`transport`], which
//! queues them while creation is in flight.
//!
//! [`transport`]: TransportConnector::transport

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{IceServer, IceTransportPolicy, TransportPolicy};
use crate::engine::{
    ConnectionState, MediaDevice, MediaTransport, TransportCreateParams, TransportDirection,
};
use crate::error::{Error, Result};
use crate::signaling::protocol::{
    IceRestartAck, IceRestartPayload, TransportClosePayload, TransportConnectPayload,
    TransportCreatePayload, TransportCreatedPayload,
};
use crate::signaling::{ClientMessage, SignalConnection};
use crate::transport::restart::TransportRestartControl;

/// Notifications from a connector
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// The transport is up and usable
    Ready {
        transport_id: String,
        router_id: Option<String>,
    },
    /// Recovery is exhausted; the leg is given up
    Failure,
}

/// Hook run on every freshly constructed transport, before waiters resolve
pub type TransportHook = Arc<dyn Fn(&Arc<dyn MediaTransport>) + Send + Sync>;

type TransportWaiter = oneshot::Sender<Result<Arc<dyn MediaTransport>>>;

struct ConnState {
    device: Option<Arc<dyn MediaDevice>>,
    router_id: Option<String>,
    transport: Option<Arc<dyn MediaTransport>>,
    waiters: Vec<TransportWaiter>,
    wait_timer: Option<JoinHandle<()>>,
    transport_hook: Option<TransportHook>,
    closed: bool,
}

pub(crate) struct Inner {
    conn: Arc<dyn SignalConnection>,
    direction: TransportDirection,
    policy: TransportPolicy,
    ice_servers: Vec<IceServer>,
    ice_transport_policy: IceTransportPolicy,
    control: TransportRestartControl,
    state: Mutex<ConnState>,
    events: broadcast::Sender<TransportEvent>,
}

impl Inner {
    /// Drop the current local transport without telling the server; used
    /// right before a re-create, where the server side is already gone.
    fn reset_local(&self) {
        let mut state = self.state.lock();
        if let Some(timer) = state.wait_timer.take() {
            timer.abort();
        }
        if let Some(transport) = state.transport.take() {
            transport.close();
        }
    }

    fn spawn_create(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.create().await;
        });
    }

    async fn create(self: Arc<Self>) {
        let sctp_capabilities = {
            let state = self.state.lock();
            if state.closed {
                return;
            }
            match &state.device {
                Some(device) if device.loaded() => Some(device.sctp_capabilities()),
                _ => {
                    warn!(dir = %self.direction, "transport create without a loaded device");
                    return;
                }
            }
        };
        debug!(dir = %self.direction, "requesting transport creation");
        let request = ClientMessage::TransportCreate(TransportCreatePayload {
            dir: self.direction,
            sctp_capabilities,
        });
        match self.conn.request(request).await {
            Ok(_) => self.arm_wait_timer(),
            Err(e) => {
                warn!(dir = %self.direction, error = %e, "transport create rejected");
                self.control.remote_create_failed();
            }
        }
    }

    /// The server accepted the create request; bound wait for the
    /// `transportCreated` announcement.
    fn arm_wait_timer(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.closed || state.transport.is_some() {
            return;
        }
        if let Some(timer) = state.wait_timer.take() {
            timer.abort();
        }
        let inner = Arc::clone(self);
        let timeout = self.policy.remote_wait_timeout();
        state.wait_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            inner.state.lock().wait_timer = None;
            warn!(dir = %inner.direction, "remote transport announcement timed out");
            inner.control.remote_create_failed();
        }));
    }

    fn spawn_restart_ice(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let transport = inner.state.lock().transport.clone();
            let Some(transport) = transport else { return };
            if let Err(e) = restart_transport_ice(&inner.conn, &transport).await {
                warn!(dir = %inner.direction, error = %e, "ICE restart failed");
                inner.control.ice_restart_failed(&e);
            }
        });
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn reject_waiters(state: &mut ConnState, make_error: impl Fn() -> Error) {
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(Err(make_error()));
        }
    }
}

/// Request fresh ICE parameters for `transport` and apply them
pub(crate) async fn restart_transport_ice(
    conn: &Arc<dyn SignalConnection>,
    transport: &Arc<dyn MediaTransport>,
) -> Result<()> {
    let ack = conn
        .request(ClientMessage::IceRestart(IceRestartPayload {
            transport_id: transport.id(),
            router_id: transport.router_id(),
        }))
        .await?;
    let ack: IceRestartAck = serde_json::from_value(ack)?;
    transport
        .restart_ice(ack.ice_parameters)
        .await
        .map_err(|e| Error::IceRestartFailed(e.to_string()))
}

/// One transport leg in one direction
pub struct TransportConnector {
    inner: Arc<Inner>,
}

impl TransportConnector {
    pub fn new(
        conn: Arc<dyn SignalConnection>,
        direction: TransportDirection,
        policy: TransportPolicy,
        ice_servers: Vec<IceServer>,
        ice_transport_policy: IceTransportPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let start_weak = Weak::clone(weak);
            let ice_weak = Weak::clone(weak);
            let failure_weak = Weak::clone(weak);
            let control = TransportRestartControl::new(
                Arc::clone(&conn),
                policy.clone(),
                Arc::new(move || {
                    if let Some(inner) = start_weak.upgrade() {
                        inner.reset_local();
                        inner.spawn_create();
                    }
                }),
                Arc::new(move || {
                    if let Some(inner) = ice_weak.upgrade() {
                        inner.spawn_restart_ice();
                    }
                }),
                Arc::new(move || {
                    if let Some(inner) = failure_weak.upgrade() {
                        inner.emit(TransportEvent::Failure);
                    }
                }),
            );
            Inner {
                conn,
                direction,
                policy,
                ice_servers,
                ice_transport_policy,
                control,
                state: Mutex::new(ConnState {
                    device: None,
                    router_id: None,
                    transport: None,
                    waiters: Vec::new(),
                    wait_timer: None,
                    transport_hook: None,
                    closed: false,
                }),
                events,
            }
        });
        Self { inner }
    }

    /// Install a hook run on every freshly constructed transport, before any
    /// waiter sees it
    pub fn set_transport_hook(&self, hook: TransportHook) {
        self.inner.state.lock().transport_hook = Some(hook);
    }

    /// Bind this connector to its router device. Only the first call takes;
    /// creation begins immediately if the policy starts eagerly.
    pub fn device_ready(&self, router_id: Option<String>, device: Arc<dyn MediaDevice>) {
        {
            let mut state = self.inner.state.lock();
            if state.closed || state.device.is_some() {
                return;
            }
            state.device = Some(device);
            state.router_id = router_id;
        }
        self.inner.control.initialize();
    }

    /// Explicit start (for non-eager policies)
    pub fn start(&self) {
        self.inner.control.start();
    }

    /// Current transport, or wait for the one being created. With an `id`,
    /// a present transport under a different id is a [`Error::WrongTransport`].
    pub async fn transport(&self, id: Option<&str>) -> Result<Arc<dyn MediaTransport>> {
        let rx = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::TransportClosed);
            }
            if let Some(transport) = &state.transport {
                return match id {
                    Some(want) if transport.id() != want => {
                        Err(Error::WrongTransport(want.to_string()))
                    }
                    _ => Ok(Arc::clone(transport)),
                };
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            rx
        };
        match tokio::time::timeout(self.inner.policy.remote_wait_timeout(), rx).await {
            Ok(Ok(Ok(transport))) => match id {
                Some(want) if transport.id() != want => {
                    Err(Error::WrongTransport(want.to_string()))
                }
                _ => Ok(transport),
            },
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::TransportClosed),
            Err(_) => Err(Error::TransportCreateTimeout),
        }
    }

    /// The server announced a transport for this direction
    pub fn handle_transport_created(&self, payload: TransportCreatedPayload) {
        if payload.dir != self.inner.direction {
            return;
        }
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.closed {
            return;
        }
        if let Some(timer) = state.wait_timer.take() {
            timer.abort();
        }
        if let Some(existing) = &state.transport {
            if existing.id() == payload.id {
                return;
            }
            // A different transport replaced ours server-side
            info!(old = %existing.id(), new = %payload.id, "transport superseded");
            existing.close();
            state.transport = None;
        }
        let Some(device) = state.device.clone() else {
            warn!(id = %payload.id, "transport announced before the device was ready");
            return;
        };

        let params = TransportCreateParams {
            id: payload.id.clone(),
            direction: payload.dir,
            router_id: payload.router_id.clone(),
            ice_parameters: payload.ice_parameters,
            ice_candidates: payload.ice_candidates,
            dtls_parameters: payload.dtls_parameters,
            sctp_parameters: payload.sctp_parameters,
            ice_servers: inner.ice_servers.clone(),
            ice_transport_policy: inner.ice_transport_policy,
        };
        let transport = match device.create_transport(params) {
            Ok(transport) => transport,
            Err(e) => {
                warn!(id = %payload.id, error = %e, "local transport construction failed");
                let reason = e.to_string();
                Inner::reject_waiters(&mut state, || {
                    Error::TransportCreateFailed(reason.clone())
                });
                drop(state);
                // The server-side transport is orphaned: release it
                inner.conn.notify(ClientMessage::TransportClose(TransportClosePayload {
                    id: payload.id,
                    router_id: payload.router_id,
                }));
                inner.control.local_create_failed();
                return;
            }
        };

        bind_connect_handler(&inner.conn, &transport);
        bind_state_handler(inner, &transport);
        if let Some(hook) = &state.transport_hook {
            hook(&transport);
        }

        state.transport = Some(Arc::clone(&transport));
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(Ok(Arc::clone(&transport)));
        }
        drop(state);

        inner.control.created();
        info!(id = %transport.id(), dir = %inner.direction, "transport ready");
        inner.emit(TransportEvent::Ready {
            transport_id: transport.id(),
            router_id: transport.router_id(),
        });
    }

    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    pub fn device(&self) -> Option<Arc<dyn MediaDevice>> {
        self.inner.state.lock().device.clone()
    }

    pub fn current_transport(&self) -> Option<Arc<dyn MediaTransport>> {
        self.inner.state.lock().transport.clone()
    }

    /// Close the connector and release the server-side transport
    pub fn close(&self) {
        self.inner.control.close();
        let transport = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            if let Some(timer) = state.wait_timer.take() {
                timer.abort();
            }
            Inner::reject_waiters(&mut state, || Error::TransportClosed);
            state.transport.take()
        };
        if let Some(transport) = transport {
            self.inner
                .conn
                .notify(ClientMessage::TransportClose(TransportClosePayload {
                    id: transport.id(),
                    router_id: transport.router_id(),
                }));
            transport.close();
        }
    }
}

pub(crate) fn bind_connect_handler(
    conn: &Arc<dyn SignalConnection>,
    transport: &Arc<dyn MediaTransport>,
) {
    let conn = Arc::clone(conn);
    let id = transport.id();
    let router_id = transport.router_id();
    transport.set_connect_handler(Arc::new(move |dtls_parameters| {
        let conn = Arc::clone(&conn);
        let id = id.clone();
        let router_id = router_id.clone();
        Box::pin(async move {
            conn.request(ClientMessage::TransportConnect(TransportConnectPayload {
                id,
                dtls_parameters,
                router_id,
            }))
            .await
            .map(|_| ())
        })
    }));
}

fn bind_state_handler(inner: &Arc<Inner>, transport: &Arc<dyn MediaTransport>) {
    let weak = Arc::downgrade(inner);
    let transport_id = transport.id();
    transport.set_state_handler(Arc::new(move |connection_state| {
        let Some(inner) = weak.upgrade() else { return };
        if connection_state == ConnectionState::Closed {
            let mut state = inner.state.lock();
            if state
                .transport
                .as_ref()
                .is_some_and(|t| t.id() == transport_id)
            {
                state.transport = None;
            }
        }
        inner.control.connection_state_change(connection_state);
    }));
}

impl Drop for TransportConnector {
    fn drop(&mut self) {
        self.inner.control.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{transport_created, MockEngine, MockSignalConnection};
    use crate::engine::MediaEngine;
    use std::time::Duration;

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn recv_connector(conn: Arc<MockSignalConnection>) -> TransportConnector {
        TransportConnector::new(
            conn,
            TransportDirection::Recv,
            TransportPolicy::recv(),
            Vec::new(),
            IceTransportPolicy::All,
        )
    }

    async fn ready_connector(
        conn: &Arc<MockSignalConnection>,
    ) -> (TransportConnector, Arc<crate::testing::MockDevice>) {
        let engine = MockEngine::new();
        let device = {
            let d = engine.create_device();
            d.load(crate::testing::router_caps()).await.unwrap();
            engine.last_device().unwrap()
        };
        let connector = recv_connector(Arc::clone(conn));
        connector.device_ready(Some("r1".to_string()), device.clone());
        (connector, device)
    }

    #[tokio::test(start_paused = true)]
    async fn test_creates_transport_on_announcement() {
        let conn = MockSignalConnection::new();
        let (connector, device) = ready_connector(&conn).await;
        settle().await;

        // Eager policy dispatched the create request
        assert!(matches!(
            conn.requests().first(),
            Some(ClientMessage::TransportCreate(p)) if p.dir == TransportDirection::Recv
        ));

        connector.handle_transport_created(transport_created(
            "t1",
            TransportDirection::Recv,
            Some("r1"),
        ));
        let transport = connector.transport(None).await.unwrap();
        assert_eq!(transport.id(), "t1");
        assert!(device.last_transport().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_resolve_when_transport_arrives() {
        let conn = MockSignalConnection::new();
        let (connector, _) = ready_connector(&conn).await;
        let connector = Arc::new(connector);

        let waiting = {
            let connector = Arc::clone(&connector);
            tokio::spawn(async move { connector.transport(None).await })
        };
        settle().await;

        connector.handle_transport_created(transport_created(
            "t1",
            TransportDirection::Recv,
            None,
        ));
        let transport = waiting.await.unwrap().unwrap();
        assert_eq!(transport.id(), "t1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_transport_id() {
        let conn = MockSignalConnection::new();
        let (connector, _) = ready_connector(&conn).await;
        connector.handle_transport_created(transport_created(
            "t1",
            TransportDirection::Recv,
            None,
        ));

        let err = connector.transport(Some("other")).await.err().unwrap();
        assert!(matches!(err, Error::WrongTransport(id) if id == "other"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_announcement_is_ignored() {
        let conn = MockSignalConnection::new();
        let (connector, device) = ready_connector(&conn).await;
        connector.handle_transport_created(transport_created(
            "t1",
            TransportDirection::Recv,
            None,
        ));
        connector.handle_transport_created(transport_created(
            "t1",
            TransportDirection::Recv,
            None,
        ));
        assert_eq!(device.transports.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_id_supersedes_old_transport() {
        let conn = MockSignalConnection::new();
        let (connector, device) = ready_connector(&conn).await;
        connector.handle_transport_created(transport_created(
            "t1",
            TransportDirection::Recv,
            None,
        ));
        let first = device.last_transport().unwrap();

        connector.handle_transport_created(transport_created(
            "t2",
            TransportDirection::Recv,
            None,
        ));
        assert!(first.closed());
        assert_eq!(connector.transport(None).await.unwrap().id(), "t2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_construction_failure_releases_remote() {
        let conn = MockSignalConnection::new();
        let (connector, device) = ready_connector(&conn).await;
        let mut events = connector.events();
        device
            .fail_create_transport
            .store(true, std::sync::atomic::Ordering::SeqCst);

        connector.handle_transport_created(transport_created(
            "t1",
            TransportDirection::Recv,
            None,
        ));
        settle().await;

        // Orphaned server transport is released and the failure is terminal
        assert!(matches!(
            conn.notifications().first(),
            Some(ClientMessage::TransportClose(p)) if p.id == "t1"
        ));
        assert!(matches!(events.try_recv(), Ok(TransportEvent::Failure)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_wait_timeout_triggers_restart() {
        let conn = MockSignalConnection::new();
        let (connector, _) = ready_connector(&conn).await;
        settle().await;
        assert_eq!(conn.requests().len(), 1);

        // No announcement inside the wait window: restart re-creates
        tokio::time::advance(Duration::from_millis(10_000)).await;
        settle().await;
        tokio::time::advance(Duration::from_millis(2500)).await;
        settle().await;
        assert_eq!(conn.requests().len(), 2);
        let _ = &connector;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_handshake_round_trip() {
        let conn = MockSignalConnection::new();
        let (connector, device) = ready_connector(&conn).await;
        connector.handle_transport_created(transport_created(
            "t1",
            TransportDirection::Recv,
            Some("r1"),
        ));

        let transport = device.last_transport().unwrap();
        transport.trigger_connect().await.unwrap();
        assert!(conn
            .requests()
            .iter()
            .any(|m| matches!(m, ClientMessage::TransportConnect(p) if p.id == "t1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connection_runs_ice_restart() {
        let conn = MockSignalConnection::new();
        conn.respond_with(|message| match message {
            ClientMessage::IceRestart(_) => Ok(serde_json::json!({
                "iceParameters": { "usernameFragment": "u2", "password": "p2" }
            })),
            _ => Ok(serde_json::Value::Null),
        });
        let (connector, device) = ready_connector(&conn).await;
        connector.handle_transport_created(transport_created(
            "t1",
            TransportDirection::Recv,
            None,
        ));
        let transport = device.last_transport().unwrap();

        transport.fire_state(ConnectionState::Failed);
        settle().await;
        assert_eq!(transport.restart_calls.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_for_transport_times_out() {
        let conn = MockSignalConnection::new();
        let (connector, _) = ready_connector(&conn).await;
        let connector = Arc::new(connector);

        let waiting = {
            let connector = Arc::clone(&connector);
            tokio::spawn(async move { connector.transport(None).await })
        };
        settle().await;

        // No announcement ever arrives
        tokio::time::advance(Duration::from_millis(10_000)).await;
        settle().await;
        let err = waiting.await.unwrap().err().unwrap();
        assert!(matches!(err, Error::TransportCreateTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_restart_failure_is_wrapped() {
        let conn = MockSignalConnection::new();
        conn.respond_with(|message| match message {
            ClientMessage::IceRestart(_) => Ok(serde_json::json!({
                "iceParameters": { "usernameFragment": "u2", "password": "p2" }
            })),
            _ => Ok(serde_json::Value::Null),
        });
        let (connector, device) = ready_connector(&conn).await;
        connector.handle_transport_created(transport_created(
            "t1",
            TransportDirection::Recv,
            None,
        ));
        let transport = device.last_transport().unwrap();
        transport
            .fail_restart_ice
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let conn_dyn = Arc::clone(&conn) as Arc<dyn SignalConnection>;
        let transport_dyn = connector.current_transport().unwrap();
        let err = restart_transport_ice(&conn_dyn, &transport_dyn)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::IceRestartFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_notifies_server_and_rejects_waiters() {
        let conn = MockSignalConnection::new();
        let (connector, _) = ready_connector(&conn).await;
        connector.handle_transport_created(transport_created(
            "t1",
            TransportDirection::Recv,
            None,
        ));

        connector.close();
        assert!(matches!(
            conn.notifications().last(),
            Some(ClientMessage::TransportClose(p)) if p.id == "t1"
        ));
        let err = connector.transport(None).await.err().unwrap();
        assert!(matches!(err, Error::TransportClosed));
    }
}
