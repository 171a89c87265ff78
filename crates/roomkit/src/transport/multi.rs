//! Receiving-side connector spanning multiple routers
//!
//! The first announced router is the primary: its transport is driven by the
//! full restart state machine of [`TransportConnector`]. Transports for other
//! routers are created on announcement and get their own ICE restart control,
//! but their failures never escalate past a log line; losing a secondary leg
//! only degrades the streams pinned to it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{IceServer, IceTransportPolicy, TransportPolicy};
use crate::engine::{MediaDevice, MediaTransport, TransportCreateParams, TransportDirection};
use crate::error::{error_codes, Result};
use crate::signaling::protocol::{TransportClosePayload, TransportCreatedPayload};
use crate::signaling::{ClientMessage, ServerMessage, SignalConnection};
use crate::transport::connector::{
    bind_connect_handler, restart_transport_ice, TransportConnector, TransportEvent,
};
use crate::transport::ice_restart::IceRestartControl;

struct Secondary {
    transport: Arc<dyn MediaTransport>,
    ice: IceRestartControl,
}

struct MultiState {
    devices: HashMap<String, Arc<dyn MediaDevice>>,
    primary_router: Option<String>,
    /// Secondary transports keyed by transport id
    secondaries: HashMap<String, Secondary>,
    listener: Option<JoinHandle<()>>,
    closed: bool,
}

struct Inner {
    conn: Arc<dyn SignalConnection>,
    policy: TransportPolicy,
    ice_servers: Vec<IceServer>,
    ice_transport_policy: IceTransportPolicy,
    primary: TransportConnector,
    state: Mutex<MultiState>,
}

impl Inner {
    fn is_primary_announcement(&self, router_id: &Option<String>) -> bool {
        let state = self.state.lock();
        match (router_id, &state.primary_router) {
            (None, _) => true,
            (Some(announced), Some(primary)) => announced == primary,
            (Some(_), None) => true,
        }
    }

    fn handle_secondary_created(self: &Arc<Self>, payload: TransportCreatedPayload) {
        let mut state = self.state.lock();
        if state.closed || state.secondaries.contains_key(&payload.id) {
            return;
        }
        let Some(router_id) = payload.router_id.clone() else { return };
        let Some(device) = state.devices.get(&router_id).cloned() else {
            warn!(%router_id, "transport announced for an unknown router");
            return;
        };

        let params = TransportCreateParams {
            id: payload.id.clone(),
            direction: payload.dir,
            router_id: Some(router_id.clone()),
            ice_parameters: payload.ice_parameters,
            ice_candidates: payload.ice_candidates,
            dtls_parameters: payload.dtls_parameters,
            sctp_parameters: payload.sctp_parameters,
            ice_servers: self.ice_servers.clone(),
            ice_transport_policy: self.ice_transport_policy,
        };
        let transport = match device.create_transport(params) {
            Ok(transport) => transport,
            Err(e) => {
                warn!(id = %payload.id, error = %e, "secondary transport construction failed");
                drop(state);
                self.conn
                    .notify(ClientMessage::TransportClose(TransportClosePayload {
                        id: payload.id,
                        router_id: Some(router_id),
                    }));
                return;
            }
        };

        bind_connect_handler(&self.conn, &transport);

        let restart_weak = Arc::downgrade(self);
        let restart_id = payload.id.clone();
        let failed_id = payload.id.clone();
        let ice = IceRestartControl::new(
            self.policy.restart_delay(),
            self.policy.stable_timeout(),
            self.policy.ice_restart_max,
            Arc::new(move || {
                if let Some(inner) = restart_weak.upgrade() {
                    inner.spawn_secondary_ice_restart(restart_id.clone());
                }
            }),
            // Secondary legs never escalate; the streams on them just stall
            Arc::new(move || {
                warn!(id = %failed_id, "secondary transport gave up on ICE recovery");
            }),
        );

        let state_weak = Arc::downgrade(self);
        let state_id = payload.id.clone();
        transport.set_state_handler(Arc::new(move |connection_state| {
            let Some(inner) = state_weak.upgrade() else { return };
            if connection_state == crate::engine::ConnectionState::Closed {
                if let Some(secondary) = inner.state.lock().secondaries.remove(&state_id) {
                    secondary.ice.close();
                }
                return;
            }
            let state = inner.state.lock();
            if let Some(secondary) = state.secondaries.get(&state_id) {
                secondary.ice.connection_state_change(connection_state);
            }
        }));

        info!(id = %payload.id, %router_id, "secondary transport ready");
        state.secondaries.insert(
            payload.id,
            Secondary {
                transport,
                ice,
            },
        );
    }

    fn spawn_secondary_ice_restart(self: &Arc<Self>, transport_id: String) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let transport = inner
                .state
                .lock()
                .secondaries
                .get(&transport_id)
                .map(|s| Arc::clone(&s.transport));
            let Some(transport) = transport else { return };
            if let Err(e) = restart_transport_ice(&inner.conn, &transport).await {
                warn!(id = %transport_id, error = %e, "secondary ICE restart failed");
                let state = inner.state.lock();
                let Some(secondary) = state.secondaries.get(&transport_id) else { return };
                if e.server_code() == Some(error_codes::TRANSPORT_NOT_FOUND) {
                    secondary.ice.reset();
                } else {
                    secondary.ice.ice_restart_failed();
                }
            }
        });
    }
}

/// Recv transports across all announced routers
pub struct MultiTransportConnector {
    inner: Arc<Inner>,
}

impl MultiTransportConnector {
    pub fn new(
        conn: Arc<dyn SignalConnection>,
        policy: TransportPolicy,
        ice_servers: Vec<IceServer>,
        ice_transport_policy: IceTransportPolicy,
    ) -> Self {
        let primary = TransportConnector::new(
            Arc::clone(&conn),
            TransportDirection::Recv,
            policy.clone(),
            ice_servers.clone(),
            ice_transport_policy,
        );
        let inner = Arc::new(Inner {
            conn,
            policy,
            ice_servers,
            ice_transport_policy,
            primary,
            state: Mutex::new(MultiState {
                devices: HashMap::new(),
                primary_router: None,
                secondaries: HashMap::new(),
                listener: None,
                closed: false,
            }),
        });

        let loop_inner = Arc::clone(&inner);
        let mut messages = inner.conn.subscribe();
        let listener = tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                if let ServerMessage::TransportCreated(payload) = message {
                    if payload.dir != TransportDirection::Recv {
                        continue;
                    }
                    if loop_inner.is_primary_announcement(&payload.router_id) {
                        loop_inner.primary.handle_transport_created(payload);
                    } else {
                        loop_inner.handle_secondary_created(payload);
                    }
                }
            }
        });
        inner.state.lock().listener = Some(listener);

        Self { inner }
    }

    /// Register a router device. The first one becomes the primary and drives
    /// the restart state machine.
    pub fn add_router(&self, router_id: String, device: Arc<dyn MediaDevice>) {
        let is_primary = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.devices.insert(router_id.clone(), Arc::clone(&device));
            if state.primary_router.is_none() {
                state.primary_router = Some(router_id.clone());
                true
            } else {
                false
            }
        };
        if is_primary {
            debug!(%router_id, "primary router elected");
            self.inner.primary.device_ready(Some(router_id), device);
        }
    }

    /// Resolve a transport. Without an id this is the primary (waiting for it
    /// if creation is in flight); with an id, secondaries are looked up first.
    pub async fn transport(&self, id: Option<&str>) -> Result<Arc<dyn MediaTransport>> {
        if let Some(id) = id {
            let secondary = self
                .inner
                .state
                .lock()
                .secondaries
                .get(id)
                .map(|s| Arc::clone(&s.transport));
            if let Some(transport) = secondary {
                return Ok(transport);
            }
        }
        self.inner.primary.transport(id).await
    }

    pub fn start(&self) {
        self.inner.primary.start();
    }

    /// Events of the primary leg; secondary failures are not surfaced here
    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.primary.events()
    }

    pub fn primary_device(&self) -> Option<Arc<dyn MediaDevice>> {
        self.inner.primary.device()
    }

    pub fn close(&self) {
        let secondaries = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            if let Some(listener) = state.listener.take() {
                listener.abort();
            }
            state.secondaries.drain().collect::<Vec<_>>()
        };
        for (id, secondary) in secondaries {
            secondary.ice.close();
            self.inner
                .conn
                .notify(ClientMessage::TransportClose(TransportClosePayload {
                    id,
                    router_id: secondary.transport.router_id(),
                }));
            secondary.transport.close();
        }
        self.inner.primary.close();
    }
}

impl Drop for MultiTransportConnector {
    fn drop(&mut self) {
        if let Some(listener) = self.inner.state.lock().listener.take() {
            listener.abort();
        }
    }
}
