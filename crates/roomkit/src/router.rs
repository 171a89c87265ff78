//! Router capability handling
//!
//! Every `routerCaps` announcement gets its own capability-bound device. The
//! first device that finishes loading marks its router as the primary; all
//! sending and the main receiving leg run on it. Capability filters let the
//! application prune codecs or header extensions before the device sees them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::{
    MediaDevice, MediaEngine, RtpCapabilities, RtpCodecCapability, RtpHeaderExtension,
};
use crate::error::Error;
use crate::signaling::protocol::RouterCapsPayload;
use crate::signaling::{ServerMessage, SignalConnection};

/// Called once per router when its device finished loading; the flag marks
/// the primary router.
pub type DeviceReadyHandler = Arc<dyn Fn(String, Arc<dyn MediaDevice>, bool) + Send + Sync>;

/// Called when a router's device failed to load its capabilities
pub type DeviceFailedHandler = Arc<dyn Fn(Error) + Send + Sync>;

/// Predicates applied to announced router capabilities before loading
#[derive(Clone, Default)]
pub struct CapsFilters {
    pub codec: Option<Arc<dyn Fn(&RtpCodecCapability) -> bool + Send + Sync>>,
    pub header_extension: Option<Arc<dyn Fn(&RtpHeaderExtension) -> bool + Send + Sync>>,
}

impl CapsFilters {
    fn apply(&self, mut caps: RtpCapabilities) -> RtpCapabilities {
        if let Some(codec) = &self.codec {
            caps.codecs.retain(|c| codec(c));
        }
        if let Some(extension) = &self.header_extension {
            caps.header_extensions.retain(|e| extension(e));
        }
        caps
    }
}

struct RouterState {
    /// Routers seen, including ones still loading
    known: HashSet<String>,
    devices: HashMap<String, Arc<dyn MediaDevice>>,
    primary: Option<String>,
    listener: Option<JoinHandle<()>>,
    closed: bool,
}

struct Inner {
    engine: Arc<dyn MediaEngine>,
    filters: CapsFilters,
    on_device_ready: DeviceReadyHandler,
    on_device_failed: DeviceFailedHandler,
    state: Mutex<RouterState>,
}

impl Inner {
    async fn handle_router_caps(self: Arc<Self>, payload: RouterCapsPayload) {
        let router_id = payload.router_id;
        {
            let mut state = self.state.lock();
            if state.closed || !state.known.insert(router_id.clone()) {
                return;
            }
        }

        let caps = self.filters.apply(payload.rtp_capabilities);
        let device = self.engine.create_device();
        if let Err(e) = device.load(caps).await {
            warn!(%router_id, error = %e, "router device failed to load");
            // Forget the router so a later announcement can try again
            self.state.lock().known.remove(&router_id);
            (self.on_device_failed)(Error::DeviceInitFailed {
                router_id,
                reason: e.to_string(),
            });
            return;
        }

        let is_primary = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.devices.insert(router_id.clone(), Arc::clone(&device));
            if state.primary.is_none() {
                state.primary = Some(router_id.clone());
                true
            } else {
                false
            }
        };
        info!(%router_id, is_primary, "router device ready");
        (self.on_device_ready)(router_id, device, is_primary);
    }
}

/// Devices for every announced router
pub struct RouterConnector {
    inner: Arc<Inner>,
}

impl RouterConnector {
    pub fn new(
        conn: Arc<dyn SignalConnection>,
        engine: Arc<dyn MediaEngine>,
        filters: CapsFilters,
        on_device_ready: DeviceReadyHandler,
        on_device_failed: DeviceFailedHandler,
    ) -> Self {
        let inner = Arc::new(Inner {
            engine,
            filters,
            on_device_ready,
            on_device_failed,
            state: Mutex::new(RouterState {
                known: HashSet::new(),
                devices: HashMap::new(),
                primary: None,
                listener: None,
                closed: false,
            }),
        });

        let loop_inner = Arc::clone(&inner);
        let mut messages = conn.subscribe();
        let listener = tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                if let ServerMessage::RouterCaps(payload) = message {
                    let inner = Arc::clone(&loop_inner);
                    tokio::spawn(inner.handle_router_caps(payload));
                }
            }
        });
        inner.state.lock().listener = Some(listener);

        Self { inner }
    }

    pub fn device(&self, router_id: &str) -> Option<Arc<dyn MediaDevice>> {
        self.inner.state.lock().devices.get(router_id).cloned()
    }

    pub fn primary_device(&self) -> Option<Arc<dyn MediaDevice>> {
        let state = self.inner.state.lock();
        state
            .primary
            .as_ref()
            .and_then(|id| state.devices.get(id).cloned())
    }

    pub fn primary_router_id(&self) -> Option<String> {
        self.inner.state.lock().primary.clone()
    }

    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        if let Some(listener) = state.listener.take() {
            listener.abort();
        }
    }
}

impl Drop for RouterConnector {
    fn drop(&mut self) {
        self.close();
    }
}
