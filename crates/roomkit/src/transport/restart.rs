//! Transport lifecycle and restart state machine
//!
//! One control per transport connector. It decides when the connector should
//! (re)create its transport, delegates ICE-level recovery to
//! [`IceRestartControl`], and enforces the restart budget: a smaller one while
//! first connecting, a larger one once the transport has been running.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TransportPolicy;
use crate::engine::ConnectionState;
use crate::error::{error_codes, Error};
use crate::retry::restart_delay;
use crate::signaling::{ConnectionEvent, ServerMessage, SignalConnection};
use crate::transport::ice_restart::{ControlHandler, IceRestartControl};

/// Lifecycle of a transport connector
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartState {
    /// Nothing happened yet
    Initial,
    /// start() arrived before the router device was ready
    InitWait,
    /// Device ready, waiting for start()
    Initialized,
    /// Transport creation dispatched, remote answer pending
    Starting,
    /// Transport up
    Running,
    /// Creation or recovery failed; a restart may still be scheduled
    Failed,
    /// Closed for good
    Closed,
}

struct Ctl {
    state: RestartState,
    restart_counter: u32,
    restart_budget: u32,
    failure_emitted: bool,
    restart_timer: Option<JoinHandle<()>>,
    listeners: Vec<JoinHandle<()>>,
}

struct Inner {
    policy: TransportPolicy,
    conn: Arc<dyn SignalConnection>,
    ctl: Mutex<Ctl>,
    ice: IceRestartControl,
    on_start: ControlHandler,
    on_ice_restart: ControlHandler,
    on_failure: ControlHandler,
}

impl Inner {
    fn do_start(&self) {
        {
            let mut ctl = self.ctl.lock();
            if ctl.state == RestartState::Closed {
                return;
            }
            ctl.state = RestartState::Starting;
        }
        (self.on_start)();
    }

    /// Re-run transport creation, spending one unit of the restart budget
    fn restart(self: &Arc<Self>) {
        {
            let mut ctl = self.ctl.lock();
            if !matches!(ctl.state, RestartState::Running | RestartState::Failed) {
                return;
            }
            ctl.restart_counter += 1;
            ctl.state = RestartState::Initialized;
            info!(counter = ctl.restart_counter, "restarting transport");
        }
        self.do_start();
    }

    /// Enter Failed; schedule a restart if the budget and policy allow,
    /// otherwise escalate (once).
    fn fail(self: &Arc<Self>) {
        let escalate = {
            let mut ctl = self.ctl.lock();
            if ctl.state == RestartState::Closed {
                return;
            }
            ctl.state = RestartState::Failed;
            if ctl.restart_counter >= ctl.restart_budget {
                if ctl.failure_emitted {
                    return;
                }
                ctl.failure_emitted = true;
                true
            } else {
                false
            }
        };
        if escalate {
            warn!("transport restart budget exhausted");
            (self.on_failure)();
        } else if self.policy.restart_on_fail && self.conn.connected() {
            self.schedule_restart();
        }
    }

    fn schedule_restart(self: &Arc<Self>) {
        self.ice.reset();
        let mut ctl = self.ctl.lock();
        if ctl.state == RestartState::Closed || ctl.restart_timer.is_some() {
            return;
        }
        debug!(counter = ctl.restart_counter, "scheduling transport restart");
        let inner = Arc::clone(self);
        let delay = restart_delay(self.policy.restart_delay());
        ctl.restart_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.ctl.lock().restart_timer = None;
            if inner.conn.connected() {
                inner.restart();
            }
        }));
    }

    /// The signaling channel came back while the transport was down
    fn socket_connected(self: &Arc<Self>) {
        let failed = self.ctl.lock().state == RestartState::Failed;
        if failed && self.policy.restart_on_fail {
            self.restart();
        }
    }

    fn close_internal(&self) {
        let mut ctl = self.ctl.lock();
        if ctl.state == RestartState::Closed {
            return;
        }
        ctl.state = RestartState::Closed;
        if let Some(timer) = ctl.restart_timer.take() {
            timer.abort();
        }
        for listener in ctl.listeners.drain(..) {
            listener.abort();
        }
        drop(ctl);
        self.ice.close();
    }
}

/// Restart state machine for one transport connector
pub struct TransportRestartControl {
    inner: Arc<Inner>,
}

impl TransportRestartControl {
    /// `on_start`: create (or recreate) the transport now.
    /// `on_ice_restart`: run an ICE restart on the live transport.
    /// `on_failure`: recovery is over, surface the failure.
    pub fn new(
        conn: Arc<dyn SignalConnection>,
        policy: TransportPolicy,
        on_start: ControlHandler,
        on_ice_restart: ControlHandler,
        on_failure: ControlHandler,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let restart_weak = Weak::clone(weak);
            let failed_weak = Weak::clone(weak);
            let ice = IceRestartControl::new(
                policy.restart_delay(),
                policy.stable_timeout(),
                policy.ice_restart_max,
                Arc::new(move || {
                    if let Some(inner) = restart_weak.upgrade() {
                        (inner.on_ice_restart)();
                    }
                }),
                // ICE recovery exhausted: fall back to full transport restarts
                Arc::new(move || {
                    if let Some(inner) = failed_weak.upgrade() {
                        inner.fail();
                    }
                }),
            );
            Inner {
                conn,
                ctl: Mutex::new(Ctl {
                    state: RestartState::Initial,
                    restart_counter: 0,
                    restart_budget: policy.restart_max_initial,
                    failure_emitted: false,
                    restart_timer: None,
                    listeners: Vec::new(),
                }),
                ice,
                policy,
                on_start,
                on_ice_restart,
                on_failure,
            }
        });

        // A server `connected` message means the session was re-established on
        // a possibly different media node: recreate the transport.
        let msg_inner = Arc::clone(&inner);
        let mut messages = inner.conn.subscribe();
        let message_listener = tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                if matches!(message, ServerMessage::Connected(_)) {
                    msg_inner.restart();
                }
            }
        });

        let ev_inner = Arc::clone(&inner);
        let mut events = inner.conn.events();
        let event_listener = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if matches!(event, ConnectionEvent::Connected { .. }) {
                    ev_inner.socket_connected();
                }
            }
        });

        inner
            .ctl
            .lock()
            .listeners
            .extend([message_listener, event_listener]);

        Self { inner }
    }

    /// The router device is loaded; transport creation may begin
    pub fn initialize(&self) {
        let start_now = {
            let mut ctl = self.inner.ctl.lock();
            match ctl.state {
                RestartState::Initial => {
                    ctl.state = RestartState::Initialized;
                    self.inner.policy.eager_start
                }
                RestartState::InitWait => {
                    ctl.state = RestartState::Initialized;
                    true
                }
                _ => false,
            }
        };
        if start_now {
            self.inner.do_start();
        }
    }

    /// Explicit start; queued until [`initialize`](Self::initialize) if the
    /// device is not ready yet
    pub fn start(&self) {
        let start_now = {
            let mut ctl = self.inner.ctl.lock();
            match ctl.state {
                RestartState::Initialized | RestartState::Failed => true,
                RestartState::Initial => {
                    ctl.state = RestartState::InitWait;
                    false
                }
                _ => false,
            }
        };
        if start_now {
            self.inner.do_start();
        }
    }

    /// The transport is up: clear the counter and widen the budget
    pub fn created(&self) {
        let mut ctl = self.inner.ctl.lock();
        if ctl.state == RestartState::Closed {
            return;
        }
        if let Some(timer) = ctl.restart_timer.take() {
            timer.abort();
        }
        ctl.state = RestartState::Running;
        ctl.restart_counter = 0;
        ctl.restart_budget = self.inner.policy.restart_max;
    }

    /// Local transport construction failed; not retriable
    pub fn local_create_failed(&self) {
        let emit = {
            let mut ctl = self.inner.ctl.lock();
            if ctl.state == RestartState::Closed || ctl.failure_emitted {
                return;
            }
            ctl.state = RestartState::Failed;
            ctl.failure_emitted = true;
            true
        };
        if emit {
            (self.inner.on_failure)();
        }
    }

    /// Remote transport creation failed or timed out; retriable within budget
    pub fn remote_create_failed(&self) {
        self.inner.fail();
    }

    /// An ICE restart round trip failed. `TRANSPORT_NOT_FOUND` means a full
    /// transport restart is already in flight server-side, so only the ICE
    /// control is quieted; anything else counts against the ICE budget.
    pub fn ice_restart_failed(&self, error: &Error) {
        if error.server_code() == Some(error_codes::TRANSPORT_NOT_FOUND) {
            self.inner.ice.reset();
        } else {
            self.inner.ice.ice_restart_failed();
        }
    }

    /// Forward a transport connection-state transition. Only acted on while
    /// Running; a closed transport closes the control.
    pub fn connection_state_change(&self, connection_state: ConnectionState) {
        if connection_state == ConnectionState::Closed {
            self.inner.close_internal();
            return;
        }
        let running = self.inner.ctl.lock().state == RestartState::Running;
        if running {
            self.inner.ice.connection_state_change(connection_state);
        }
    }

    /// Back to Initial keeping the control usable; cancels timers
    pub fn reset(&self) {
        let mut ctl = self.inner.ctl.lock();
        if ctl.state == RestartState::Closed {
            return;
        }
        if let Some(timer) = ctl.restart_timer.take() {
            timer.abort();
        }
        drop(ctl);
        self.inner.ice.reset();
    }

    /// Close irreversibly; idempotent
    pub fn close(&self) {
        self.inner.close_internal();
    }

    pub fn state(&self) -> RestartState {
        self.inner.ctl.lock().state
    }

    #[cfg(test)]
    pub(crate) fn restart_counter(&self) -> u32 {
        self.inner.ctl.lock().restart_counter
    }
}

impl Drop for TransportRestartControl {
    fn drop(&mut self) {
        self.inner.close_internal();
    }
}
