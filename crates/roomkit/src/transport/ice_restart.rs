//! Per-transport ICE restart control
//!
//! Watches WebRTC connection-state transitions and decides when to trigger an
//! ICE restart: `disconnected` schedules one after a randomized delay,
//! `failed` restarts immediately, `connected` arms a stability timer that
//! clears the retry counter once the connection has held long enough.
//! Failures are bounded; exhausting the budget signals fatal exactly once.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::engine::ConnectionState;
use crate::retry::restart_delay;

/// Callback fired by the control
pub type ControlHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug)]
struct State {
    closed: bool,
    fatal_emitted: bool,
    restart_counter: u32,
    restart_timer: Option<JoinHandle<()>>,
    stable_timer: Option<JoinHandle<()>>,
}

struct Inner {
    base_delay: Duration,
    stable_timeout: Duration,
    max_restarts: u32,
    state: Mutex<State>,
    on_restart: ControlHandler,
    on_failed: ControlHandler,
}

impl Inner {
    fn cancel_restart_timer(&self, state: &mut State) {
        if let Some(timer) = state.restart_timer.take() {
            timer.abort();
        }
    }

    fn cancel_stable_timer(&self, state: &mut State) {
        if let Some(timer) = state.stable_timer.take() {
            timer.abort();
        }
    }

    fn restart_ice(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.restart_counter += 1;
            trace!(counter = state.restart_counter, "triggering ICE restart");
        }
        (self.on_restart)();
    }

    fn schedule_restart(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        self.cancel_stable_timer(&mut state);
        if state.restart_timer.is_some() {
            return;
        }
        debug!(counter = state.restart_counter, "scheduling ICE restart");
        let inner = Arc::clone(self);
        let delay = restart_delay(self.base_delay);
        state.restart_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.state.lock().restart_timer = None;
            inner.restart_ice();
        }));
    }

    fn arm_stable_timer(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.closed || state.stable_timer.is_some() {
            return;
        }
        let inner = Arc::clone(self);
        let timeout = self.stable_timeout;
        state.stable_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut state = inner.state.lock();
            state.stable_timer = None;
            state.restart_counter = 0;
            debug!("connection stable, ICE restart counter cleared");
        }));
    }

    fn on_closed(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cancel_restart_timer(&mut state);
        self.cancel_stable_timer(&mut state);
    }
}

/// ICE restart decision logic for one transport leg
pub struct IceRestartControl {
    inner: Arc<Inner>,
}

impl IceRestartControl {
    pub fn new(
        base_delay: Duration,
        stable_timeout: Duration,
        max_restarts: u32,
        on_restart: ControlHandler,
        on_failed: ControlHandler,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                base_delay,
                stable_timeout,
                max_restarts,
                state: Mutex::new(State {
                    closed: false,
                    fatal_emitted: false,
                    restart_counter: 0,
                    restart_timer: None,
                    stable_timer: None,
                }),
                on_restart,
                on_failed,
            }),
        }
    }

    /// Feed a WebRTC connection-state transition
    pub fn connection_state_change(&self, connection_state: ConnectionState) {
        if self.inner.state.lock().closed {
            return;
        }
        if matches!(
            connection_state,
            ConnectionState::Failed | ConnectionState::Connected | ConnectionState::Closed
        ) {
            let mut state = self.inner.state.lock();
            self.inner.cancel_restart_timer(&mut state);
        }
        match connection_state {
            ConnectionState::Closed => self.inner.on_closed(),
            ConnectionState::Failed => self.inner.restart_ice(),
            ConnectionState::Disconnected => self.inner.schedule_restart(),
            ConnectionState::Connected => self.inner.arm_stable_timer(),
            _ => {}
        }
    }

    /// Report a failed ICE restart attempt; reschedules while the budget
    /// allows, otherwise signals fatal (once).
    pub fn ice_restart_failed(&self) {
        let fatal = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            if state.restart_counter < self.inner.max_restarts {
                false
            } else if state.fatal_emitted {
                return;
            } else {
                state.fatal_emitted = true;
                true
            }
        };
        if fatal {
            (self.inner.on_failed)();
        } else {
            self.inner.schedule_restart();
        }
    }

    /// Cancel all pending timers; the counter is kept
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        self.inner.cancel_restart_timer(&mut state);
        self.inner.cancel_stable_timer(&mut state);
    }

    /// Close the control irreversibly; idempotent
    pub fn close(&self) {
        if self.inner.state.lock().closed {
            return;
        }
        self.inner.on_closed();
    }

    #[cfg(test)]
    pub(crate) fn restart_counter(&self) -> u32 {
        self.inner.state.lock().restart_counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_control(
        base_delay_ms: u64,
        max: u32,
    ) -> (IceRestartControl, Arc<AtomicU32>, Arc<AtomicU32>) {
        let restarts = Arc::new(AtomicU32::new(0));
        let failures = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&restarts);
        let f = Arc::clone(&failures);
        let control = IceRestartControl::new(
            Duration::from_millis(base_delay_ms),
            Duration::from_secs(10),
            max,
            Arc::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (control, restarts, failures)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_restarts_within_delay_window() {
        let (control, restarts, _) = counting_control(2000, 3);
        control.connection_state_change(ConnectionState::Disconnected);
        settle().await;

        // Below the window: nothing yet
        tokio::time::advance(Duration::from_millis(1499)).await;
        settle().await;
        assert_eq!(restarts.load(Ordering::SeqCst), 0);

        // Past the window's upper bound: exactly one restart
        tokio::time::advance(Duration::from_millis(1001)).await;
        settle().await;
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
        assert_eq!(control.restart_counter(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_disconnects_schedule_once() {
        let (control, restarts, _) = counting_control(2000, 3);
        control.connection_state_change(ConnectionState::Disconnected);
        control.connection_state_change(ConnectionState::Disconnected);
        control.connection_state_change(ConnectionState::Disconnected);
        settle().await;

        tokio::time::advance(Duration::from_millis(2500)).await;
        settle().await;
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_restarts_immediately() {
        let (control, restarts, _) = counting_control(2000, 3);
        control.connection_state_change(ConnectionState::Failed);
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_fires_exactly_once() {
        let (control, restarts, failures) = counting_control(1000, 2);

        control.connection_state_change(ConnectionState::Failed); // counter 1
        control.ice_restart_failed(); // 1 < 2 -> reschedule
        settle().await;
        tokio::time::advance(Duration::from_millis(1500)).await;
        settle().await;
        assert_eq!(restarts.load(Ordering::SeqCst), 2); // counter 2

        control.ice_restart_failed(); // 2 >= 2 -> fatal
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        control.ice_restart_failed(); // already fatal, ignored
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_connection_clears_counter() {
        let (control, _, _) = counting_control(1000, 5);

        // Three restarts happened
        control.connection_state_change(ConnectionState::Failed);
        control.connection_state_change(ConnectionState::Failed);
        control.connection_state_change(ConnectionState::Failed);
        assert_eq!(control.restart_counter(), 3);

        // Connected and stays up past the stability window
        control.connection_state_change(ConnectionState::Connected);
        settle().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(control.restart_counter(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_before_stability_keeps_counter() {
        let (control, restarts, _) = counting_control(1000, 5);
        control.connection_state_change(ConnectionState::Failed);
        assert_eq!(control.restart_counter(), 1);

        control.connection_state_change(ConnectionState::Connected);
        settle().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;

        // Dropped before the stability window elapsed
        control.connection_state_change(ConnectionState::Disconnected);
        settle().await;
        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(restarts.load(Ordering::SeqCst), 2);
        assert_eq!(control.restart_counter(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent_and_cancels_timers() {
        let (control, restarts, _) = counting_control(1000, 3);
        control.connection_state_change(ConnectionState::Disconnected);
        control.close();
        control.close();

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(restarts.load(Ordering::SeqCst), 0);

        // Feeding states after close is a no-op
        control.connection_state_change(ConnectionState::Failed);
        assert_eq!(restarts.load(Ordering::SeqCst), 0);
    }
}
