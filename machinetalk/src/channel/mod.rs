//! Machinetalk channel state machines.
//!
//! A channel is one ZeroMQ socket plus the state machine that keeps it
//! alive: a DEALER with ping/pong liveness ([`rpc::RpcClient`]), a SUB that
//! only comes up once a full snapshot arrived ([`subscribe::SubscribeChannel`]),
//! a SUB without liveness ([`simple::SimpleSubscribe`]) and a PUB
//! ([`publish::Publisher`]).
//!
//! Each connecting channel owns one worker thread which is the only code
//! that ever touches the transport socket. `send` and `stop` reach the
//! worker through dedicated inproc sockets. All observer callbacks fire on
//! worker or heartbeat-timer threads.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use tracing::error;

pub(crate) mod publish;
pub(crate) mod rpc;
pub(crate) mod simple;
pub(crate) mod subscribe;
pub(crate) mod timer;

use timer::HeartbeatTimer;

/// Observable connection state of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Closed; nothing is running.
    Down,
    /// Socket open, waiting for evidence of a live peer.
    Trying,
    /// Peer is alive (for subscribe channels: a full update arrived).
    Up,
}

/// How many heartbeat ticks without traffic count as a dead peer.
pub(crate) const RESET_LIVENESS: u32 = 5;

/// Heartbeat interval used until a server advertises its own.
pub(crate) const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2500);

/// Bound on a worker's poll so shutdown is observed even if the wakeup
/// pipe is missed.
pub(crate) const POLL_INTERVAL_MS: i64 = 100;

/// A mutex-protected list of subscribers, dispatched in registration
/// order.
///
/// Callbacks run on channel worker and timer threads and are treated as
/// untrusted: a panicking observer is caught and logged without tearing
/// down the thread that invoked it.
pub(crate) struct ObserverSet<T: ?Sized> {
    observers: Mutex<Vec<Box<dyn Fn(&T) + Send + Sync>>>,
}

impl<T: ?Sized> ObserverSet<T> {
    pub(crate) fn new() -> Self {
        ObserverSet {
            observers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self, observer: impl Fn(&T) + Send + Sync + 'static) {
        self.observers
            .lock()
            .expect("observer table poisoned")
            .push(Box::new(observer));
    }

    pub(crate) fn notify(&self, value: &T) {
        let observers = self.observers.lock().expect("observer table poisoned");
        for observer in observers.iter() {
            if catch_unwind(AssertUnwindSafe(|| observer(value))).is_err() {
                error!("observer callback panicked; continuing");
            }
        }
    }
}

/// Liveness bookkeeping shared by the RPC and subscribe channels.
///
/// The timer itself is single-shot: every expiry and every sent or
/// received frame re-arms it through [`Heartbeat::reset_timer`].
pub(crate) struct Heartbeat {
    state: Mutex<HeartbeatState>,
    timer: OnceLock<HeartbeatTimer>,
}

struct HeartbeatState {
    interval: Duration,
    liveness: u32,
    active: bool,
}

impl Heartbeat {
    pub(crate) fn new() -> Self {
        Heartbeat {
            state: Mutex::new(HeartbeatState {
                interval: DEFAULT_HEARTBEAT_INTERVAL,
                liveness: 0,
                active: false,
            }),
            timer: OnceLock::new(),
        }
    }

    pub(crate) fn install_timer(&self, timer: HeartbeatTimer) {
        if self.timer.set(timer).is_err() {
            error!("heartbeat timer installed twice");
        }
    }

    fn timer(&self) -> &HeartbeatTimer {
        self.timer.get().expect("heartbeat timer not installed")
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HeartbeatState> {
        self.state.lock().expect("heartbeat state poisoned")
    }

    /// Adopt a server-advertised keep-alive interval (milliseconds).
    pub(crate) fn set_interval_ms(&self, interval: u32) {
        self.lock().interval = Duration::from_millis(u64::from(interval));
    }

    #[cfg(test)]
    pub(crate) fn set_interval(&self, interval: Duration) {
        self.lock().interval = interval;
    }

    pub(crate) fn reset_liveness(&self) {
        self.lock().liveness = RESET_LIVENESS;
    }

    /// One tick without traffic; returns the remaining liveness.
    pub(crate) fn decrement_liveness(&self) -> u32 {
        let mut state = self.lock();
        state.liveness = state.liveness.saturating_sub(1);
        state.liveness
    }

    /// Re-arm the single-shot timer if the heartbeat is active.
    pub(crate) fn reset_timer(&self) {
        let state = self.lock();
        if !state.active || state.interval.is_zero() {
            return;
        }
        self.timer().arm(state.interval);
    }

    pub(crate) fn start_timer(&self) {
        self.lock().active = true;
        self.reset_timer();
    }

    pub(crate) fn stop_timer(&self) {
        self.lock().active = false;
        self.timer().cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn observers_fire_in_registration_order() {
        let set = ObserverSet::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3 {
            let order = Arc::clone(&order);
            set.subscribe(move |_: &u32| order.lock().unwrap().push(tag));
        }
        set.notify(&0);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn panicking_observer_does_not_stop_dispatch() {
        let set = ObserverSet::new();
        let calls = Arc::new(AtomicUsize::new(0));
        set.subscribe(|_: &u32| panic!("bad observer"));
        {
            let calls = Arc::clone(&calls);
            set.subscribe(move |_: &u32| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        set.notify(&0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
