//! Single-shot, re-armable heartbeat timer.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::trace;

/// One long-lived thread per channel that fires a callback when the armed
/// deadline passes.
///
/// The timer is single-shot: after firing it stays idle until the channel
/// re-arms it. Re-arming while armed replaces the deadline, which is how
/// received traffic pushes the heartbeat out. The callback runs on the
/// timer thread and only touches the channel state machine and the
/// transmit pipe, never the transport socket.
pub(crate) struct HeartbeatTimer {
    inner: Arc<TimerInner>,
    thread: Option<JoinHandle<()>>,
}

struct TimerInner {
    state: Mutex<TimerState>,
    condvar: Condvar,
}

struct TimerState {
    deadline: Option<Instant>,
    /// Bumped on every arm/cancel so an in-flight wait re-evaluates.
    epoch: u64,
    shutdown: bool,
}

impl HeartbeatTimer {
    pub(crate) fn spawn(name: &str, tick: impl Fn() + Send + Sync + 'static) -> Self {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                deadline: None,
                epoch: 0,
                shutdown: false,
            }),
            condvar: Condvar::new(),
        });
        let worker = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name(format!("{name}-heartbeat"))
            .spawn(move || worker.run(tick))
            .expect("failed to spawn heartbeat timer thread");
        HeartbeatTimer {
            inner,
            thread: Some(thread),
        }
    }

    /// Arm (or re-arm) the timer to fire after `interval`.
    pub(crate) fn arm(&self, interval: std::time::Duration) {
        let mut state = self.inner.lock();
        state.deadline = Some(Instant::now() + interval);
        state.epoch += 1;
        self.inner.condvar.notify_all();
    }

    /// Drop the armed deadline, if any.
    pub(crate) fn cancel(&self) {
        let mut state = self.inner.lock();
        state.deadline = None;
        state.epoch += 1;
        self.inner.condvar.notify_all();
    }
}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock();
            state.shutdown = true;
            self.inner.condvar.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            // the channel may be released from within a timer callback
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl TimerInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, TimerState> {
        self.state.lock().expect("timer state poisoned")
    }

    fn run(&self, tick: impl Fn()) {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return;
            }
            match state.deadline {
                None => {
                    state = self.condvar.wait(state).expect("timer state poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.deadline = None;
                        drop(state);
                        trace!("heartbeat timer fired");
                        tick();
                        state = self.lock();
                    } else {
                        let (guard, _) = self
                            .condvar
                            .wait_timeout(state, deadline - now)
                            .expect("timer state poisoned");
                        state = guard;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn fires_once_after_interval() {
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        let timer = HeartbeatTimer::spawn("test", move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        timer.arm(Duration::from_millis(20));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1, "single-shot");
    }

    #[test]
    fn rearming_replaces_the_deadline() {
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        let timer = HeartbeatTimer::spawn("test", move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        timer.arm(Duration::from_millis(40));
        thread::sleep(Duration::from_millis(20));
        timer.arm(Duration::from_millis(60));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(fired.load(Ordering::SeqCst), 0, "pushed out by re-arm");
        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_prevents_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        let timer = HeartbeatTimer::spawn("test", move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        timer.arm(Duration::from_millis(20));
        timer.cancel();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
