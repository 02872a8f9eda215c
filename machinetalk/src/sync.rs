//! Small helpers shared by the blocking `wait_*` methods.

use std::sync::{Condvar, MutexGuard};
use std::time::{Duration, Instant};

/// Wait on `condvar` until it is notified or `deadline` passes.
///
/// Returns the re-acquired guard and whether the deadline was reached.
/// Callers re-check their predicate in a loop (and once more after the
/// deadline), so spurious wakeups and wakeup/timeout races are harmless.
pub(crate) fn wait_until<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    deadline: Option<Instant>,
) -> (MutexGuard<'a, T>, bool) {
    match deadline {
        None => (condvar.wait(guard).expect("lock poisoned"), false),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return (guard, true);
            }
            let (guard, result) = condvar
                .wait_timeout(guard, deadline - now)
                .expect("lock poisoned");
            (guard, result.timed_out())
        }
    }
}

/// Translate an optional timeout into an absolute deadline.
pub(crate) fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|timeout| Instant::now() + timeout)
}
