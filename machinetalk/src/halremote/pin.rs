//! Typed pin cells mirrored with the server.

use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::Duration;

use machinetalk_proto::{PinDirection, ValueType};
use tracing::warn;

use crate::channel::ObserverSet;
use crate::halremote::component::ComponentInner;
use crate::sync::{deadline_after, wait_until};

/// Value of a HAL pin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PinValue {
    Bit(bool),
    Float(f64),
    S32(i32),
    U32(u32),
}

impl PinValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            PinValue::Bit(_) => ValueType::HalBit,
            PinValue::Float(_) => ValueType::HalFloat,
            PinValue::S32(_) => ValueType::HalS32,
            PinValue::U32(_) => ValueType::HalU32,
        }
    }

    /// The zero value of a pin type.
    pub(crate) fn zero(value_type: ValueType) -> PinValue {
        match value_type {
            ValueType::HalBit => PinValue::Bit(false),
            ValueType::HalFloat => PinValue::Float(0.0),
            ValueType::HalS32 => PinValue::S32(0),
            ValueType::HalU32 => PinValue::U32(0),
        }
    }
}

impl From<bool> for PinValue {
    fn from(value: bool) -> Self {
        PinValue::Bit(value)
    }
}

impl From<f64> for PinValue {
    fn from(value: f64) -> Self {
        PinValue::Float(value)
    }
}

impl From<i32> for PinValue {
    fn from(value: i32) -> Self {
        PinValue::S32(value)
    }
}

impl From<u32> for PinValue {
    fn from(value: u32) -> Self {
        PinValue::U32(value)
    }
}

/// A named typed cell inside a [`RemoteComponent`](crate::halremote::RemoteComponent).
///
/// `synced` is true exactly while the last observed server value equals
/// the locally stored value and no write has been issued since. Cloning
/// shares the underlying pin.
#[derive(Clone)]
pub struct Pin {
    inner: Arc<PinInner>,
}

struct PinInner {
    name: String,
    value_type: ValueType,
    direction: PinDirection,
    state: Mutex<PinState>,
    value_condvar: Condvar,
    synced_condvar: Condvar,
    value_observers: ObserverSet<PinValue>,
    synced_observers: ObserverSet<bool>,
    parent: OnceLock<Weak<ComponentInner>>,
}

struct PinState {
    value: PinValue,
    synced: bool,
    /// Server-assigned identifier, captured on each bind cycle.
    handle: u32,
    /// Bumped on every value change; lets waiters detect "the next one".
    sequence: u64,
}

impl Pin {
    pub(crate) fn new(name: impl Into<String>, value_type: ValueType, direction: PinDirection) -> Self {
        Pin {
            inner: Arc::new(PinInner {
                name: name.into(),
                value_type,
                direction,
                state: Mutex::new(PinState {
                    value: PinValue::zero(value_type),
                    synced: false,
                    handle: 0,
                    sequence: 0,
                }),
                value_condvar: Condvar::new(),
                synced_condvar: Condvar::new(),
                value_observers: ObserverSet::new(),
                synced_observers: ObserverSet::new(),
                parent: OnceLock::new(),
            }),
        }
    }

    pub(crate) fn attach(&self, parent: Weak<ComponentInner>) {
        if self.inner.parent.set(parent).is_err() {
            warn!(pin = %self.inner.name, "pin attached twice");
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn value_type(&self) -> ValueType {
        self.inner.value_type
    }

    pub fn direction(&self) -> PinDirection {
        self.inner.direction
    }

    pub fn value(&self) -> PinValue {
        self.lock().value
    }

    pub fn synced(&self) -> bool {
        self.lock().synced
    }

    pub fn handle(&self) -> u32 {
        self.lock().handle
    }

    pub fn on_value_changed(&self, observer: impl Fn(&PinValue) + Send + Sync + 'static) {
        self.inner.value_observers.subscribe(observer);
    }

    pub fn on_synced_changed(&self, observer: impl Fn(&bool) + Send + Sync + 'static) {
        self.inner.synced_observers.subscribe(observer);
    }

    /// Write a new value.
    ///
    /// The local value changes immediately and the pin becomes unsynced;
    /// while the component is synced, the change is also sent to the
    /// server. Writes to `in` pins and writes of a mismatched type are
    /// dropped.
    pub fn set(&self, value: impl Into<PinValue>) {
        let value = value.into();
        if value.value_type() != self.inner.value_type {
            warn!(
                pin = %self.inner.name,
                expected = ?self.inner.value_type,
                got = ?value.value_type(),
                "dropped type-mismatched pin write"
            );
            return;
        }
        let synced_changed;
        {
            let mut state = self.lock();
            if state.value == value {
                return;
            }
            state.value = value;
            state.sequence += 1;
            synced_changed = state.synced;
            state.synced = false;
            self.inner.value_condvar.notify_all();
            self.inner.synced_condvar.notify_all();
        }
        self.inner.value_observers.notify(&value);
        if synced_changed {
            self.inner.synced_observers.notify(&false);
        }
        if let Some(parent) = self.inner.parent.get().and_then(Weak::upgrade) {
            parent.pin_change(self);
        }
    }

    /// Block until the pin is in sync with the server.
    pub fn wait_synced(&self, timeout: Option<Duration>) -> bool {
        let deadline = deadline_after(timeout);
        let mut state = self.lock();
        loop {
            if state.synced {
                return true;
            }
            let (guard, deadline_reached) =
                wait_until(&self.inner.synced_condvar, state, deadline);
            state = guard;
            if deadline_reached {
                return state.synced;
            }
        }
    }

    /// Block until the value changes; returns the new value, or `None`
    /// on timeout.
    pub fn wait_value(&self, timeout: Option<Duration>) -> Option<PinValue> {
        let deadline = deadline_after(timeout);
        let mut state = self.lock();
        let sequence = state.sequence;
        loop {
            if state.sequence != sequence {
                return Some(state.value);
            }
            let (guard, deadline_reached) = wait_until(&self.inner.value_condvar, state, deadline);
            state = guard;
            if deadline_reached {
                if state.sequence != sequence {
                    return Some(state.value);
                }
                return None;
            }
        }
    }

    /// Apply a server-observed value; the pin becomes synced.
    pub(crate) fn apply_update(&self, value: PinValue) {
        let value_changed;
        let synced_changed;
        {
            let mut state = self.lock();
            value_changed = state.value != value;
            if value_changed {
                state.value = value;
                state.sequence += 1;
                self.inner.value_condvar.notify_all();
            }
            synced_changed = !state.synced;
            state.synced = true;
            self.inner.synced_condvar.notify_all();
        }
        if value_changed {
            self.inner.value_observers.notify(&value);
        }
        if synced_changed {
            self.inner.synced_observers.notify(&true);
        }
    }

    pub(crate) fn mark_unsynced(&self) {
        let changed = {
            let mut state = self.lock();
            let changed = state.synced;
            state.synced = false;
            self.inner.synced_condvar.notify_all();
            changed
        };
        if changed {
            self.inner.synced_observers.notify(&false);
        }
    }

    pub(crate) fn set_handle(&self, handle: u32) {
        self.lock().handle = handle;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PinState> {
        self.inner.state.lock().expect("pin state poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_update_sets_value_and_synced() {
        let pin = Pin::new("led", ValueType::HalBit, PinDirection::HalIn);
        assert_eq!(pin.value(), PinValue::Bit(false));
        assert!(!pin.synced());

        pin.apply_update(PinValue::Bit(true));
        assert_eq!(pin.value(), PinValue::Bit(true));
        assert!(pin.synced());
    }

    #[test]
    fn local_write_unsyncs_the_pin() {
        let pin = Pin::new("button", ValueType::HalBit, PinDirection::HalOut);
        pin.apply_update(PinValue::Bit(false));
        assert!(pin.synced());

        pin.set(true);
        assert_eq!(pin.value(), PinValue::Bit(true));
        assert!(!pin.synced());
    }

    #[test]
    fn type_mismatched_write_is_dropped() {
        let pin = Pin::new("speed", ValueType::HalFloat, PinDirection::HalOut);
        pin.set(7i32);
        assert_eq!(pin.value(), PinValue::Float(0.0));
    }

    #[test]
    fn wait_value_observes_the_next_change() {
        let pin = Pin::new("led", ValueType::HalBit, PinDirection::HalIn);
        let waiter = pin.clone();
        let handle = std::thread::spawn(move || waiter.wait_value(Some(Duration::from_secs(2))));
        std::thread::sleep(Duration::from_millis(50));
        pin.apply_update(PinValue::Bit(true));
        assert_eq!(handle.join().unwrap(), Some(PinValue::Bit(true)));
    }
}
