//! Remote HAL component endpoint.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use machinetalk_proto::{self as proto, Component, Container, PinDirection, ValueType};
use tracing::{debug, warn};

use crate::base::component::{ComponentEventHandler, RemoteComponentBase};
use crate::base::RemoteComponentState;
use crate::channel::ObserverSet;
use crate::discovery::{Service, ServiceContainer};
use crate::halremote::pin::{Pin, PinValue};
use crate::sync::{deadline_after, wait_until};
use crate::Result;

/// A named bag of [`Pin`]s transparently mirrored with a server-side HAL
/// component.
///
/// Declare the pins, start the component (directly or through service
/// discovery) and the endpoint binds the component, captures the
/// server-assigned pin handles from the first full update and keeps both
/// sides in sync: incoming updates set pin values, local writes to `out`
/// and `io` pins are sent as `SET` messages while connected.
pub struct RemoteComponent {
    inner: Arc<ComponentInner>,
}

pub(crate) struct ComponentInner {
    name: String,
    base: RemoteComponentBase,
    services: ServiceContainer,
    halrcmd_service: Service,
    halrcomp_service: Service,
    pins_by_name: Mutex<BTreeMap<String, Pin>>,
    /// Populated from the handles carried by the first full update of a
    /// bind cycle.
    pins_by_handle: Mutex<HashMap<u32, Pin>>,
    no_create: AtomicBool,
    no_bind: AtomicBool,
    connected: Mutex<bool>,
    connected_condvar: Condvar,
    connected_observers: ObserverSet<bool>,
    timeout_observers: ObserverSet<()>,
}

impl RemoteComponent {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let base = RemoteComponentBase::new(&name)?;

        let halrcmd_service = Service::new("halrcmd");
        let halrcomp_service = Service::new("halrcomp");
        let services = ServiceContainer::new();
        services.add_service(&halrcmd_service);
        services.add_service(&halrcomp_service);

        let inner = Arc::new(ComponentInner {
            name,
            base,
            services: services.clone(),
            halrcmd_service: halrcmd_service.clone(),
            halrcomp_service: halrcomp_service.clone(),
            pins_by_name: Mutex::new(BTreeMap::new()),
            pins_by_handle: Mutex::new(HashMap::new()),
            no_create: AtomicBool::new(false),
            no_bind: AtomicBool::new(false),
            connected: Mutex::new(false),
            connected_condvar: Condvar::new(),
            connected_observers: ObserverSet::new(),
            timeout_observers: ObserverSet::new(),
        });
        let inner_dyn: Arc<dyn ComponentEventHandler> = inner.clone();
        let handler: Weak<dyn ComponentEventHandler> = Arc::downgrade(&inner_dyn);
        inner.base.set_handler(handler);

        let ready_inner = Arc::downgrade(&inner);
        services.on_services_ready_changed(move |ready| {
            if let Some(inner) = ready_inner.upgrade() {
                inner
                    .base
                    .set_halrcmd_uri(&inner.halrcmd_service.uri());
                inner
                    .base
                    .set_halrcomp_uri(&inner.halrcomp_service.uri());
                if *ready {
                    inner.base.start();
                } else {
                    inner.base.stop();
                }
            }
        });

        Ok(RemoteComponent { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn services(&self) -> &ServiceContainer {
        &self.inner.services
    }

    pub fn halrcmd_service(&self) -> &Service {
        &self.inner.halrcmd_service
    }

    pub fn halrcomp_service(&self) -> &Service {
        &self.inner.halrcomp_service
    }

    /// Point the endpoint at fixed URIs instead of discovery.
    pub fn set_halrcmd_uri(&self, uri: &str) {
        self.inner.base.set_halrcmd_uri(uri);
    }

    pub fn set_halrcomp_uri(&self, uri: &str) {
        self.inner.base.set_halrcomp_uri(uri);
    }

    /// Ask the server not to create the component if it does not exist.
    pub fn set_no_create(&self, no_create: bool) {
        self.inner.no_create.store(no_create, Ordering::SeqCst);
    }

    /// Skip the bind handshake entirely and attach to an existing
    /// component.
    pub fn set_no_bind(&self, no_bind: bool) {
        self.inner.no_bind.store(no_bind, Ordering::SeqCst);
    }

    /// Declare a pin. Pins are declared once, before the component is
    /// started; they live as long as the component.
    pub fn create_pin(
        &self,
        name: impl Into<String>,
        value_type: ValueType,
        direction: PinDirection,
    ) -> Pin {
        let name = name.into();
        if self.inner.base.state() != RemoteComponentState::Down {
            warn!(component = %self.inner.name, pin = %name, "pin created on a running component");
        }
        let pin = Pin::new(name.clone(), value_type, direction);
        pin.attach(Arc::downgrade(&self.inner));
        self.inner
            .pins_by_name
            .lock()
            .expect("pins poisoned")
            .insert(name, pin.clone());
        pin
    }

    pub fn pin(&self, name: &str) -> Option<Pin> {
        self.inner
            .pins_by_name
            .lock()
            .expect("pins poisoned")
            .get(name)
            .cloned()
    }

    pub fn pins(&self) -> Vec<Pin> {
        self.inner
            .pins_by_name
            .lock()
            .expect("pins poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Shorthand for `pin(name).map(|p| p.value())`.
    pub fn pin_value(&self, name: &str) -> Option<PinValue> {
        self.pin(name).map(|pin| pin.value())
    }

    /// Shorthand for writing through [`Pin::set`]; returns whether the
    /// pin exists.
    pub fn set_pin(&self, name: &str, value: impl Into<PinValue>) -> bool {
        match self.pin(name) {
            Some(pin) => {
                pin.set(value);
                true
            }
            None => false,
        }
    }

    /// Connect without discovery. Idempotent.
    pub fn start(&self) {
        self.inner.base.start();
    }

    /// Idempotent; also the only way out of the error state.
    pub fn stop(&self) {
        self.inner.base.stop();
    }

    pub fn state(&self) -> RemoteComponentState {
        self.inner.base.state()
    }

    pub fn connected(&self) -> bool {
        *self.inner.connected.lock().expect("connected poisoned")
    }

    pub fn error_string(&self) -> String {
        self.inner.base.error_string()
    }

    pub fn wait_connected(&self, timeout: Option<Duration>) -> bool {
        let deadline = deadline_after(timeout);
        let mut connected = self.inner.connected.lock().expect("connected poisoned");
        loop {
            if *connected {
                return true;
            }
            let (guard, deadline_reached) =
                wait_until(&self.inner.connected_condvar, connected, deadline);
            connected = guard;
            if deadline_reached {
                return *connected;
            }
        }
    }

    pub fn on_connected_changed(&self, observer: impl Fn(&bool) + Send + Sync + 'static) {
        self.inner.connected_observers.subscribe(observer);
    }

    /// Fires when the pin subscription goes stale while synced.
    pub fn on_timeout(&self, observer: impl Fn(&()) + Send + Sync + 'static) {
        self.inner.timeout_observers.subscribe(observer);
    }

    pub fn on_state_changed(
        &self,
        observer: impl Fn(&RemoteComponentState) + Send + Sync + 'static,
    ) {
        self.inner.base.on_state_changed(observer);
    }

    pub fn on_error_string_changed(&self, observer: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.base.on_error_string_changed(observer);
    }
}

impl Drop for RemoteComponent {
    fn drop(&mut self) {
        self.inner.base.stop();
    }
}

impl ComponentInner {
    /// A local write on an `out` or `io` pin; forward it while synced.
    pub(crate) fn pin_change(&self, pin: &Pin) {
        if !*self.connected.lock().expect("connected poisoned") {
            return; // the write stays local and unsynced
        }
        if pin.direction() == PinDirection::HalIn {
            return;
        }
        let mut wire_pin = proto::Pin {
            handle: Some(pin.handle()),
            r#type: Some(pin.value_type() as i32),
            ..Default::default()
        };
        fill_wire_value(&mut wire_pin, pin.value());
        let mut container = Container::default();
        container.pin.push(wire_pin);
        debug!(component = %self.name, pin = %pin.name(), "sending pin change");
        self.base.send_set(container);
    }

    fn update_connected(&self, connected: bool) {
        {
            let mut current = self.connected.lock().expect("connected poisoned");
            if *current == connected {
                return;
            }
            *current = connected;
            self.connected_condvar.notify_all();
        }
        self.connected_observers.notify(&connected);
    }
}

impl ComponentEventHandler for ComponentInner {
    fn add_pins(&self) {
        self.base.clear_halrcomp_topics();
        self.base.add_halrcomp_topic(&self.name);
    }

    fn remove_pins(&self) {
        self.pins_by_handle
            .lock()
            .expect("pins by handle poisoned")
            .clear();
    }

    fn unsync_pins(&self) {
        for pin in self.pins_by_name.lock().expect("pins poisoned").values() {
            pin.mark_unsynced();
        }
    }

    fn bind_component(&self) {
        if self.no_bind.load(Ordering::SeqCst) {
            self.base.no_bind();
            return;
        }
        let mut component = Component {
            name: Some(self.name.clone()),
            no_create: Some(self.no_create.load(Ordering::SeqCst)),
            ..Default::default()
        };
        for (name, pin) in self.pins_by_name.lock().expect("pins poisoned").iter() {
            let mut wire_pin = proto::Pin {
                name: Some(format!("{}.{}", self.name, name)),
                r#type: Some(pin.value_type() as i32),
                dir: Some(pin.direction() as i32),
                ..Default::default()
            };
            fill_wire_value(&mut wire_pin, pin.value());
            component.pin.push(wire_pin);
        }
        let mut container = Container::default();
        container.comp.push(component);
        debug!(component = %self.name, "sending bind request");
        self.base.send_bind(container);
    }

    fn set_connected(&self) {
        self.update_connected(true);
    }

    fn clear_connected(&self) {
        self.update_connected(false);
    }

    fn timeout(&self) {
        self.timeout_observers.notify(&());
    }

    fn halrcomp_full_update(&self, _topic: &str, rx: &Container) {
        let component = match rx.comp.first() {
            Some(component) => component,
            None => return, // empty message
        };
        for wire_pin in &component.pin {
            let full_name = wire_pin.name.as_deref().unwrap_or_default();
            // pin names on the wire carry the component name prefix
            let local_name = match full_name.split_once('.') {
                Some((_, rest)) => rest,
                None => full_name,
            };
            let pin = match self
                .pins_by_name
                .lock()
                .expect("pins poisoned")
                .get(local_name)
                .cloned()
            {
                Some(pin) => pin,
                None => {
                    warn!(component = %self.name, pin = %full_name, "server reported unknown pin");
                    continue;
                }
            };
            if let Some(handle) = wire_pin.handle {
                pin.set_handle(handle);
                self.pins_by_handle
                    .lock()
                    .expect("pins by handle poisoned")
                    .insert(handle, pin.clone());
            }
            if let Some(value) = wire_value(wire_pin) {
                pin.apply_update(value);
            }
        }
        self.base.pins_synced();
    }

    fn halrcomp_incremental_update(&self, _topic: &str, rx: &Container) {
        for wire_pin in &rx.pin {
            let handle = match wire_pin.handle {
                Some(handle) => handle,
                None => continue,
            };
            let pin = self
                .pins_by_handle
                .lock()
                .expect("pins by handle poisoned")
                .get(&handle)
                .cloned();
            match pin {
                Some(pin) => {
                    if let Some(value) = wire_value(wire_pin) {
                        pin.apply_update(value);
                    }
                }
                None => warn!(component = %self.name, handle, "update for unknown pin handle"),
            }
        }
    }
}

/// The typed value carried by a wire pin, if any.
fn wire_value(pin: &proto::Pin) -> Option<PinValue> {
    if let Some(value) = pin.halbit {
        Some(PinValue::Bit(value))
    } else if let Some(value) = pin.halfloat {
        Some(PinValue::Float(value))
    } else if let Some(value) = pin.hals32 {
        Some(PinValue::S32(value))
    } else {
        pin.halu32.map(PinValue::U32)
    }
}

/// Store `value` in the matching typed field.
fn fill_wire_value(pin: &mut proto::Pin, value: PinValue) {
    match value {
        PinValue::Bit(value) => pin.halbit = Some(value),
        PinValue::Float(value) => pin.halfloat = Some(value),
        PinValue::S32(value) => pin.hals32 = Some(value),
        PinValue::U32(value) => pin.halu32 = Some(value),
    }
}
