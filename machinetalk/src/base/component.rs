//! Composite endpoint state machine for remote HAL components.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use machinetalk_proto::{Container, ContainerType};
use tracing::{debug, warn};

use crate::base::{join_notes, RemoteComponentState};
use crate::channel::rpc::RpcClient;
use crate::channel::subscribe::{SubscribeChannel, SubscribeKind};
use crate::channel::{ChannelState, ObserverSet};
use crate::Result;

/// Domain hooks the owning component provides to the state machine.
///
/// All hooks run on channel worker or timer threads.
pub(crate) trait ComponentEventHandler: Send + Sync {
    /// Entering `trying`: configure the halrcomp subscription.
    fn add_pins(&self);
    /// Final teardown on `stop`.
    fn remove_pins(&self);
    /// A channel was lost; mark every pin out of sync.
    fn unsync_pins(&self);
    /// Halrcmd is up: send the bind request or skip it via
    /// [`RemoteComponentBase::no_bind`].
    fn bind_component(&self);
    fn set_connected(&self);
    fn clear_connected(&self);
    /// The halrcomp channel went stale while synced.
    fn timeout(&self);
    fn halrcomp_full_update(&self, topic: &str, rx: &Container);
    fn halrcomp_incremental_update(&self, topic: &str, rx: &Container);
}

/// One RPC channel (halrcmd) plus one sync-before-up subscribe channel
/// (halrcomp), folded into the bind/sync/set machine of the remote
/// component protocol.
///
/// Bind and set rejects are terminal: the machine parks in `error` until
/// the component is stopped and started again.
#[derive(Clone)]
pub(crate) struct RemoteComponentBase {
    inner: Arc<ComponentBaseInner>,
}

struct ComponentBaseInner {
    debug_name: String,
    halrcmd: RpcClient,
    halrcomp: SubscribeChannel,
    state: Mutex<RemoteComponentState>,
    handler: OnceLock<Weak<dyn ComponentEventHandler>>,
    error_string: Mutex<String>,
    state_observers: ObserverSet<RemoteComponentState>,
    error_observers: ObserverSet<str>,
}

impl RemoteComponentBase {
    pub(crate) fn new(debug_name: impl Into<String>) -> Result<Self> {
        let debug_name = debug_name.into();
        let halrcmd = RpcClient::new(format!("{debug_name}-halrcmd"))?;
        let halrcomp =
            SubscribeChannel::new(format!("{debug_name}-halrcomp"), SubscribeKind::Halrcomp)?;
        let inner = Arc::new(ComponentBaseInner {
            debug_name,
            halrcmd,
            halrcomp,
            state: Mutex::new(RemoteComponentState::Down),
            handler: OnceLock::new(),
            error_string: Mutex::new(String::new()),
            state_observers: ObserverSet::new(),
            error_observers: ObserverSet::new(),
        });

        let cmd_state_target = Arc::downgrade(&inner);
        inner.halrcmd.on_state_changed(move |state| {
            if let Some(inner) = cmd_state_target.upgrade() {
                inner.halrcmd_state_changed(*state);
            }
        });
        let cmd_message_target = Arc::downgrade(&inner);
        inner.halrcmd.on_message_received(move |container| {
            if let Some(inner) = cmd_message_target.upgrade() {
                inner.halrcmd_message_received(container);
            }
        });
        let comp_state_target = Arc::downgrade(&inner);
        inner.halrcomp.on_state_changed(move |state| {
            if let Some(inner) = comp_state_target.upgrade() {
                inner.halrcomp_state_changed(*state);
            }
        });
        let comp_message_target = Arc::downgrade(&inner);
        inner.halrcomp.on_message_received(move |message| {
            if let Some(inner) = comp_message_target.upgrade() {
                inner.halrcomp_message_received(&message.0, &message.1);
            }
        });

        Ok(RemoteComponentBase { inner })
    }

    /// Install the domain hooks. Must happen before `start`.
    pub(crate) fn set_handler(&self, handler: Weak<dyn ComponentEventHandler>) {
        if self.inner.handler.set(handler).is_err() {
            warn!(endpoint = %self.inner.debug_name, "component handler installed twice");
        }
    }

    pub(crate) fn set_halrcmd_uri(&self, uri: &str) {
        self.inner.halrcmd.set_uri(uri);
    }

    pub(crate) fn set_halrcomp_uri(&self, uri: &str) {
        self.inner.halrcomp.set_uri(uri);
    }

    pub(crate) fn state(&self) -> RemoteComponentState {
        *self.inner.state.lock().expect("state poisoned")
    }

    pub(crate) fn error_string(&self) -> String {
        self.inner
            .error_string
            .lock()
            .expect("error string poisoned")
            .clone()
    }

    pub(crate) fn add_halrcomp_topic(&self, topic: &str) {
        self.inner.halrcomp.add_topic(topic);
    }

    pub(crate) fn clear_halrcomp_topics(&self) {
        self.inner.halrcomp.clear_topics();
    }

    /// Idempotent.
    pub(crate) fn start(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock().expect("state poisoned");
            if *state != RemoteComponentState::Down {
                return;
            }
            *state = RemoteComponentState::Trying;
        }
        debug!(endpoint = %inner.debug_name, "remote component trying");
        inner.with_handler(|handler| handler.add_pins());
        inner.state_observers.notify(&RemoteComponentState::Trying);
        inner.halrcmd.start();
    }

    /// Idempotent; the only way out of the `error` state.
    pub(crate) fn stop(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock().expect("state poisoned");
            if *state == RemoteComponentState::Down {
                return;
            }
            *state = RemoteComponentState::Down;
        }
        inner.halrcmd.stop();
        inner.halrcomp.stop();
        inner.with_handler(|handler| {
            handler.remove_pins();
            handler.clear_connected();
        });
        debug!(endpoint = %inner.debug_name, "remote component down");
        inner.state_observers.notify(&RemoteComponentState::Down);
    }

    /// Skip the bind handshake and subscribe directly; used to attach to
    /// a component known to exist on the server.
    pub(crate) fn no_bind(&self) {
        let inner = &self.inner;
        if inner.move_state(RemoteComponentState::Bind, RemoteComponentState::Syncing) {
            inner.state_observers.notify(&RemoteComponentState::Syncing);
            inner.halrcomp.start();
        }
    }

    /// The first full update has been applied to every pin.
    pub(crate) fn pins_synced(&self) {
        let inner = &self.inner;
        if inner.move_state(RemoteComponentState::Sync, RemoteComponentState::Synced) {
            debug!(endpoint = %inner.debug_name, "remote component synced");
            inner.with_handler(|handler| handler.set_connected());
            inner.state_observers.notify(&RemoteComponentState::Synced);
        }
    }

    /// Send the bind descriptor on halrcmd.
    pub(crate) fn send_bind(&self, container: Container) {
        let inner = &self.inner;
        inner.halrcmd.send(ContainerType::MtHalrcompBind, container);
        if inner.move_state(RemoteComponentState::Bind, RemoteComponentState::Binding) {
            inner.state_observers.notify(&RemoteComponentState::Binding);
        }
    }

    /// Send a pin change on halrcmd; legal only while synced.
    pub(crate) fn send_set(&self, container: Container) {
        self.inner
            .halrcmd
            .send(ContainerType::MtHalrcompSet, container);
    }

    pub(crate) fn on_state_changed(
        &self,
        observer: impl Fn(&RemoteComponentState) + Send + Sync + 'static,
    ) {
        self.inner.state_observers.subscribe(observer);
    }

    pub(crate) fn on_error_string_changed(
        &self,
        observer: impl Fn(&str) + Send + Sync + 'static,
    ) {
        self.inner.error_observers.subscribe(observer);
    }
}

impl ComponentBaseInner {
    fn with_handler(&self, f: impl FnOnce(&dyn ComponentEventHandler)) {
        if let Some(handler) = self.handler.get().and_then(Weak::upgrade) {
            f(handler.as_ref());
        }
    }

    /// Compare-and-set transition; returns whether it fired.
    fn move_state(&self, from: RemoteComponentState, to: RemoteComponentState) -> bool {
        let mut state = self.state.lock().expect("state poisoned");
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    fn set_error_string(&self, message: String) {
        {
            let mut current = self.error_string.lock().expect("error string poisoned");
            if *current == message {
                return;
            }
            *current = message.clone();
        }
        self.error_observers.notify(&message);
    }

    fn halrcmd_state_changed(self: &Arc<Self>, channel_state: ChannelState) {
        match channel_state {
            ChannelState::Up => {
                if self.move_state(RemoteComponentState::Trying, RemoteComponentState::Bind) {
                    debug!(endpoint = %self.debug_name, "halrcmd up, deciding on bind");
                    self.state_observers.notify(&RemoteComponentState::Bind);
                    self.with_handler(|handler| handler.bind_component());
                }
            }
            ChannelState::Trying => {
                let from_synced;
                {
                    let mut state = self.state.lock().expect("state poisoned");
                    match *state {
                        RemoteComponentState::Binding
                        | RemoteComponentState::Syncing
                        | RemoteComponentState::Sync
                        | RemoteComponentState::Synced => {
                            from_synced = *state == RemoteComponentState::Synced;
                            *state = RemoteComponentState::Trying;
                        }
                        _ => return,
                    }
                }
                debug!(endpoint = %self.debug_name, "halrcmd lost, component trying");
                self.halrcomp.stop();
                self.with_handler(|handler| {
                    if from_synced {
                        handler.unsync_pins();
                    }
                    handler.clear_connected();
                });
                self.state_observers.notify(&RemoteComponentState::Trying);
            }
            ChannelState::Down => {}
        }
    }

    fn halrcomp_state_changed(self: &Arc<Self>, channel_state: ChannelState) {
        match channel_state {
            ChannelState::Up => {
                if self.move_state(RemoteComponentState::Syncing, RemoteComponentState::Sync) {
                    debug!(endpoint = %self.debug_name, "halrcomp up, applying snapshot");
                    self.state_observers.notify(&RemoteComponentState::Sync);
                }
            }
            ChannelState::Trying => {
                if self.move_state(RemoteComponentState::Synced, RemoteComponentState::Syncing) {
                    debug!(endpoint = %self.debug_name, "halrcomp lost, component syncing");
                    self.with_handler(|handler| {
                        handler.unsync_pins();
                        handler.timeout();
                        handler.clear_connected();
                    });
                    self.state_observers.notify(&RemoteComponentState::Syncing);
                }
            }
            ChannelState::Down => {}
        }
    }

    fn halrcmd_message_received(self: &Arc<Self>, rx: &Container) {
        if let Some(interval) = rx.pparams.and_then(|p| p.keepalive_timer) {
            self.halrcmd.set_keepalive_interval_ms(interval);
        }
        match rx.container_type() {
            Some(ContainerType::MtHalrcompBindConfirm) => {
                if self.move_state(RemoteComponentState::Binding, RemoteComponentState::Syncing) {
                    debug!(endpoint = %self.debug_name, "bind confirmed");
                    self.state_observers.notify(&RemoteComponentState::Syncing);
                    self.halrcomp.start();
                }
            }
            Some(ContainerType::MtHalrcompBindReject) => {
                self.set_error_string(join_notes(&rx.note));
                if self.move_state(RemoteComponentState::Binding, RemoteComponentState::Error) {
                    warn!(endpoint = %self.debug_name, "bind rejected");
                    self.enter_error_state();
                }
            }
            Some(ContainerType::MtHalrcompSetReject) => {
                self.set_error_string(join_notes(&rx.note));
                if self.move_state(RemoteComponentState::Synced, RemoteComponentState::Error) {
                    warn!(endpoint = %self.debug_name, "set rejected");
                    self.enter_error_state();
                }
            }
            _ => {}
        }
    }

    fn halrcomp_message_received(self: &Arc<Self>, topic: &str, rx: &Container) {
        match rx.container_type() {
            Some(ContainerType::MtHalrcompFullUpdate) => {
                self.with_handler(|handler| handler.halrcomp_full_update(topic, rx));
            }
            Some(ContainerType::MtHalrcompIncrementalUpdate) => {
                self.with_handler(|handler| handler.halrcomp_incremental_update(topic, rx));
            }
            Some(ContainerType::MtHalrcompError) => {
                self.set_error_string(join_notes(&rx.note));
                if self.move_state(RemoteComponentState::Syncing, RemoteComponentState::Error) {
                    warn!(endpoint = %self.debug_name, "sync failed");
                    self.enter_error_state();
                }
            }
            _ => {}
        }
    }

    /// Terminal until `stop`: both channels closed, pins disconnected.
    fn enter_error_state(self: &Arc<Self>) {
        self.halrcomp.stop();
        self.halrcmd.stop();
        self.with_handler(|handler| handler.clear_connected());
        self.state_observers.notify(&RemoteComponentState::Error);
    }
}
