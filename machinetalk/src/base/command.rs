//! Endpoint state machine for the machine command service.

use std::sync::{Arc, Mutex, Weak};

use machinetalk_proto::{Container, ContainerType};
use tracing::{debug, trace};

use crate::base::{join_notes, EndpointState};
use crate::channel::rpc::RpcClient;
use crate::channel::{ChannelState, ObserverSet};
use crate::Result;

/// One RPC channel plus the down/trying/up endpoint machine.
///
/// Routes `EMCCMD_EXECUTED` / `EMCCMD_COMPLETED` reply tickets and
/// service `ERROR` notes; everything else is forwarded to the message
/// observers untouched.
#[derive(Clone)]
pub(crate) struct CommandBase {
    inner: Arc<CommandBaseInner>,
}

struct CommandBaseInner {
    debug_name: String,
    channel: RpcClient,
    state: Mutex<EndpointState>,
    error_string: Mutex<String>,
    state_observers: ObserverSet<EndpointState>,
    connected_observers: ObserverSet<bool>,
    executed_observers: ObserverSet<u32>,
    completed_observers: ObserverSet<u32>,
    message_observers: ObserverSet<Container>,
    error_observers: ObserverSet<str>,
}

impl CommandBase {
    pub(crate) fn new(debug_name: impl Into<String>) -> Result<Self> {
        let debug_name = debug_name.into();
        let channel = RpcClient::new(format!("{debug_name}-command"))?;
        let inner = Arc::new(CommandBaseInner {
            debug_name,
            channel,
            state: Mutex::new(EndpointState::Down),
            error_string: Mutex::new(String::new()),
            state_observers: ObserverSet::new(),
            connected_observers: ObserverSet::new(),
            executed_observers: ObserverSet::new(),
            completed_observers: ObserverSet::new(),
            message_observers: ObserverSet::new(),
            error_observers: ObserverSet::new(),
        });

        let state_target = Arc::downgrade(&inner);
        inner.channel.on_state_changed(move |state| {
            if let Some(inner) = state_target.upgrade() {
                inner.channel_state_changed(*state);
            }
        });
        let message_target: Weak<CommandBaseInner> = Arc::downgrade(&inner);
        inner.channel.on_message_received(move |container| {
            if let Some(inner) = message_target.upgrade() {
                inner.message_received(container);
            }
        });

        Ok(CommandBase { inner })
    }

    pub(crate) fn set_uri(&self, uri: &str) {
        self.inner.channel.set_uri(uri);
    }

    pub(crate) fn uri(&self) -> String {
        self.inner.channel.uri()
    }

    pub(crate) fn state(&self) -> EndpointState {
        *self.inner.state.lock().expect("state poisoned")
    }

    pub(crate) fn error_string(&self) -> String {
        self.inner
            .error_string
            .lock()
            .expect("error string poisoned")
            .clone()
    }

    /// Connect the command channel. Idempotent.
    pub(crate) fn start(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock().expect("state poisoned");
            if *state != EndpointState::Down {
                return;
            }
            *state = EndpointState::Trying;
        }
        debug!(endpoint = %inner.debug_name, "command endpoint trying");
        inner.state_observers.notify(&EndpointState::Trying);
        inner.channel.start();
    }

    /// Disconnect. Idempotent.
    pub(crate) fn stop(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock().expect("state poisoned");
            if *state == EndpointState::Down {
                return;
            }
            *state = EndpointState::Down;
        }
        inner.channel.stop();
        debug!(endpoint = %inner.debug_name, "command endpoint down");
        inner.state_observers.notify(&EndpointState::Down);
        inner.connected_observers.notify(&false);
    }

    /// Queue a command container for transmission.
    pub(crate) fn send_command(&self, msg_type: ContainerType, container: Container) {
        self.inner.channel.send(msg_type, container);
    }

    pub(crate) fn on_state_changed(
        &self,
        observer: impl Fn(&EndpointState) + Send + Sync + 'static,
    ) {
        self.inner.state_observers.subscribe(observer);
    }

    pub(crate) fn on_connected_changed(&self, observer: impl Fn(&bool) + Send + Sync + 'static) {
        self.inner.connected_observers.subscribe(observer);
    }

    pub(crate) fn on_executed(&self, observer: impl Fn(&u32) + Send + Sync + 'static) {
        self.inner.executed_observers.subscribe(observer);
    }

    pub(crate) fn on_completed(&self, observer: impl Fn(&u32) + Send + Sync + 'static) {
        self.inner.completed_observers.subscribe(observer);
    }

    pub(crate) fn on_message_received(
        &self,
        observer: impl Fn(&Container) + Send + Sync + 'static,
    ) {
        self.inner.message_observers.subscribe(observer);
    }

    pub(crate) fn on_error_string_changed(
        &self,
        observer: impl Fn(&str) + Send + Sync + 'static,
    ) {
        self.inner.error_observers.subscribe(observer);
    }
}

impl CommandBaseInner {
    fn channel_state_changed(self: &Arc<Self>, channel_state: ChannelState) {
        let transition = {
            let mut state = self.state.lock().expect("state poisoned");
            match (*state, channel_state) {
                (EndpointState::Trying, ChannelState::Up) => {
                    *state = EndpointState::Up;
                    Some(EndpointState::Up)
                }
                (EndpointState::Up, ChannelState::Trying) => {
                    *state = EndpointState::Trying;
                    Some(EndpointState::Trying)
                }
                _ => None,
            }
        };
        match transition {
            Some(EndpointState::Up) => {
                debug!(endpoint = %self.debug_name, "command endpoint up");
                self.connected_observers.notify(&true);
                self.state_observers.notify(&EndpointState::Up);
            }
            Some(next) => {
                debug!(endpoint = %self.debug_name, "command endpoint lost its channel");
                self.connected_observers.notify(&false);
                self.state_observers.notify(&next);
            }
            None => {}
        }
    }

    fn message_received(&self, rx: &Container) {
        if let Some(interval) = rx.pparams.and_then(|p| p.keepalive_timer) {
            self.channel.set_keepalive_interval_ms(interval);
        }
        match rx.container_type() {
            Some(ContainerType::MtEmccmdExecuted) => {
                if let Some(ticket) = rx.reply_ticket {
                    trace!(endpoint = %self.debug_name, ticket, "command executed");
                    self.executed_observers.notify(&ticket);
                }
            }
            Some(ContainerType::MtEmccmdCompleted) => {
                if let Some(ticket) = rx.reply_ticket {
                    trace!(endpoint = %self.debug_name, ticket, "command completed");
                    self.completed_observers.notify(&ticket);
                }
            }
            Some(ContainerType::MtError) => {
                // a service error report does not change connection state
                self.set_error_string(join_notes(&rx.note));
            }
            _ => {}
        }
        self.message_observers.notify(rx);
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
}
