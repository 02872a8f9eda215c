//! Endpoint state machine for the machine error stream.

use std::sync::{Arc, Mutex};

use machinetalk_proto::{Container, ContainerType};
use tracing::debug;

use crate::base::EndpointState;
use crate::channel::simple::SimpleSubscribe;
use crate::channel::{ChannelState, ObserverSet};
use crate::Result;

const ERROR_KINDS: [ContainerType; 6] = [
    ContainerType::MtEmcNmlError,
    ContainerType::MtEmcNmlText,
    ContainerType::MtEmcNmlDisplay,
    ContainerType::MtEmcOperatorError,
    ContainerType::MtEmcOperatorText,
    ContainerType::MtEmcOperatorDisplay,
];

/// One liveness-free subscribe channel carrying NML and operator
/// error/text/display streams.
#[derive(Clone)]
pub(crate) struct ErrorBase {
    inner: Arc<ErrorBaseInner>,
}

struct ErrorBaseInner {
    debug_name: String,
    channel: SimpleSubscribe,
    state: Mutex<EndpointState>,
    state_observers: ObserverSet<EndpointState>,
    connected_observers: ObserverSet<bool>,
    message_observers: ObserverSet<(String, Container)>,
}

impl ErrorBase {
    pub(crate) fn new(debug_name: impl Into<String>) -> Result<Self> {
        let debug_name = debug_name.into();
        let channel = SimpleSubscribe::new(format!("{debug_name}-error"))?;
        let inner = Arc::new(ErrorBaseInner {
            debug_name,
            channel,
            state: Mutex::new(EndpointState::Down),
            state_observers: ObserverSet::new(),
            connected_observers: ObserverSet::new(),
            message_observers: ObserverSet::new(),
        });

        let state_target = Arc::downgrade(&inner);
        inner.channel.on_state_changed(move |state| {
            if let Some(inner) = state_target.upgrade() {
                inner.channel_state_changed(*state);
            }
        });
        let message_target = Arc::downgrade(&inner);
        inner.channel.on_message_received(move |message| {
            if let Some(inner) = message_target.upgrade() {
                inner.message_received(&message.0, &message.1);
            }
        });

        Ok(ErrorBase { inner })
    }

    pub(crate) fn set_uri(&self, uri: &str) {
        self.inner.channel.set_uri(uri);
    }

    pub(crate) fn state(&self) -> EndpointState {
        *self.inner.state.lock().expect("state poisoned")
    }

    pub(crate) fn add_topic(&self, topic: &str) {
        self.inner.channel.add_topic(topic);
    }

    pub(crate) fn clear_topics(&self) {
        self.inner.channel.clear_topics();
    }

    /// Idempotent.
    pub(crate) fn start(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock().expect("state poisoned");
            if *state != EndpointState::Down {
                return;
            }
            *state = EndpointState::Trying;
        }
        debug!(endpoint = %inner.debug_name, "error endpoint trying");
        inner.state_observers.notify(&EndpointState::Trying);
        inner.channel.start();
    }

    /// Idempotent.
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
        debug!(endpoint = %inner.debug_name, "error endpoint down");
        inner.state_observers.notify(&EndpointState::Down);
        inner.connected_observers.notify(&false);
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

    /// Fires for the six recognised error container kinds only.
    pub(crate) fn on_error_message_received(
        &self,
        observer: impl Fn(&(String, Container)) + Send + Sync + 'static,
    ) {
        self.inner.message_observers.subscribe(observer);
    }
}

impl ErrorBaseInner {
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
                debug!(endpoint = %self.debug_name, "error endpoint up");
                self.connected_observers.notify(&true);
                self.state_observers.notify(&EndpointState::Up);
            }
            Some(next) => {
                self.connected_observers.notify(&false);
                self.state_observers.notify(&next);
            }
            None => {}
        }
    }

    fn message_received(&self, topic: &str, rx: &Container) {
        let recognised = rx
            .container_type()
            .map(|kind| ERROR_KINDS.contains(&kind))
            .unwrap_or(false);
        if recognised {
            self.message_observers
                .notify(&(topic.to_owned(), rx.clone()));
        }
    }
}
