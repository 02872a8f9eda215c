//! Endpoint state machine for the machine status service.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use machinetalk_proto::{Container, ContainerType};
use tracing::{debug, trace};

use crate::base::StatusState;
use crate::channel::subscribe::{SubscribeChannel, SubscribeKind};
use crate::channel::{ChannelState, ObserverSet};
use crate::Result;

/// One sync-before-up subscribe channel plus the
/// down/trying/syncing/up endpoint machine.
///
/// The channel reports up after the first full update on any topic; the
/// endpoint stays in `syncing` until every configured topic delivered a
/// full update, then raises its `synced` edge exactly once per cycle.
#[derive(Clone)]
pub(crate) struct StatusBase {
    inner: Arc<StatusBaseInner>,
}

struct StatusBaseInner {
    debug_name: String,
    channel: SubscribeChannel,
    state: Mutex<StatusState>,
    topics: Mutex<BTreeSet<String>>,
    synced_topics: Mutex<BTreeSet<String>>,
    state_observers: ObserverSet<StatusState>,
    sync_observers: ObserverSet<bool>,
    message_observers: ObserverSet<(String, Container)>,
}

impl StatusBase {
    pub(crate) fn new(debug_name: impl Into<String>) -> Result<Self> {
        let debug_name = debug_name.into();
        let channel = SubscribeChannel::new(format!("{debug_name}-status"), SubscribeKind::Status)?;
        let inner = Arc::new(StatusBaseInner {
            debug_name,
            channel,
            state: Mutex::new(StatusState::Down),
            topics: Mutex::new(BTreeSet::new()),
            synced_topics: Mutex::new(BTreeSet::new()),
            state_observers: ObserverSet::new(),
            sync_observers: ObserverSet::new(),
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

        Ok(StatusBase { inner })
    }

    pub(crate) fn set_uri(&self, uri: &str) {
        self.inner.channel.set_uri(uri);
    }

    pub(crate) fn state(&self) -> StatusState {
        *self.inner.state.lock().expect("state poisoned")
    }

    pub(crate) fn add_topic(&self, topic: &str) {
        self.inner
            .topics
            .lock()
            .expect("topics poisoned")
            .insert(topic.to_owned());
        self.inner.channel.add_topic(topic);
    }

    pub(crate) fn clear_topics(&self) {
        self.inner.topics.lock().expect("topics poisoned").clear();
        self.inner.channel.clear_topics();
    }

    /// Subscribe and wait for full updates on every topic. Idempotent.
    pub(crate) fn start(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock().expect("state poisoned");
            if *state != StatusState::Down {
                return;
            }
            *state = StatusState::Trying;
        }
        debug!(endpoint = %inner.debug_name, "status endpoint trying");
        inner.state_observers.notify(&StatusState::Trying);
        inner.channel.start();
    }

    /// Idempotent.
    pub(crate) fn stop(&self) {
        let inner = &self.inner;
        let was_up = {
            let mut state = inner.state.lock().expect("state poisoned");
            if *state == StatusState::Down {
                return;
            }
            let was_up = *state == StatusState::Up;
            *state = StatusState::Down;
            was_up
        };
        inner.channel.stop();
        inner.synced_topics.lock().expect("synced topics poisoned").clear();
        debug!(endpoint = %inner.debug_name, "status endpoint down");
        if was_up {
            inner.sync_observers.notify(&false);
        }
        inner.state_observers.notify(&StatusState::Down);
    }

    pub(crate) fn on_state_changed(&self, observer: impl Fn(&StatusState) + Send + Sync + 'static) {
        self.inner.state_observers.subscribe(observer);
    }

    /// Fires `true` when every configured topic has delivered a full
    /// update, `false` when synchronisation is lost.
    pub(crate) fn on_sync_changed(&self, observer: impl Fn(&bool) + Send + Sync + 'static) {
        self.inner.sync_observers.subscribe(observer);
    }

    pub(crate) fn on_message_received(
        &self,
        observer: impl Fn(&(String, Container)) + Send + Sync + 'static,
    ) {
        self.inner.message_observers.subscribe(observer);
    }
}

impl StatusBaseInner {
    fn channel_state_changed(self: &Arc<Self>, channel_state: ChannelState) {
        enum Edge {
            Syncing,
            Lost { was_up: bool },
        }
        let edge = {
            let mut state = self.state.lock().expect("state poisoned");
            match (*state, channel_state) {
                (StatusState::Trying, ChannelState::Up) => {
                    *state = StatusState::Syncing;
                    Some(Edge::Syncing)
                }
                (StatusState::Syncing, ChannelState::Trying) => {
                    *state = StatusState::Trying;
                    Some(Edge::Lost { was_up: false })
                }
                (StatusState::Up, ChannelState::Trying) => {
                    *state = StatusState::Trying;
                    Some(Edge::Lost { was_up: true })
                }
                _ => None,
            }
        };
        match edge {
            Some(Edge::Syncing) => {
                debug!(endpoint = %self.debug_name, "status endpoint syncing");
                self.state_observers.notify(&StatusState::Syncing);
            }
            Some(Edge::Lost { was_up }) => {
                debug!(endpoint = %self.debug_name, "status endpoint lost its channel");
                self.synced_topics
                    .lock()
                    .expect("synced topics poisoned")
                    .clear();
                if was_up {
                    self.sync_observers.notify(&false);
                }
                self.state_observers.notify(&StatusState::Trying);
            }
            None => {}
        }
    }

    fn message_received(self: &Arc<Self>, topic: &str, rx: &Container) {
        // merge before any synced edge so waiters observe complete trees
        self.message_observers
            .notify(&(topic.to_owned(), rx.clone()));

        if rx.container_type() == Some(ContainerType::MtEmcstatFullUpdate) {
            trace!(endpoint = %self.debug_name, topic, "full update received");
            self.topic_synced(topic);
        }
    }

    fn topic_synced(self: &Arc<Self>, topic: &str) {
        let all_synced = {
            let topics = self.topics.lock().expect("topics poisoned");
            let mut synced = self.synced_topics.lock().expect("synced topics poisoned");
            synced.insert(topic.to_owned());
            *synced == *topics
        };
        if !all_synced {
            return;
        }
        let came_up = {
            let mut state = self.state.lock().expect("state poisoned");
            if *state == StatusState::Syncing {
                *state = StatusState::Up;
                true
            } else {
                false
            }
        };
        if came_up {
            debug!(endpoint = %self.debug_name, "status endpoint synced");
            self.sync_observers.notify(&true);
            self.state_observers.notify(&StatusState::Up);
        }
    }
}
