//! Topic-filtered subscribe channel that synchronises before it reports
//! up.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use machinetalk_proto::{Container, ContainerType};
use tracing::{debug, trace, warn};

use crate::channel::timer::HeartbeatTimer;
use crate::channel::{ChannelState, Heartbeat, ObserverSet, POLL_INTERVAL_MS};
use crate::codec;
use crate::Result;

/// Which update pair a [`SubscribeChannel`] synchronises on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SubscribeKind {
    /// Machine status topics (`motion`, `config`, …).
    Status,
    /// Remote HAL component pin updates.
    Halrcomp,
}

impl SubscribeKind {
    fn full_update(self) -> ContainerType {
        match self {
            SubscribeKind::Status => ContainerType::MtEmcstatFullUpdate,
            SubscribeKind::Halrcomp => ContainerType::MtHalrcompFullUpdate,
        }
    }

    fn incremental_update(self) -> ContainerType {
        match self {
            SubscribeKind::Status => ContainerType::MtEmcstatIncrementalUpdate,
            SubscribeKind::Halrcomp => ContainerType::MtHalrcompIncrementalUpdate,
        }
    }
}

/// A SUB channel that only reports `up` once the server delivered a full
/// snapshot, and that watches snapshot freshness with a heartbeat
/// afterwards.
///
/// While `trying`, incremental updates are dropped (there is no state to
/// merge them into) and pings are ignored; while `up`, any received frame
/// refreshes the liveness counter. A full update carrying
/// `pparams.keepalive_timer` overrides the heartbeat interval.
pub(crate) struct SubscribeChannel {
    inner: Arc<SubscribeInner>,
}

struct SubscribeInner {
    debug_name: String,
    kind: SubscribeKind,
    context: zmq::Context,
    uri: Mutex<String>,
    topics: Mutex<BTreeSet<String>>,
    shutdown_uri: String,
    shutdown_push: Mutex<zmq::Socket>,
    worker_generation: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Serialises start/stop/reconnect; never held while joining the
    /// worker or dispatching observers.
    ops: Mutex<()>,
    state: Mutex<ChannelState>,
    heartbeat: Heartbeat,
    error_string: Mutex<String>,
    state_observers: ObserverSet<ChannelState>,
    message_observers: ObserverSet<(String, Container)>,
    error_observers: ObserverSet<str>,
}

impl SubscribeChannel {
    pub(crate) fn new(debug_name: impl Into<String>, kind: SubscribeKind) -> Result<Self> {
        let debug_name = debug_name.into();
        let context = zmq::Context::new();
        let shutdown_uri = format!("inproc://shutdown-{}", uuid::Uuid::new_v4());
        let shutdown_push = context.socket(zmq::PUSH)?;
        shutdown_push.set_linger(0)?;
        shutdown_push.bind(&shutdown_uri)?;

        let inner = Arc::new(SubscribeInner {
            debug_name,
            kind,
            context,
            uri: Mutex::new(String::new()),
            topics: Mutex::new(BTreeSet::new()),
            shutdown_uri,
            shutdown_push: Mutex::new(shutdown_push),
            worker_generation: AtomicU64::new(0),
            worker: Mutex::new(None),
            ops: Mutex::new(()),
            state: Mutex::new(ChannelState::Down),
            heartbeat: Heartbeat::new(),
            error_string: Mutex::new(String::new()),
            state_observers: ObserverSet::new(),
            message_observers: ObserverSet::new(),
            error_observers: ObserverSet::new(),
        });

        let tick_target = Arc::downgrade(&inner);
        inner
            .heartbeat
            .install_timer(HeartbeatTimer::spawn(&inner.debug_name, move || {
                if let Some(inner) = tick_target.upgrade() {
                    inner.heartbeat_tick();
                }
            }));

        Ok(SubscribeChannel { inner })
    }

    pub(crate) fn set_uri(&self, uri: &str) {
        *self.inner.uri.lock().expect("uri poisoned") = uri.to_owned();
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.inner.state()
    }

    pub(crate) fn add_topic(&self, topic: &str) {
        self.inner
            .topics
            .lock()
            .expect("topics poisoned")
            .insert(topic.to_owned());
    }

    pub(crate) fn remove_topic(&self, topic: &str) {
        self.inner.topics.lock().expect("topics poisoned").remove(topic);
    }

    pub(crate) fn clear_topics(&self) {
        self.inner.topics.lock().expect("topics poisoned").clear();
    }

    pub(crate) fn on_state_changed(&self, observer: impl Fn(&ChannelState) + Send + Sync + 'static) {
        self.inner.state_observers.subscribe(observer);
    }

    pub(crate) fn on_message_received(
        &self,
        observer: impl Fn(&(String, Container)) + Send + Sync + 'static,
    ) {
        self.inner.message_observers.subscribe(observer);
    }

    pub(crate) fn on_error_string_changed(&self, observer: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.error_observers.subscribe(observer);
    }

    /// Subscribe to the configured topics and wait for a full update.
    /// Idempotent.
    pub(crate) fn start(&self) {
        let inner = &self.inner;
        {
            let _ops = inner.ops();
            if inner.state() != ChannelState::Down {
                return;
            }
            inner.spawn_worker();
            inner.set_state(ChannelState::Trying);
        }
        inner.state_observers.notify(&ChannelState::Trying);
    }

    /// Idempotent; safe to call from within an observer callback.
    pub(crate) fn stop(&self) {
        self.inner.stop();
    }
}

impl Drop for SubscribeChannel {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

// ===== impl SubscribeInner =====

impl SubscribeInner {
    fn ops(&self) -> MutexGuard<'_, ()> {
        self.ops.lock().expect("ops lock poisoned")
    }

    fn state(&self) -> ChannelState {
        *self.state.lock().expect("state poisoned")
    }

    fn set_state(&self, next: ChannelState) {
        *self.state.lock().expect("state poisoned") = next;
        debug!(channel = %self.debug_name, state = ?next, "subscribe channel state");
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

    fn stop(&self) {
        let retired;
        {
            let _ops = self.ops();
            if self.state() == ChannelState::Down {
                return;
            }
            self.heartbeat.stop_timer();
            retired = self.halt_worker();
            self.set_state(ChannelState::Down);
        }
        join_retired(retired);
        self.state_observers.notify(&ChannelState::Down);
    }

    fn halt_worker(&self) -> Option<JoinHandle<()>> {
        self.worker_generation.fetch_add(1, Ordering::SeqCst);
        let shutdown = self.shutdown_push.lock().expect("shutdown pipe poisoned");
        if let Err(err) = shutdown.send(&b" "[..], zmq::DONTWAIT) {
            trace!(channel = %self.debug_name, error = %err, "shutdown wakeup not delivered");
        }
        drop(shutdown);
        self.worker.lock().expect("worker handle poisoned").take()
    }

    fn spawn_worker(self: &Arc<Self>) {
        let generation = self.worker_generation.load(Ordering::SeqCst);
        let uri = self.uri.lock().expect("uri poisoned").clone();
        let inner = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("{}-socket", self.debug_name))
            .spawn(move || {
                if let Err(err) = inner.worker_loop(&uri, generation) {
                    warn!(channel = %inner.debug_name, error = %err, "subscribe worker failed");
                    inner.set_error_string(format!("socket error: {err}"));
                }
            })
            .expect("failed to spawn subscribe worker thread");
        *self.worker.lock().expect("worker handle poisoned") = Some(handle);
    }

    fn worker_loop(self: &Arc<Self>, uri: &str, generation: u64) -> zmq::Result<()> {
        let socket = self.context.socket(zmq::SUB)?;
        socket.set_linger(0)?;
        socket.connect(uri)?;
        // subscriptions are bound to socket creation
        for topic in self.topics.lock().expect("topics poisoned").iter() {
            socket.set_subscribe(topic.as_bytes())?;
        }

        let shutdown = self.context.socket(zmq::PULL)?;
        shutdown.set_linger(0)?;
        shutdown.connect(&self.shutdown_uri)?;

        debug!(channel = %self.debug_name, uri, "subscribe worker connected");
        loop {
            if self.worker_generation.load(Ordering::SeqCst) != generation {
                return Ok(());
            }
            let mut items = [
                socket.as_poll_item(zmq::POLLIN),
                shutdown.as_poll_item(zmq::POLLIN),
            ];
            zmq::poll(&mut items, POLL_INTERVAL_MS)?;
            let socket_readable = items[0].is_readable();
            let shutdown_readable = items[1].is_readable();
            drop(items);

            if shutdown_readable {
                let _ = shutdown.recv_bytes(0);
                continue;
            }
            if socket_readable {
                let frames = socket.recv_multipart(0)?;
                if frames.len() != 2 {
                    warn!(channel = %self.debug_name, frames = frames.len(), "dropped short multipart message");
                    continue;
                }
                let topic = String::from_utf8_lossy(&frames[0]).into_owned();
                self.frame_received(topic, &frames[1]);
            }
        }
    }

    fn frame_received(self: &Arc<Self>, topic: String, frame: &[u8]) {
        let container = match codec::decode(frame) {
            Ok(container) => container,
            Err(err) => {
                warn!(channel = %self.debug_name, error = %err, "dropped malformed container");
                self.set_error_string(format!("invalid container: {err}"));
                return;
            }
        };
        trace!(channel = %self.debug_name, topic, r#type = container.r#type, "received message");

        let state = self.state();
        if state == ChannelState::Up {
            // any message refreshes the heartbeat, pings included
            self.heartbeat.reset_liveness();
            self.heartbeat.reset_timer();
        }

        let container_type = container.container_type();
        if container_type == Some(ContainerType::MtPing) {
            return;
        }
        if container_type == Some(self.kind.full_update()) {
            if let Some(interval) = container.pparams.and_then(|p| p.keepalive_timer) {
                self.heartbeat.set_interval_ms(interval);
            }
            if state == ChannelState::Trying {
                self.heartbeat.reset_liveness();
                self.heartbeat.start_timer();
                self.set_state(ChannelState::Up);
                debug!(channel = %self.debug_name, topic, "full update received, channel up");
                self.state_observers.notify(&ChannelState::Up);
            }
        } else if container_type == Some(self.kind.incremental_update())
            && state == ChannelState::Trying
        {
            return; // nothing to merge into yet
        }

        self.message_observers.notify(&(topic, container));
    }

    fn heartbeat_tick(self: &Arc<Self>) {
        if self.state() != ChannelState::Up {
            return;
        }
        let liveness = self.heartbeat.decrement_liveness();
        if liveness == 0 {
            self.heartbeat_timeout();
        } else {
            self.heartbeat.reset_timer();
        }
    }

    /// Snapshot went stale: resubscribe and wait for a fresh full update.
    fn heartbeat_timeout(self: &Arc<Self>) {
        let retired;
        {
            let _ops = self.ops();
            if self.state() != ChannelState::Up {
                return;
            }
            warn!(channel = %self.debug_name, "heartbeat timeout, resubscribing");
            self.heartbeat.stop_timer();
            retired = self.halt_worker();
            self.spawn_worker();
            self.set_state(ChannelState::Trying);
        }
        join_retired(retired);
        self.state_observers.notify(&ChannelState::Trying);
    }
}

fn join_retired(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use machinetalk_proto::ProtocolParameters;
    use std::sync::mpsc;
    use std::time::Duration;

    fn publisher(context: &zmq::Context) -> (zmq::Socket, String) {
        let socket = context.socket(zmq::PUB).unwrap();
        socket.set_linger(0).unwrap();
        socket.bind("tcp://127.0.0.1:*").unwrap();
        let endpoint = socket.get_last_endpoint().unwrap().unwrap();
        (socket, endpoint)
    }

    fn publish(socket: &zmq::Socket, topic: &str, container: &Container) {
        socket
            .send_multipart([topic.as_bytes(), codec::encode(container).as_ref()], 0)
            .unwrap();
    }

    #[test]
    fn only_a_full_update_brings_the_channel_up() {
        let context = zmq::Context::new();
        let (server, endpoint) = publisher(&context);

        let channel = SubscribeChannel::new("test-sub", SubscribeKind::Status).unwrap();
        channel.set_uri(&endpoint);
        channel.add_topic("motion");
        let (state_tx, state_rx) = mpsc::channel();
        channel.on_state_changed(move |state| {
            let _ = state_tx.send(*state);
        });
        let (msg_tx, msg_rx) = mpsc::channel();
        channel.on_message_received(move |message: &(String, Container)| {
            let _ = msg_tx.send(message.clone());
        });

        channel.start();
        assert_eq!(state_rx.recv().unwrap(), ChannelState::Trying);

        // incremental updates while trying are dropped and do not
        // transition the channel
        let incremental = Container::with_type(ContainerType::MtEmcstatIncrementalUpdate);
        let full = Container::with_type(ContainerType::MtEmcstatFullUpdate);
        let mut state = None;
        for _ in 0..100 {
            publish(&server, "motion", &incremental);
            publish(&server, "motion", &full);
            if let Ok(next) = state_rx.recv_timeout(Duration::from_millis(50)) {
                state = Some(next);
                break;
            }
        }
        assert_eq!(state, Some(ChannelState::Up));

        let (topic, message) = msg_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(topic, "motion");
        assert_eq!(
            message.container_type(),
            Some(ContainerType::MtEmcstatFullUpdate)
        );

        channel.stop();
    }

    #[test]
    fn full_update_adopts_advertised_keepalive_and_times_out() {
        let context = zmq::Context::new();
        let (server, endpoint) = publisher(&context);

        let channel = SubscribeChannel::new("test-sub-keepalive", SubscribeKind::Status).unwrap();
        channel.set_uri(&endpoint);
        channel.add_topic("motion");
        let (state_tx, state_rx) = mpsc::channel();
        channel.on_state_changed(move |state| {
            let _ = state_tx.send(*state);
        });

        channel.start();
        assert_eq!(state_rx.recv().unwrap(), ChannelState::Trying);

        let mut full = Container::with_type(ContainerType::MtEmcstatFullUpdate);
        full.pparams = Some(ProtocolParameters {
            keepalive_timer: Some(100),
        });
        loop {
            publish(&server, "motion", &full);
            if let Ok(state) = state_rx.recv_timeout(Duration::from_millis(50)) {
                assert_eq!(state, ChannelState::Up);
                break;
            }
        }

        // silence for five 100 ms intervals drops the channel back to
        // trying
        let state = state_rx
            .recv_timeout(Duration::from_secs(3))
            .expect("up -> trying after advertised keepalive expired");
        assert_eq!(state, ChannelState::Trying);

        channel.stop();
    }
}
