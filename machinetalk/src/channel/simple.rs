//! Subscribe channel without liveness, for error and log streams.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use machinetalk_proto::Container;
use tracing::{debug, trace, warn};

use crate::channel::{ChannelState, ObserverSet, POLL_INTERVAL_MS};
use crate::codec;
use crate::Result;

/// A plain SUB channel: `up` as soon as it is started, every received
/// container forwarded verbatim, no heartbeat.
///
/// Error and log streams are sparse by nature, so silence carries no
/// information and liveness is not tracked.
pub(crate) struct SimpleSubscribe {
    inner: Arc<SimpleInner>,
}

struct SimpleInner {
    debug_name: String,
    context: zmq::Context,
    uri: Mutex<String>,
    topics: Mutex<BTreeSet<String>>,
    shutdown_uri: String,
    shutdown_push: Mutex<zmq::Socket>,
    worker_generation: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
    ops: Mutex<()>,
    state: Mutex<ChannelState>,
    error_string: Mutex<String>,
    state_observers: ObserverSet<ChannelState>,
    message_observers: ObserverSet<(String, Container)>,
    error_observers: ObserverSet<str>,
}

impl SimpleSubscribe {
    pub(crate) fn new(debug_name: impl Into<String>) -> Result<Self> {
        let debug_name = debug_name.into();
        let context = zmq::Context::new();
        let shutdown_uri = format!("inproc://shutdown-{}", uuid::Uuid::new_v4());
        let shutdown_push = context.socket(zmq::PUSH)?;
        shutdown_push.set_linger(0)?;
        shutdown_push.bind(&shutdown_uri)?;

        Ok(SimpleSubscribe {
            inner: Arc::new(SimpleInner {
                debug_name,
                context,
                uri: Mutex::new(String::new()),
                topics: Mutex::new(BTreeSet::new()),
                shutdown_uri,
                shutdown_push: Mutex::new(shutdown_push),
                worker_generation: AtomicU64::new(0),
                worker: Mutex::new(None),
                ops: Mutex::new(()),
                state: Mutex::new(ChannelState::Down),
                error_string: Mutex::new(String::new()),
                state_observers: ObserverSet::new(),
                message_observers: ObserverSet::new(),
                error_observers: ObserverSet::new(),
            }),
        })
    }

    pub(crate) fn set_uri(&self, uri: &str) {
        *self.inner.uri.lock().expect("uri poisoned") = uri.to_owned();
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.inner.state.lock().expect("state poisoned")
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

    /// Subscribe and report up immediately. Idempotent.
    pub(crate) fn start(&self) {
        let inner = &self.inner;
        {
            let _ops = inner.ops();
            if *inner.state.lock().expect("state poisoned") != ChannelState::Down {
                return;
            }
            inner.spawn_worker();
            *inner.state.lock().expect("state poisoned") = ChannelState::Up;
        }
        inner.state_observers.notify(&ChannelState::Up);
    }

    /// Idempotent; safe to call from within an observer callback.
    pub(crate) fn stop(&self) {
        self.inner.stop();
    }
}

impl Drop for SimpleSubscribe {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl SimpleInner {
    fn ops(&self) -> MutexGuard<'_, ()> {
        self.ops.lock().expect("ops lock poisoned")
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
            let mut state = self.state.lock().expect("state poisoned");
            if *state == ChannelState::Down {
                return;
            }
            *state = ChannelState::Down;
            drop(state);
            self.worker_generation.fetch_add(1, Ordering::SeqCst);
            let shutdown = self.shutdown_push.lock().expect("shutdown pipe poisoned");
            if let Err(err) = shutdown.send(&b" "[..], zmq::DONTWAIT) {
                trace!(channel = %self.debug_name, error = %err, "shutdown wakeup not delivered");
            }
            drop(shutdown);
            retired = self.worker.lock().expect("worker handle poisoned").take();
        }
        if let Some(handle) = retired {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.state_observers.notify(&ChannelState::Down);
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
                match codec::decode(&frames[1]) {
                    Ok(container) => {
                        trace!(channel = %self.debug_name, topic, r#type = container.r#type, "received message");
                        self.message_observers.notify(&(topic, container));
                    }
                    Err(err) => {
                        warn!(channel = %self.debug_name, error = %err, "dropped malformed container");
                        self.set_error_string(format!("invalid container: {err}"));
                    }
                }
            }
        }
    }
}
