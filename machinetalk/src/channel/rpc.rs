//! Request/reply channel with ping/pong liveness.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
#[cfg(test)]
use std::time::Duration;

use machinetalk_proto::{Container, ContainerType};
use tracing::{debug, trace, warn};

use crate::channel::timer::HeartbeatTimer;
use crate::channel::{ChannelState, Heartbeat, ObserverSet, POLL_INTERVAL_MS};
use crate::codec;
use crate::Result;

/// Timeout for handing a frame to the worker; covers the window between
/// spawning the worker and its pipe connecting.
const PIPE_SEND_TIMEOUT_MS: i32 = 100;

/// A DEALER channel to a Machinetalk ROUTER service.
///
/// The channel continuously probes the peer with `PING` and expects any
/// traffic (usually `PING_ACKNOWLEDGE`) within five heartbeat intervals;
/// exhausted liveness tears the socket down and reconnects. Messages may
/// be sent in `trying` as well as `up`; `send` never blocks on the peer
/// because frames travel to the worker thread through an inproc pipe.
pub(crate) struct RpcClient {
    inner: Arc<RpcInner>,
}

struct RpcInner {
    debug_name: String,
    context: zmq::Context,
    identity: String,
    uri: Mutex<String>,
    shutdown_uri: String,
    pipe_uri: String,
    /// Wakes the worker out of `poll`; the generation counter is what
    /// actually retires it.
    shutdown_push: Mutex<zmq::Socket>,
    /// Outbound pipe; its mutex doubles as the transmit lock.
    pipe_push: Mutex<zmq::Socket>,
    /// Retires workers: a worker exits once this no longer matches the
    /// value it was spawned with.
    worker_generation: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Serialises start/stop/reconnect decisions. Never held while
    /// joining the worker or while dispatching observers.
    ops: Mutex<()>,
    state: Mutex<ChannelState>,
    heartbeat: Heartbeat,
    error_string: Mutex<String>,
    state_observers: ObserverSet<ChannelState>,
    message_observers: ObserverSet<Container>,
    error_observers: ObserverSet<str>,
}

impl RpcClient {
    pub(crate) fn new(debug_name: impl Into<String>) -> Result<Self> {
        let debug_name = debug_name.into();
        let context = zmq::Context::new();
        let instance = uuid::Uuid::new_v4();
        let shutdown_uri = format!("inproc://shutdown-{instance}");
        let pipe_uri = format!("inproc://pipe-{instance}");

        let shutdown_push = context.socket(zmq::PUSH)?;
        shutdown_push.set_linger(0)?;
        shutdown_push.bind(&shutdown_uri)?;
        let pipe_push = context.socket(zmq::PUSH)?;
        pipe_push.set_linger(0)?;
        pipe_push.set_sndtimeo(PIPE_SEND_TIMEOUT_MS)?;
        pipe_push.bind(&pipe_uri)?;

        let host = hostname::get()
            .map(|host| host.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_owned());

        let inner = Arc::new(RpcInner {
            debug_name,
            context,
            identity: format!("{host}-{instance}"),
            uri: Mutex::new(String::new()),
            shutdown_uri,
            pipe_uri,
            shutdown_push: Mutex::new(shutdown_push),
            pipe_push: Mutex::new(pipe_push),
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

        Ok(RpcClient { inner })
    }

    pub(crate) fn set_uri(&self, uri: &str) {
        *self.inner.uri.lock().expect("uri poisoned") = uri.to_owned();
    }

    pub(crate) fn uri(&self) -> String {
        self.inner.uri.lock().expect("uri poisoned").clone()
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.inner.state()
    }

    pub(crate) fn error_string(&self) -> String {
        self.inner
            .error_string
            .lock()
            .expect("error string poisoned")
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn set_heartbeat_interval(&self, interval: Duration) {
        self.inner.heartbeat.set_interval(interval);
    }

    /// Adopt a server-advertised keep-alive interval.
    pub(crate) fn set_keepalive_interval_ms(&self, interval: u32) {
        self.inner.heartbeat.set_interval_ms(interval);
    }

    pub(crate) fn on_state_changed(&self, observer: impl Fn(&ChannelState) + Send + Sync + 'static) {
        self.inner.state_observers.subscribe(observer);
    }

    pub(crate) fn on_message_received(&self, observer: impl Fn(&Container) + Send + Sync + 'static) {
        self.inner.message_observers.subscribe(observer);
    }

    pub(crate) fn on_error_string_changed(&self, observer: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.error_observers.subscribe(observer);
    }

    /// Open the socket and begin probing. Idempotent.
    pub(crate) fn start(&self) {
        let inner = &self.inner;
        {
            let _ops = inner.ops();
            if inner.state() != ChannelState::Down {
                return;
            }
            inner.spawn_worker();
            inner.heartbeat.reset_liveness();
            inner.heartbeat.start_timer();
            inner.set_state(ChannelState::Trying);
        }
        inner.send_ping();
        inner.state_observers.notify(&ChannelState::Trying);
    }

    /// Close the socket and stop the heartbeat. Idempotent; safe to call
    /// from within an observer callback.
    pub(crate) fn stop(&self) {
        self.inner.stop();
    }

    /// Queue a container for transmission. Allowed in `trying` as well as
    /// `up`; silently dropped when the channel is down.
    pub(crate) fn send(&self, msg_type: ContainerType, container: Container) {
        self.inner.send(msg_type, container);
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

// ===== impl RpcInner =====

impl RpcInner {
    fn ops(&self) -> MutexGuard<'_, ()> {
        self.ops.lock().expect("ops lock poisoned")
    }

    fn state(&self) -> ChannelState {
        *self.state.lock().expect("state poisoned")
    }

    fn set_state(&self, next: ChannelState) {
        *self.state.lock().expect("state poisoned") = next;
        debug!(channel = %self.debug_name, state = ?next, "rpc channel state");
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

    /// Retire the current worker: bump the generation, wake it out of
    /// `poll` and hand back its join handle.
    fn halt_worker(&self) -> Option<JoinHandle<()>> {
        self.worker_generation.fetch_add(1, Ordering::SeqCst);
        let shutdown = self.shutdown_push.lock().expect("shutdown pipe poisoned");
        if let Err(err) = shutdown.send(&b" "[..], zmq::DONTWAIT) {
            // worker not yet polling; it retires on the next poll round
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
                    warn!(channel = %inner.debug_name, error = %err, "rpc worker failed");
                    inner.set_error_string(format!("socket error: {err}"));
                }
            })
            .expect("failed to spawn rpc worker thread");
        *self.worker.lock().expect("worker handle poisoned") = Some(handle);
    }

    fn worker_loop(self: &Arc<Self>, uri: &str, generation: u64) -> zmq::Result<()> {
        let socket = self.context.socket(zmq::DEALER)?;
        socket.set_linger(0)?;
        socket.set_identity(self.identity.as_bytes())?;
        socket.connect(uri)?;

        let shutdown = self.context.socket(zmq::PULL)?;
        shutdown.set_linger(0)?;
        shutdown.connect(&self.shutdown_uri)?;
        let pipe = self.context.socket(zmq::PULL)?;
        pipe.set_linger(0)?;
        pipe.connect(&self.pipe_uri)?;

        debug!(channel = %self.debug_name, uri, "rpc worker connected");
        loop {
            if self.worker_generation.load(Ordering::SeqCst) != generation {
                return Ok(());
            }
            let mut items = [
                socket.as_poll_item(zmq::POLLIN),
                shutdown.as_poll_item(zmq::POLLIN),
                pipe.as_poll_item(zmq::POLLIN),
            ];
            zmq::poll(&mut items, POLL_INTERVAL_MS)?;
            let socket_readable = items[0].is_readable();
            let shutdown_readable = items[1].is_readable();
            let pipe_readable = items[2].is_readable();
            drop(items);

            if shutdown_readable {
                let _ = shutdown.recv_bytes(0);
                continue; // generation check decides whether to exit
            }
            if pipe_readable {
                let frame = pipe.recv_bytes(0)?;
                if let Err(err) = socket.send(frame, zmq::DONTWAIT) {
                    warn!(channel = %self.debug_name, error = %err, "dropped outbound frame");
                }
            }
            if socket_readable {
                let frame = socket.recv_bytes(0)?;
                self.frame_received(&frame);
            }
        }
    }

    fn frame_received(self: &Arc<Self>, frame: &[u8]) {
        let container = match codec::decode(frame) {
            Ok(container) => container,
            Err(err) => {
                warn!(channel = %self.debug_name, error = %err, "dropped malformed container");
                self.set_error_string(format!("invalid container: {err}"));
                return;
            }
        };
        trace!(channel = %self.debug_name, r#type = container.r#type, "received message");

        // any message counts as liveness evidence
        self.heartbeat.reset_liveness();
        self.heartbeat.reset_timer();
        let came_up = {
            let mut state = self.state.lock().expect("state poisoned");
            if *state == ChannelState::Trying {
                *state = ChannelState::Up;
                true
            } else {
                false
            }
        };
        if came_up {
            debug!(channel = %self.debug_name, "rpc channel up");
            self.state_observers.notify(&ChannelState::Up);
        }

        if container.container_type() == Some(ContainerType::MtPingAcknowledge) {
            return; // liveness evidence only
        }
        self.message_observers.notify(&container);
    }

    fn send(&self, msg_type: ContainerType, mut container: Container) {
        container.r#type = msg_type as i32;
        let frame = codec::encode(&container);
        {
            let pipe = self.pipe_push.lock().expect("transmit pipe poisoned");
            if let Err(err) = pipe.send(frame.as_ref(), 0) {
                warn!(channel = %self.debug_name, error = %err, "dropped send, channel has no worker");
                return;
            }
        }
        trace!(channel = %self.debug_name, r#type = msg_type as i32, "sent message");
        if self.state() != ChannelState::Down {
            self.heartbeat.reset_timer();
        }
    }

    fn send_ping(&self) {
        self.send(ContainerType::MtPing, Container::default());
    }

    fn heartbeat_tick(self: &Arc<Self>) {
        if self.state() == ChannelState::Down {
            return;
        }
        let liveness = self.heartbeat.decrement_liveness();
        if liveness == 0 {
            self.heartbeat_timeout();
        } else {
            self.send_ping(); // re-arms the timer on the send path
        }
    }

    /// Liveness exhausted: tear the socket down, reopen, probe again.
    fn heartbeat_timeout(self: &Arc<Self>) {
        let retired;
        let went_trying;
        {
            let _ops = self.ops();
            let state = self.state();
            if state == ChannelState::Down {
                return;
            }
            warn!(channel = %self.debug_name, "heartbeat timeout, reconnecting");
            retired = self.halt_worker();
            self.spawn_worker();
            self.heartbeat.reset_liveness();
            went_trying = state == ChannelState::Up;
            if went_trying {
                self.set_state(ChannelState::Trying);
            }
        }
        join_retired(retired);
        self.send_ping();
        if went_trying {
            self.state_observers.notify(&ChannelState::Trying);
        }
    }
}

fn join_retired(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        // stop() may be invoked from an observer running on the worker
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn router_endpoint(context: &zmq::Context) -> (zmq::Socket, String) {
        let router = context.socket(zmq::ROUTER).unwrap();
        router.set_linger(0).unwrap();
        router.bind("tcp://127.0.0.1:*").unwrap();
        let endpoint = router.get_last_endpoint().unwrap().unwrap();
        (router, endpoint)
    }

    fn recv_request(router: &zmq::Socket, timeout_ms: i64) -> Option<(Vec<u8>, Container)> {
        if !router.poll(zmq::POLLIN, timeout_ms).map(|n| n > 0).unwrap() {
            return None;
        }
        let frames = router.recv_multipart(0).unwrap();
        assert_eq!(frames.len(), 2, "identity + envelope");
        let container = codec::decode(&frames[1]).unwrap();
        Some((frames[0].clone(), container))
    }

    fn reply(router: &zmq::Socket, identity: &[u8], msg_type: ContainerType) {
        let container = Container::with_type(msg_type);
        router
            .send_multipart([identity, codec::encode(&container).as_ref()], 0)
            .unwrap();
    }

    #[test]
    fn comes_up_on_first_reply_and_filters_ping_acknowledge() {
        let context = zmq::Context::new();
        let (router, endpoint) = router_endpoint(&context);

        let channel = RpcClient::new("test-rpc").unwrap();
        channel.set_uri(&endpoint);
        let (state_tx, state_rx) = mpsc::channel();
        channel.on_state_changed(move |state| {
            let _ = state_tx.send(*state);
        });
        let (msg_tx, msg_rx) = mpsc::channel();
        channel.on_message_received(move |container: &Container| {
            let _ = msg_tx.send(container.clone());
        });

        channel.start();
        assert_eq!(state_rx.recv().unwrap(), ChannelState::Trying);

        let (identity, request) = recv_request(&router, 2000).expect("initial ping");
        assert_eq!(request.container_type(), Some(ContainerType::MtPing));
        reply(&router, &identity, ContainerType::MtPingAcknowledge);

        assert_eq!(state_rx.recv().unwrap(), ChannelState::Up);
        // ping acknowledge is liveness evidence, not a message
        assert!(msg_rx
            .recv_timeout(Duration::from_millis(200))
            .is_err());

        reply(&router, &identity, ContainerType::MtError);
        let received = msg_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received.container_type(), Some(ContainerType::MtError));

        channel.stop();
        channel.stop(); // idempotent
    }

    #[test]
    fn silent_server_triggers_reconnect() {
        let context = zmq::Context::new();
        let (router, endpoint) = router_endpoint(&context);

        let channel = RpcClient::new("test-rpc-liveness").unwrap();
        channel.set_uri(&endpoint);
        channel.set_heartbeat_interval(Duration::from_millis(200));
        let (state_tx, state_rx) = mpsc::channel();
        channel.on_state_changed(move |state| {
            let _ = state_tx.send(*state);
        });

        channel.start();
        assert_eq!(state_rx.recv().unwrap(), ChannelState::Trying);

        // answer the first ping, then go silent
        let (identity, request) = recv_request(&router, 2000).expect("initial ping");
        assert_eq!(request.container_type(), Some(ContainerType::MtPing));
        reply(&router, &identity, ContainerType::MtPingAcknowledge);
        assert_eq!(state_rx.recv().unwrap(), ChannelState::Up);

        // five missed intervals of 200 ms exhaust the liveness counter
        let state = state_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("up -> trying after liveness exhausted");
        assert_eq!(state, ChannelState::Trying);

        // the reconnected socket keeps emitting pings
        let (_, request) = recv_request(&router, 2000).expect("ping after reconnect");
        assert_eq!(request.container_type(), Some(ContainerType::MtPing));

        // no more than one reconnect per timeout window
        assert!(state_rx.recv_timeout(Duration::from_millis(300)).is_err());

        channel.stop();
    }

    #[test]
    fn send_is_allowed_while_trying() {
        let context = zmq::Context::new();
        let (router, endpoint) = router_endpoint(&context);

        let channel = RpcClient::new("test-rpc-send").unwrap();
        channel.set_uri(&endpoint);
        channel.start();

        let mut container = Container::default();
        container.ticket = Some(1);
        channel.send(ContainerType::MtEmcTaskAbort, container);

        let mut seen = Vec::new();
        while let Some((_, request)) = recv_request(&router, 1000) {
            seen.push(request.container_type().unwrap());
            if seen.contains(&ContainerType::MtEmcTaskAbort) {
                break;
            }
        }
        assert!(seen.contains(&ContainerType::MtEmcTaskAbort));

        channel.stop();
    }
}
