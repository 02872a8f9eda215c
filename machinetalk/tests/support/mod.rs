//! Stub Machinetalk servers for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use machinetalk_proto::{Container, ContainerType};
use prost::Message;

pub fn encode(container: &Container) -> Vec<u8> {
    container.encode_to_vec()
}

pub fn decode(frame: &[u8]) -> Container {
    Container::decode(frame).expect("stub received malformed container")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A ROUTER stub playing the server side of an RPC channel.
///
/// Pings are acknowledged automatically on the service thread; every
/// other request is handed to the test through [`StubRouter::requests`],
/// and replies queued with [`StubRouter::reply`] go out to the most
/// recently seen peer.
pub struct StubRouter {
    pub endpoint: String,
    requests: Receiver<Container>,
    replies: Sender<Container>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StubRouter {
    pub fn start() -> Self {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::ROUTER).unwrap();
        socket.set_linger(0).unwrap();
        socket.bind("tcp://127.0.0.1:*").unwrap();
        let endpoint = socket.get_last_endpoint().unwrap().unwrap();

        let (requests_tx, requests) = mpsc::channel();
        let (replies, replies_rx) = mpsc::channel::<Container>();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = std::thread::spawn(move || {
            let mut identity: Option<Vec<u8>> = None;
            while !stop_flag.load(Ordering::SeqCst) {
                if socket.poll(zmq::POLLIN, 20).unwrap_or(0) > 0 {
                    let frames = socket.recv_multipart(0).unwrap();
                    let container = decode(&frames[1]);
                    identity = Some(frames[0].clone());
                    if container.container_type() == Some(ContainerType::MtPing) {
                        let ack = Container::with_type(ContainerType::MtPingAcknowledge);
                        socket
                            .send_multipart([&frames[0][..], &encode(&ack)[..]], 0)
                            .unwrap();
                    } else {
                        let _ = requests_tx.send(container);
                    }
                }
                while let Ok(reply) = replies_rx.try_recv() {
                    if let Some(identity) = &identity {
                        socket
                            .send_multipart([&identity[..], &encode(&reply)[..]], 0)
                            .unwrap();
                    }
                }
            }
        });

        StubRouter {
            endpoint,
            requests,
            replies,
            stop,
            thread: Some(thread),
        }
    }

    /// Queue a reply to the most recently seen peer.
    pub fn reply(&self, container: Container) {
        self.replies.send(container).unwrap();
    }

    /// Next non-ping request, or `None` after `timeout`.
    pub fn recv_request(&self, timeout: Duration) -> Option<Container> {
        match self.requests.recv_timeout(timeout) {
            Ok(container) => Some(container),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Next request of the given kind, skipping others.
    pub fn recv_request_of(&self, kind: ContainerType, timeout: Duration) -> Option<Container> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let container = self.recv_request(remaining)?;
            if container.container_type() == Some(kind) {
                return Some(container);
            }
        }
    }
}

impl Drop for StubRouter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A PUB stub playing the server side of a subscribe channel.
pub struct StubPublisher {
    pub endpoint: String,
    socket: zmq::Socket,
}

impl StubPublisher {
    pub fn start() -> Self {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::PUB).unwrap();
        socket.set_linger(0).unwrap();
        socket.bind("tcp://127.0.0.1:*").unwrap();
        let endpoint = socket.get_last_endpoint().unwrap().unwrap();
        StubPublisher { endpoint, socket }
    }

    pub fn publish(&self, topic: &str, container: &Container) {
        self.socket
            .send_multipart([topic.as_bytes(), &encode(container)[..]], 0)
            .unwrap();
    }
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
