//! PUB channel for the log-service variant.

use std::sync::Mutex;

use machinetalk_proto::{Container, ContainerType};
use tracing::{debug, trace, warn};

use crate::channel::{ChannelState, ObserverSet};
use crate::codec;
use crate::Result;

/// A bound PUB socket publishing topic-framed containers.
///
/// Unlike the connecting channels there is nothing to poll: the socket
/// only ever transmits, so it is driven directly from the caller under the
/// transmit lock instead of through a worker thread.
pub(crate) struct Publisher {
    inner: PublisherInner,
}

struct PublisherInner {
    debug_name: String,
    context: zmq::Context,
    uri: Mutex<String>,
    /// Bound socket plus its resolved endpoint; the mutex doubles as the
    /// transmit lock.
    socket: Mutex<Option<BoundSocket>>,
    state_observers: ObserverSet<ChannelState>,
}

struct BoundSocket {
    socket: zmq::Socket,
    endpoint: String,
}

impl Publisher {
    pub(crate) fn new(debug_name: impl Into<String>) -> Self {
        Publisher {
            inner: PublisherInner {
                debug_name: debug_name.into(),
                context: zmq::Context::new(),
                uri: Mutex::new(String::new()),
                socket: Mutex::new(None),
                state_observers: ObserverSet::new(),
            },
        }
    }

    /// Endpoint to bind; `tcp://*:0` style wildcards pick an ephemeral
    /// port readable from [`Publisher::endpoint`] afterwards.
    pub(crate) fn set_uri(&self, uri: &str) {
        *self.inner.uri.lock().expect("uri poisoned") = uri.to_owned();
    }

    pub(crate) fn state(&self) -> ChannelState {
        if self.inner.socket.lock().expect("socket poisoned").is_some() {
            ChannelState::Up
        } else {
            ChannelState::Down
        }
    }

    /// The resolved endpoint while bound.
    pub(crate) fn endpoint(&self) -> Option<String> {
        self.inner
            .socket
            .lock()
            .expect("socket poisoned")
            .as_ref()
            .map(|bound| bound.endpoint.clone())
    }

    pub(crate) fn on_state_changed(&self, observer: impl Fn(&ChannelState) + Send + Sync + 'static) {
        self.inner.state_observers.subscribe(observer);
    }

    /// Bind the socket. Idempotent.
    pub(crate) fn start(&self) -> Result<()> {
        {
            let mut socket = self.inner.socket.lock().expect("socket poisoned");
            if socket.is_some() {
                return Ok(());
            }
            let uri = self.inner.uri.lock().expect("uri poisoned").clone();
            let publisher = self.inner.context.socket(zmq::PUB)?;
            publisher.set_linger(0)?;
            publisher.bind(&uri)?;
            let endpoint = publisher
                .get_last_endpoint()?
                .unwrap_or_else(|_| uri.clone());
            debug!(channel = %self.inner.debug_name, endpoint, "publisher bound");
            *socket = Some(BoundSocket {
                socket: publisher,
                endpoint,
            });
        }
        self.inner.state_observers.notify(&ChannelState::Up);
        Ok(())
    }

    /// Close the socket. Idempotent.
    pub(crate) fn stop(&self) {
        let was_up = self
            .inner
            .socket
            .lock()
            .expect("socket poisoned")
            .take()
            .is_some();
        if was_up {
            self.inner.state_observers.notify(&ChannelState::Down);
        }
    }

    /// Publish a container on `topic`. Dropped while down.
    pub(crate) fn send(&self, topic: &str, msg_type: ContainerType, mut container: Container) {
        container.r#type = msg_type as i32;
        let frame = codec::encode(&container);
        let socket = self.inner.socket.lock().expect("socket poisoned");
        match socket.as_ref() {
            Some(bound) => {
                if let Err(err) = bound
                    .socket
                    .send_multipart([topic.as_bytes(), frame.as_ref()], zmq::DONTWAIT)
                {
                    warn!(channel = %self.inner.debug_name, error = %err, "dropped published frame");
                } else {
                    trace!(channel = %self.inner.debug_name, topic, r#type = msg_type as i32, "published message");
                }
            }
            None => warn!(channel = %self.inner.debug_name, "dropped publish, channel is down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_binds_and_is_idempotent() {
        let publisher = Publisher::new("test-pub");
        publisher.set_uri("tcp://127.0.0.1:*");
        publisher.start().unwrap();
        publisher.start().unwrap();

        let endpoint = publisher.endpoint().unwrap();
        assert!(endpoint.starts_with("tcp://127.0.0.1:"));
        assert_eq!(publisher.state(), ChannelState::Up);

        publisher.stop();
        assert_eq!(publisher.state(), ChannelState::Down);
        assert!(publisher.endpoint().is_none());
    }

    #[test]
    fn published_frames_reach_a_subscriber() {
        let publisher = Publisher::new("test-pub-roundtrip");
        publisher.set_uri("tcp://127.0.0.1:*");
        publisher.start().unwrap();
        let endpoint = publisher.endpoint().unwrap();

        let context = zmq::Context::new();
        let subscriber = context.socket(zmq::SUB).unwrap();
        subscriber.set_linger(0).unwrap();
        subscriber.connect(&endpoint).unwrap();
        subscriber.set_subscribe(b"log").unwrap();

        // keep publishing until the late-joining subscriber sees a frame
        let mut received = None;
        for _ in 0..100 {
            publisher.send(
                "log",
                ContainerType::MtLogMessage,
                Container::default(),
            );
            if subscriber
                .poll(zmq::POLLIN, 50)
                .map(|events| events > 0)
                .unwrap()
            {
                received = Some(subscriber.recv_multipart(0).unwrap());
                break;
            }
        }
        let frames = received.expect("subscriber saw a published frame");
        assert_eq!(frames[0], b"log");
        let container = codec::decode(&frames[1]).unwrap();
        assert_eq!(container.container_type(), Some(ContainerType::MtLogMessage));

        publisher.stop();
    }
}
