//! Public error endpoint.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use machinetalk_proto::{Container, ContainerType};

use crate::base::error::ErrorBase;
use crate::channel::ObserverSet;
use crate::discovery::{Service, ServiceContainer};
use crate::sync::{deadline_after, wait_until};
use crate::Result;

const ERROR_TOPICS: [&str; 3] = ["error", "text", "display"];

/// One buffered NML or operator message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorMessage {
    pub kind: ContainerType,
    pub notes: Vec<String>,
}

/// Client for the machine error stream.
///
/// Messages are buffered; [`messages`](Self::messages) drains the
/// buffer.
pub struct ApplicationError {
    base: ErrorBase,
    services: ServiceContainer,
    error_service: Service,
    shared: Arc<ErrorShared>,
}

struct ErrorShared {
    connected: Mutex<bool>,
    connected_condvar: Condvar,
    buffer: Mutex<Vec<ErrorMessage>>,
    connected_observers: ObserverSet<bool>,
    message_observers: ObserverSet<ErrorMessage>,
}

impl ApplicationError {
    pub fn new() -> Result<Self> {
        let base = ErrorBase::new("application")?;
        for topic in ERROR_TOPICS {
            base.add_topic(topic);
        }
        let shared = Arc::new(ErrorShared {
            connected: Mutex::new(false),
            connected_condvar: Condvar::new(),
            buffer: Mutex::new(Vec::new()),
            connected_observers: ObserverSet::new(),
            message_observers: ObserverSet::new(),
        });

        let connected_target = Arc::clone(&shared);
        base.on_connected_changed(move |connected| {
            connected_target.update_connected(*connected);
        });
        let message_target = Arc::clone(&shared);
        base.on_error_message_received(move |message| {
            message_target.message_received(&message.1);
        });

        let error_service = Service::new("error");
        let services = ServiceContainer::new();
        services.add_service(&error_service);
        let ready_base = base.clone();
        let ready_service = error_service.clone();
        services.on_services_ready_changed(move |ready| {
            ready_base.set_uri(&ready_service.uri());
            if *ready {
                ready_base.start();
            } else {
                ready_base.stop();
            }
        });

        Ok(ApplicationError {
            base,
            services,
            error_service,
            shared,
        })
    }

    pub fn services(&self) -> &ServiceContainer {
        &self.services
    }

    pub fn error_service(&self) -> &Service {
        &self.error_service
    }

    /// Point the endpoint at a fixed URI instead of discovery.
    pub fn set_error_uri(&self, uri: &str) {
        self.base.set_uri(uri);
    }

    /// Subscribe without discovery. Idempotent.
    pub fn start(&self) {
        self.base.start();
    }

    /// Idempotent.
    pub fn stop(&self) {
        self.base.stop();
    }

    pub fn connected(&self) -> bool {
        *self.shared.connected.lock().expect("connected poisoned")
    }

    pub fn state(&self) -> crate::EndpointState {
        self.base.state()
    }

    pub fn wait_connected(&self, timeout: Option<Duration>) -> bool {
        let deadline = deadline_after(timeout);
        let mut connected = self.shared.connected.lock().expect("connected poisoned");
        loop {
            if *connected {
                return true;
            }
            let (guard, deadline_reached) =
                wait_until(&self.shared.connected_condvar, connected, deadline);
            connected = guard;
            if deadline_reached {
                return *connected;
            }
        }
    }

    pub fn on_connected_changed(&self, observer: impl Fn(&bool) + Send + Sync + 'static) {
        self.shared.connected_observers.subscribe(observer);
    }

    pub fn on_message_received(&self, observer: impl Fn(&ErrorMessage) + Send + Sync + 'static) {
        self.shared.message_observers.subscribe(observer);
    }

    /// All buffered messages; the buffer is drained.
    pub fn messages(&self) -> Vec<ErrorMessage> {
        std::mem::take(&mut *self.shared.buffer.lock().expect("buffer poisoned"))
    }
}

impl Drop for ApplicationError {
    fn drop(&mut self) {
        self.base.stop();
    }
}

impl ErrorShared {
    fn update_connected(&self, connected: bool) {
        {
            let mut current = self.connected.lock().expect("connected poisoned");
            *current = connected;
            self.connected_condvar.notify_all();
        }
        self.connected_observers.notify(&connected);
    }

    fn message_received(&self, rx: &Container) {
        let kind = match rx.container_type() {
            Some(kind) => kind,
            None => return,
        };
        let message = ErrorMessage {
            kind,
            notes: rx.note.clone(),
        };
        self.buffer.lock().expect("buffer poisoned").push(message.clone());
        self.message_observers.notify(&message);
    }
}
