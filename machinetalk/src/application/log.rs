//! Public log endpoint.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use machinetalk_proto::{Container, MsgLevel, MsgOrigin};

use crate::base::log::LogBase;
use crate::channel::ObserverSet;
use crate::discovery::{Service, ServiceContainer};
use crate::sync::{deadline_after, wait_until};
use crate::Result;

/// A decoded log record.
#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    pub level: MsgLevel,
    pub origin: MsgOrigin,
    pub tag: String,
    pub pid: u32,
    pub text: String,
    /// Milliseconds since the epoch, from the container timestamp.
    pub timestamp_ms: i64,
}

/// Client for the machine log stream.
///
/// Records above the configured [`log_level`](Self::set_log_level) are
/// filtered out before listeners see them.
pub struct ApplicationLog {
    base: LogBase,
    services: ServiceContainer,
    log_service: Service,
    shared: Arc<LogShared>,
}

struct LogShared {
    connected: Mutex<bool>,
    connected_condvar: Condvar,
    log_level: AtomicI32,
    connected_observers: ObserverSet<bool>,
    message_observers: ObserverSet<LogRecord>,
}

impl ApplicationLog {
    pub fn new() -> Result<Self> {
        let base = LogBase::new("application")?;
        base.add_topic("log");
        let shared = Arc::new(LogShared {
            connected: Mutex::new(false),
            connected_condvar: Condvar::new(),
            log_level: AtomicI32::new(MsgLevel::MsgAll as i32),
            connected_observers: ObserverSet::new(),
            message_observers: ObserverSet::new(),
        });

        let connected_target = Arc::clone(&shared);
        base.on_connected_changed(move |connected| {
            connected_target.update_connected(*connected);
        });
        let message_target = Arc::clone(&shared);
        base.on_log_message_received(move |container| {
            message_target.message_received(container);
        });

        let log_service = Service::new("log");
        let services = ServiceContainer::new();
        services.add_service(&log_service);
        let ready_base = base.clone();
        let ready_service = log_service.clone();
        services.on_services_ready_changed(move |ready| {
            ready_base.set_uri(&ready_service.uri());
            if *ready {
                ready_base.start();
            } else {
                ready_base.stop();
            }
        });

        Ok(ApplicationLog {
            base,
            services,
            log_service,
            shared,
        })
    }

    pub fn services(&self) -> &ServiceContainer {
        &self.services
    }

    pub fn log_service(&self) -> &Service {
        &self.log_service
    }

    /// Point the endpoint at a fixed URI instead of discovery.
    pub fn set_log_uri(&self, uri: &str) {
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

    /// Records with a level above this are dropped; defaults to
    /// [`MsgLevel::MsgAll`].
    pub fn set_log_level(&self, level: MsgLevel) {
        self.shared.log_level.store(level as i32, Ordering::SeqCst);
    }

    pub fn log_level(&self) -> MsgLevel {
        MsgLevel::try_from(self.shared.log_level.load(Ordering::SeqCst))
            .unwrap_or(MsgLevel::MsgAll)
    }

    pub fn on_connected_changed(&self, observer: impl Fn(&bool) + Send + Sync + 'static) {
        self.shared.connected_observers.subscribe(observer);
    }

    pub fn on_message_received(&self, observer: impl Fn(&LogRecord) + Send + Sync + 'static) {
        self.shared.message_observers.subscribe(observer);
    }
}

impl Drop for ApplicationLog {
    fn drop(&mut self) {
        self.base.stop();
    }
}

impl LogShared {
    fn update_connected(&self, connected: bool) {
        {
            let mut current = self.connected.lock().expect("connected poisoned");
            *current = connected;
            self.connected_condvar.notify_all();
        }
        self.connected_observers.notify(&connected);
    }

    fn message_received(&self, rx: &Container) {
        let message = match &rx.log_message {
            Some(message) => message,
            None => return,
        };
        if message.level > self.log_level.load(Ordering::SeqCst) {
            return;
        }
        let record = LogRecord {
            level: MsgLevel::try_from(message.level).unwrap_or(MsgLevel::MsgAll),
            origin: MsgOrigin::try_from(message.origin).unwrap_or(MsgOrigin::MsgUlapi),
            tag: message.tag.clone().unwrap_or_default(),
            pid: message.pid.unwrap_or_default(),
            text: message.text.clone().unwrap_or_default(),
            timestamp_ms: timestamp_ms(rx.tv_sec, rx.tv_nsec),
        };
        self.message_observers.notify(&record);
    }
}

fn timestamp_ms(tv_sec: Option<i64>, tv_nsec: Option<i32>) -> i64 {
    tv_sec.unwrap_or_default() * 1000 + i64::from(tv_nsec.unwrap_or_default()) / 1_000_000
}
