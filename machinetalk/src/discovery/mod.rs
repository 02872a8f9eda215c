//! DNS-SD service discovery.
//!
//! [`ServiceDiscovery`] browses for Machinetalk service announcements and
//! dispatches resolved records to the registered [`Service`]s. The actual
//! resolution transport sits behind the [`Browser`] contract; the default
//! backend is multicast DNS via `mdns-sd`. Endpoints group their services
//! in a [`ServiceContainer`] and come up once every member resolved.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use mdns_sd::{ServiceDaemon, ServiceEvent};
use tracing::{debug, trace, warn};

mod container;
mod service;

pub use container::ServiceContainer;
pub use service::{Service, ServiceDiscoveryFilter, ServiceRecord};

use crate::{Error, Result};

/// Default DNS-SD service type browsed for Machinetalk instances.
pub const MACHINEKIT_SERVICE_TYPE: &str = "_machinekit._tcp.local.";

/// Record-level events a browser backend reports.
#[derive(Clone, Debug)]
pub enum BrowserEvent {
    Added(ServiceRecord),
    Updated(ServiceRecord),
    Removed { name: String },
}

/// Contract between [`ServiceDiscovery`] and a DNS-SD resolution
/// transport.
///
/// The core only consumes record add/update/remove events; whether they
/// come from multicast, unicast DNS or a test fixture is the backend's
/// business.
pub trait Browser: Send {
    /// Begin browsing, delivering events through `events` until `stop`.
    fn start(&mut self, events: Sender<BrowserEvent>) -> Result<()>;

    fn stop(&mut self);
}

/// Multicast DNS-SD backend built on `mdns-sd`.
pub struct MdnsBrowser {
    service_type: String,
    daemon: Option<ServiceDaemon>,
    thread: Option<JoinHandle<()>>,
}

impl MdnsBrowser {
    pub fn new(service_type: impl Into<String>) -> Self {
        MdnsBrowser {
            service_type: service_type.into(),
            daemon: None,
            thread: None,
        }
    }
}

impl Browser for MdnsBrowser {
    fn start(&mut self, events: Sender<BrowserEvent>) -> Result<()> {
        let daemon =
            ServiceDaemon::new().map_err(|err| Error::Discovery(err.to_string()))?;
        let receiver = daemon
            .browse(&self.service_type)
            .map_err(|err| Error::Discovery(err.to_string()))?;

        let thread = thread::Builder::new()
            .name("mdns-browser".to_owned())
            .spawn(move || {
                while let Ok(event) = receiver.recv() {
                    let keep_going = match event {
                        ServiceEvent::ServiceResolved(info) => {
                            let record = ServiceRecord {
                                name: instance_name(info.get_fullname(), info.get_type()),
                                type_string: info.get_type().to_owned(),
                                server: info.get_hostname().to_owned(),
                                address: info.get_addresses().iter().next().copied(),
                                port: info.get_port(),
                                txt: info
                                    .get_properties()
                                    .iter()
                                    .map(|property| {
                                        (property.key().to_owned(), property.val_str().to_owned())
                                    })
                                    .collect(),
                            };
                            events.send(BrowserEvent::Added(record)).is_ok()
                        }
                        ServiceEvent::ServiceRemoved(type_string, fullname) => events
                            .send(BrowserEvent::Removed {
                                name: instance_name(&fullname, &type_string),
                            })
                            .is_ok(),
                        ServiceEvent::SearchStopped(_) => false,
                        _ => true,
                    };
                    if !keep_going {
                        break;
                    }
                }
            })
            .expect("failed to spawn mdns browser thread");

        self.daemon = Some(daemon);
        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            let _ = daemon.stop_browse(&self.service_type);
            let _ = daemon.shutdown();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn instance_name(fullname: &str, type_string: &str) -> String {
    fullname
        .strip_suffix(type_string)
        .map(|name| name.trim_end_matches('.').to_owned())
        .unwrap_or_else(|| fullname.to_owned())
}

/// Browses DNS-SD and keeps the registered [`Service`]s in sync with the
/// records that match them.
pub struct ServiceDiscovery {
    inner: Arc<DiscoveryInner>,
}

struct DiscoveryInner {
    services: Mutex<Vec<Service>>,
    filter: Mutex<ServiceDiscoveryFilter>,
    running: Mutex<Option<Running>>,
    idle_browser: Mutex<Option<Box<dyn Browser>>>,
}

struct Running {
    browser: Box<dyn Browser>,
    dispatcher: JoinHandle<()>,
}

impl ServiceDiscovery {
    /// Discovery over multicast DNS for the default `_machinekit._tcp`
    /// service type.
    pub fn new() -> Self {
        Self::with_browser(Box::new(MdnsBrowser::new(MACHINEKIT_SERVICE_TYPE)))
    }

    /// Discovery with a custom resolution backend (a unicast resolver, a
    /// test fixture, …).
    pub fn with_browser(browser: Box<dyn Browser>) -> Self {
        ServiceDiscovery {
            inner: Arc::new(DiscoveryInner {
                services: Mutex::new(Vec::new()),
                filter: Mutex::new(ServiceDiscoveryFilter::default()),
                running: Mutex::new(None),
                idle_browser: Mutex::new(Some(browser)),
            }),
        }
    }

    pub fn set_filter(&self, filter: ServiceDiscoveryFilter) {
        *self.inner.filter.lock().expect("filter poisoned") = filter;
    }

    /// Register a service for record dispatch.
    ///
    /// Registering twice adds the service once. Fails with
    /// [`Error::DiscoveryRunning`] while discovery is running.
    pub fn register(&self, service: &Service) -> Result<()> {
        self.ensure_stopped()?;
        let mut services = self.inner.services.lock().expect("services poisoned");
        if !services.iter().any(|member| member.same_service(service)) {
            services.push(service.clone());
        }
        Ok(())
    }

    /// Register every service of `container`.
    pub fn register_container(&self, container: &ServiceContainer) -> Result<()> {
        for service in container.services() {
            self.register(&service)?;
        }
        Ok(())
    }

    pub fn unregister(&self, service: &Service) -> Result<()> {
        self.ensure_stopped()?;
        self.inner
            .services
            .lock()
            .expect("services poisoned")
            .retain(|member| !member.same_service(service));
        Ok(())
    }

    /// Start browsing. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut running = self.inner.running.lock().expect("running poisoned");
        if running.is_some() {
            return Ok(());
        }
        let mut browser = self
            .inner
            .idle_browser
            .lock()
            .expect("browser poisoned")
            .take()
            .ok_or_else(|| Error::Discovery("browser backend already consumed".to_owned()))?;

        let (events_tx, events_rx) = mpsc::channel();
        if let Err(err) = browser.start(events_tx) {
            // keep the backend for a later retry
            *self.inner.idle_browser.lock().expect("browser poisoned") = Some(browser);
            return Err(err);
        }
        let dispatch_target = Arc::clone(&self.inner);
        let dispatcher = thread::Builder::new()
            .name("service-discovery".to_owned())
            .spawn(move || dispatch_target.dispatch_loop(events_rx))
            .expect("failed to spawn discovery dispatcher thread");

        debug!("service discovery started");
        *running = Some(Running {
            browser,
            dispatcher,
        });
        Ok(())
    }

    /// Stop browsing and clear every registered service. Idempotent.
    pub fn stop(&self) {
        let running = self.inner.running.lock().expect("running poisoned").take();
        if let Some(mut running) = running {
            running.browser.stop();
            let _ = running.dispatcher.join();
            *self.inner.idle_browser.lock().expect("browser poisoned") = Some(running.browser);
        }
        for service in self.inner.services.lock().expect("services poisoned").iter() {
            service.clear_records();
        }
        debug!("service discovery stopped");
    }

    pub fn running(&self) -> bool {
        self.inner.running.lock().expect("running poisoned").is_some()
    }

    fn ensure_stopped(&self) -> Result<()> {
        if self.running() {
            return Err(Error::DiscoveryRunning);
        }
        Ok(())
    }
}

impl Default for ServiceDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ServiceDiscovery {
    fn drop(&mut self) {
        self.stop();
    }
}

impl DiscoveryInner {
    fn dispatch_loop(&self, events: Receiver<BrowserEvent>) {
        for event in events {
            match event {
                BrowserEvent::Added(record) | BrowserEvent::Updated(record) => {
                    if !self.filter.lock().expect("filter poisoned").matches(&record) {
                        trace!(record = %record.name, "record rejected by filter");
                        continue;
                    }
                    let services = self.services.lock().expect("services poisoned").clone();
                    let mut dispatched = false;
                    for service in &services {
                        if service.matches(&record) {
                            service.upsert_record(record.clone());
                            dispatched = true;
                        }
                    }
                    if !dispatched {
                        warn!(record = %record.name, tag = ?record.service_tag(), "record matched no registered service");
                    }
                }
                BrowserEvent::Removed { name } => {
                    let services = self.services.lock().expect("services poisoned").clone();
                    for service in &services {
                        service.remove_record(&name);
                    }
                }
            }
        }
    }
}
