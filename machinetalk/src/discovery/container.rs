//! Aggregation of several services behind one readiness flag.

use std::sync::{Arc, Mutex};

use crate::channel::ObserverSet;
use crate::discovery::Service;

/// A bag of [`Service`]s whose aggregate `services_ready` is the logical
/// AND of the members' readiness.
///
/// Endpoints own one container each and use its single ready edge as
/// their "turn me on / off" signal. Cloning shares the underlying
/// container.
#[derive(Clone)]
pub struct ServiceContainer {
    inner: Arc<ContainerInner>,
}

struct ContainerInner {
    services: Mutex<Vec<Service>>,
    ready: Mutex<bool>,
    ready_observers: ObserverSet<bool>,
}

impl ServiceContainer {
    pub fn new() -> Self {
        ServiceContainer {
            inner: Arc::new(ContainerInner {
                services: Mutex::new(Vec::new()),
                ready: Mutex::new(false),
                ready_observers: ObserverSet::new(),
            }),
        }
    }

    /// Add a member service; adding the same service twice has no
    /// effect.
    pub fn add_service(&self, service: &Service) {
        {
            let mut services = self.inner.services.lock().expect("services poisoned");
            if services.iter().any(|member| member.same_service(service)) {
                return;
            }
            services.push(service.clone());
        }
        // the observer must not keep the container alive
        let container = Arc::downgrade(&self.inner);
        service.on_ready_changed(move |_| {
            if let Some(inner) = container.upgrade() {
                inner.update_ready();
            }
        });
        self.inner.update_ready();
    }

    pub fn services(&self) -> Vec<Service> {
        self.inner
            .services
            .lock()
            .expect("services poisoned")
            .clone()
    }

    pub fn services_ready(&self) -> bool {
        *self.inner.ready.lock().expect("ready poisoned")
    }

    pub fn on_services_ready_changed(&self, observer: impl Fn(&bool) + Send + Sync + 'static) {
        self.inner.ready_observers.subscribe(observer);
    }
}

impl ContainerInner {
    fn update_ready(&self) {
        let ready = {
            let services = self.services.lock().expect("services poisoned");
            !services.is_empty() && services.iter().all(Service::ready)
        };
        {
            let mut current = self.ready.lock().expect("ready poisoned");
            if *current == ready {
                return;
            }
            *current = ready;
        }
        self.ready_observers.notify(&ready);
    }
}

impl Default for ServiceContainer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::ServiceRecord;
    use std::collections::BTreeMap;

    fn record(service: &str) -> ServiceRecord {
        let mut txt = BTreeMap::new();
        txt.insert("service".to_owned(), service.to_owned());
        txt.insert("dsn".to_owned(), "tcp://box.local:5600".to_owned());
        ServiceRecord {
            name: format!("{service} on box"),
            type_string: "_machinekit._tcp.local.".to_owned(),
            server: "box.local".to_owned(),
            address: None,
            port: 5600,
            txt,
        }
    }

    #[test]
    fn aggregate_ready_is_the_and_of_members() {
        let container = ServiceContainer::new();
        let command = Service::new("command");
        let status = Service::new("status");
        container.add_service(&command);
        container.add_service(&status);
        // registering the same service again adds it once
        container.add_service(&command);
        assert_eq!(container.services().len(), 2);

        let transitions = Arc::new(Mutex::new(Vec::new()));
        {
            let transitions = Arc::clone(&transitions);
            container
                .on_services_ready_changed(move |ready| transitions.lock().unwrap().push(*ready));
        }

        command.upsert_record(record("command"));
        assert!(!container.services_ready(), "one member still unresolved");

        status.upsert_record(record("status"));
        assert!(container.services_ready());

        command.remove_record("command on box");
        assert!(!container.services_ready());

        assert_eq!(*transitions.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn empty_container_is_not_ready() {
        assert!(!ServiceContainer::new().services_ready());
    }
}
