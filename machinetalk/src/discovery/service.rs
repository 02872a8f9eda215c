//! Logical name-to-URI bindings fed by DNS-SD records.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::channel::ObserverSet;

/// One resolved DNS-SD record as the browser backend reports it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Instance name, without the service type suffix.
    pub name: String,
    /// Full service type string, e.g. `_machinekit._tcp.local.`.
    pub type_string: String,
    /// Host name of the announcing server, e.g. `sandybox.local.`.
    pub server: String,
    /// Resolved numeric address of the server, when known.
    pub address: Option<IpAddr>,
    pub port: u16,
    /// TXT records: `service`, `dsn`, `uuid`, `version`, …
    pub txt: BTreeMap<String, String>,
}

impl ServiceRecord {
    pub fn dsn(&self) -> Option<&str> {
        self.txt.get("dsn").map(String::as_str)
    }

    pub fn uuid(&self) -> Option<&str> {
        self.txt.get("uuid").map(String::as_str)
    }

    pub fn version(&self) -> Option<u32> {
        self.txt.get("version").and_then(|v| v.parse().ok())
    }

    pub fn service_tag(&self) -> Option<&str> {
        self.txt.get("service").map(String::as_str)
    }

    /// The endpoint URI this record contributes.
    ///
    /// When the hostname inside the raw dsn is a case-insensitive
    /// substring of the record's server name (the `.local` case), it is
    /// rewritten to the resolved numeric address; any other dsn is
    /// surfaced unchanged.
    pub fn uri(&self) -> Option<String> {
        let dsn = self.dsn()?;
        let (scheme, rest) = match dsn.split_once("://") {
            Some(parts) => parts,
            None => return Some(dsn.to_owned()),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (rest, None),
        };
        if let Some(address) = self.address {
            if !host.is_empty()
                && self
                    .server
                    .to_ascii_lowercase()
                    .contains(&host.to_ascii_lowercase())
            {
                return Some(match port {
                    Some(port) => format!("{scheme}://{address}:{port}"),
                    None => format!("{scheme}://{address}"),
                });
            }
        }
        Some(dsn.to_owned())
    }
}

/// Additional constraints a record must satisfy before it is dispatched
/// to the registered services.
#[derive(Clone, Debug, Default)]
pub struct ServiceDiscoveryFilter {
    /// Substring that must occur in the instance name; empty matches all.
    pub name: String,
    /// TXT records that must be present with exactly these values
    /// (typically `uuid`).
    pub txt_records: BTreeMap<String, String>,
}

impl ServiceDiscoveryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_uuid(uuid: impl Into<String>) -> Self {
        let mut filter = Self::default();
        filter.txt_records.insert("uuid".to_owned(), uuid.into());
        filter
    }

    pub fn matches(&self, record: &ServiceRecord) -> bool {
        if !self.name.is_empty() && !record.name.contains(&self.name) {
            return false;
        }
        self.txt_records
            .iter()
            .all(|(key, value)| record.txt.get(key) == Some(value))
    }
}

/// A logical service: "the `halrcomp` endpoint of this machine",
/// resolved to a URI by whatever DNS-SD records currently back it.
///
/// All derived fields come from the first record in the list; `ready`
/// holds exactly while at least one matching record is present.
/// Cloning shares the underlying service.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    /// TXT `service` tag this service binds to, e.g. `command`.
    service_type: String,
    /// Base type the record's type string must contain, `_<base>._tcp`.
    typestring: String,
    data: Mutex<ServiceData>,
    ready_observers: ObserverSet<bool>,
    updated_observers: ObserverSet<()>,
}

#[derive(Default)]
struct ServiceData {
    records: Vec<ServiceRecord>,
    ready: bool,
    uri: String,
    uuid: String,
    version: u32,
    name: String,
    host_name: String,
    host_address: String,
}

impl Service {
    pub fn new(service_type: impl Into<String>) -> Self {
        Self::with_base_type(service_type, "machinekit")
    }

    pub fn with_base_type(service_type: impl Into<String>, base_type: &str) -> Self {
        Service {
            inner: Arc::new(ServiceInner {
                service_type: service_type.into(),
                typestring: format!("_{base_type}._tcp"),
                data: Mutex::new(ServiceData::default()),
                ready_observers: ObserverSet::new(),
                updated_observers: ObserverSet::new(),
            }),
        }
    }

    pub fn service_type(&self) -> &str {
        &self.inner.service_type
    }

    pub fn ready(&self) -> bool {
        self.lock().ready
    }

    pub fn uri(&self) -> String {
        self.lock().uri.clone()
    }

    pub fn uuid(&self) -> String {
        self.lock().uuid.clone()
    }

    pub fn version(&self) -> u32 {
        self.lock().version
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    pub fn host_name(&self) -> String {
        self.lock().host_name.clone()
    }

    pub fn host_address(&self) -> String {
        self.lock().host_address.clone()
    }

    pub fn on_ready_changed(&self, observer: impl Fn(&bool) + Send + Sync + 'static) {
        self.inner.ready_observers.subscribe(observer);
    }

    pub fn on_infos_updated(&self, observer: impl Fn(&()) + Send + Sync + 'static) {
        self.inner.updated_observers.subscribe(observer);
    }

    /// Whether `record` backs this service: its TXT `service` tag must
    /// equal the service type and its type string must contain the
    /// configured base type.
    pub fn matches(&self, record: &ServiceRecord) -> bool {
        record.service_tag() == Some(self.inner.service_type.as_str())
            && record.type_string.contains(&self.inner.typestring)
    }

    pub(crate) fn same_service(&self, other: &Service) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Add or refresh a record. Caller has already checked
    /// [`Service::matches`].
    pub(crate) fn upsert_record(&self, record: ServiceRecord) {
        let mut data = self.lock();
        match data.records.iter_mut().find(|r| r.name == record.name) {
            Some(existing) => *existing = record,
            None => data.records.push(record),
        }
        self.recompute(data);
    }

    pub(crate) fn remove_record(&self, name: &str) {
        let mut data = self.lock();
        data.records.retain(|record| record.name != name);
        self.recompute(data);
    }

    pub(crate) fn clear_records(&self) {
        let mut data = self.lock();
        data.records.clear();
        self.recompute(data);
    }

    fn lock(&self) -> MutexGuard<'_, ServiceData> {
        self.inner.data.lock().expect("service data poisoned")
    }

    /// Recompute every derived field from the current record list and
    /// fire `ready` only on an actual transition.
    fn recompute(&self, mut data: MutexGuard<'_, ServiceData>) {
        let ready = !data.records.is_empty()
            && data.records.iter().all(|record| self.matches(record));
        match data.records.first().cloned() {
            Some(first) => {
                data.uri = first.uri().unwrap_or_default();
                data.uuid = first.uuid().unwrap_or_default().to_owned();
                data.version = first.version().unwrap_or_default();
                data.name = first.name.clone();
                data.host_name = first.server.clone();
                data.host_address = first
                    .address
                    .map(|address| address.to_string())
                    .unwrap_or_default();
            }
            None => {
                data.uri.clear();
                data.uuid.clear();
                data.version = 0;
                data.name.clear();
                data.host_name.clear();
                data.host_address.clear();
            }
        }
        let transition = data.ready != ready;
        data.ready = ready;
        drop(data);

        if transition {
            debug!(service = %self.inner.service_type, ready, "service readiness changed");
            self.inner.ready_observers.notify(&ready);
        }
        self.inner.updated_observers.notify(&());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        name: &str,
        service: &str,
        server: &str,
        address: Option<IpAddr>,
        dsn: &str,
    ) -> ServiceRecord {
        let mut txt = BTreeMap::new();
        txt.insert("service".to_owned(), service.to_owned());
        txt.insert("dsn".to_owned(), dsn.to_owned());
        txt.insert("uuid".to_owned(), "12345678".to_owned());
        txt.insert("version".to_owned(), "3".to_owned());
        ServiceRecord {
            name: name.to_owned(),
            type_string: "_machinekit._tcp.local.".to_owned(),
            server: server.to_owned(),
            address,
            port: 5700,
            txt,
        }
    }

    #[test]
    fn local_hostname_is_rewritten_to_the_numeric_address() {
        let service = Service::new("halrcomp");
        let record = record(
            "Halrcomp on sandybox",
            "halrcomp",
            "sandybox.local",
            Some("10.0.0.10".parse().unwrap()),
            "tcp://sandybox.local:5700",
        );
        assert!(service.matches(&record));
        service.upsert_record(record);

        assert!(service.ready());
        assert_eq!(service.uri(), "tcp://10.0.0.10:5700");
        assert_eq!(service.uuid(), "12345678");
        assert_eq!(service.version(), 3);
        assert_eq!(service.host_name(), "sandybox.local");
        assert_eq!(service.host_address(), "10.0.0.10");
    }

    #[test]
    fn foreign_hostname_keeps_the_raw_dsn() {
        let service = Service::new("halrcomp");
        service.upsert_record(record(
            "Halrcomp on gateway",
            "halrcomp",
            "somehost.local",
            Some("10.0.0.11".parse().unwrap()),
            "tcp://gateway:5701",
        ));
        assert_eq!(service.uri(), "tcp://gateway:5701");
    }

    #[test]
    fn mismatched_service_tag_does_not_match() {
        let service = Service::new("command");
        let other = record(
            "Halrcomp on box",
            "halrcomp",
            "box.local",
            None,
            "tcp://box.local:5700",
        );
        assert!(!service.matches(&other));
    }

    #[test]
    fn ready_follows_the_record_list() {
        let service = Service::new("status");
        assert!(!service.ready());

        let transitions = Arc::new(Mutex::new(Vec::new()));
        {
            let transitions = Arc::clone(&transitions);
            service.on_ready_changed(move |ready| transitions.lock().unwrap().push(*ready));
        }

        let first = record(
            "Status on box",
            "status",
            "box.local",
            None,
            "tcp://box.local:5600",
        );
        service.upsert_record(first.clone());
        // refreshing an existing record is idempotent with respect to
        // readiness
        service.upsert_record(first);
        assert!(service.ready());

        service.remove_record("Status on box");
        assert!(!service.ready());
        assert_eq!(service.uri(), "");

        assert_eq!(*transitions.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn filter_requires_name_substring_and_txt_equality() {
        let record = record(
            "Status on sandybox",
            "status",
            "sandybox.local",
            None,
            "tcp://sandybox.local:5600",
        );

        assert!(ServiceDiscoveryFilter::new().matches(&record));

        let mut filter = ServiceDiscoveryFilter::new();
        filter.name = "sandybox".to_owned();
        assert!(filter.matches(&record));
        filter.name = "otherbox".to_owned();
        assert!(!filter.matches(&record));

        assert!(ServiceDiscoveryFilter::with_uuid("12345678").matches(&record));
        assert!(!ServiceDiscoveryFilter::with_uuid("87654321").matches(&record));
    }
}
